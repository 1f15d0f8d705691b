//! Provides the primitive signal segments every output channel is assembled from.
//!
//! ## Main Structures and Enumerations:
//!
//! - `Instruction`: a single signal primitive. `Const` holds one voltage, `Linspace` interpolates
//!   linearly between two voltages with both endpoints included (the same sampling `numpy.linspace`
//!   uses, which the galvo ramps were calibrated against).
//!
//! - `InstrBook`: an instruction bound to the half-open sample interval `[start_pos, end_pos)` it
//!   covers inside a channel.
//!
//! ## Features:
//!
//! - Evaluation happens in place on an `ndarray` view, so a channel can write straight into its row
//!   of the device signal array without temporary allocations.

use std::fmt;

use ndarray::{Array1, ArrayViewMut1};

/// A signal primitive, in volts.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Const(f64),
    Linspace { start: f64, stop: f64 },
}

impl Instruction {
    /// Wrapper for conveniently creating constant instructions.
    /// ```
    /// # use lsm_compiler_backend::instruction::*;
    /// let hold = Instruction::new_const(1.5);
    /// ```
    pub fn new_const(value: f64) -> Instruction {
        Instruction::Const(value)
    }

    pub fn new_linspace(start: f64, stop: f64) -> Instruction {
        Instruction::Linspace { start, stop }
    }

    /// Evaluates the instruction over the whole view.
    ///
    /// A `Linspace` of length one evaluates to its start value; of length `n > 1` it reaches
    /// `stop` exactly on its last sample.
    ///
    /// ```
    /// use ndarray::Array1;
    /// use lsm_compiler_backend::instruction::*;
    ///
    /// let mut buf = Array1::<f64>::zeros(5);
    /// Instruction::new_linspace(0.0, 1.0).eval_inplace(&mut buf.view_mut());
    /// assert_eq!(buf.to_vec(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    /// ```
    pub fn eval_inplace(&self, t_arr: &mut ArrayViewMut1<f64>) {
        match *self {
            Instruction::Const(value) => t_arr.fill(value),
            Instruction::Linspace { start, stop } => {
                let n = t_arr.len();
                if n == 0 {
                    return;
                }
                if n == 1 {
                    t_arr[0] = start;
                } else {
                    t_arr.assign(&Array1::linspace(start, stop, n));
                }
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Instruction::Const(value) => write!(f, "[CONST, {{value: {}}}]", value),
            Instruction::Linspace { start, stop } => {
                write!(f, "[LINSPACE, {{start: {}, stop: {}}}]", start, stop)
            }
        }
    }
}

/// An instruction placed on a channel.
///
/// `start_pos` is inclusive while `end_pos` is exclusive.
pub struct InstrBook {
    pub start_pos: usize,
    pub end_pos: usize,
    pub instr: Instruction,
}

impl InstrBook {
    /// Returns `None` for an empty interval, which channels simply skip.
    pub fn new(start_pos: usize, end_pos: usize, instr: Instruction) -> Option<Self> {
        (end_pos > start_pos).then_some(InstrBook {
            start_pos,
            end_pos,
            instr,
        })
    }

    pub fn len(&self) -> usize {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_linspace_is_start() {
        let mut buf = Array1::<f64>::zeros(1);
        Instruction::new_linspace(2.0, -2.0).eval_inplace(&mut buf.view_mut());
        assert_eq!(buf[0], 2.0);
    }

    #[test]
    fn empty_book_is_rejected() {
        assert!(InstrBook::new(4, 4, Instruction::new_const(0.0)).is_none());
        assert_eq!(InstrBook::new(4, 9, Instruction::new_const(0.0)).unwrap().len(), 5);
    }
}
