use ndarray::{s, Array1, ArrayViewMut1};

use crate::instruction::*;

/// One analog output line of the board (`ao0`..`ao3`), described as a contiguous program of
/// instructions starting at sample 0.
pub struct Channel {
    physical_name: String,
    instr_list: Vec<InstrBook>,
}

impl Channel {
    pub fn new(physical_name: &str) -> Self {
        Self {
            physical_name: physical_name.to_string(),
            instr_list: Vec::new(),
        }
    }

    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    /// Program length in samples.
    pub fn len(&self) -> usize {
        self.instr_list.last().map_or(0, |book| book.end_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `len` samples of `instr`. Zero-length segments are dropped.
    pub fn push(&mut self, len: usize, instr: Instruction) {
        let start_pos = self.len();
        if let Some(book) = InstrBook::new(start_pos, start_pos + len, instr) {
            tracing::trace!(chan = %self.physical_name, instr = %book.instr, start_pos, len, "segment");
            self.instr_list.push(book);
        }
    }

    pub fn constant(&mut self, len: usize, value: f64) {
        self.push(len, Instruction::new_const(value));
    }

    pub fn linspace(&mut self, len: usize, start: f64, stop: f64) {
        self.push(len, Instruction::new_linspace(start, stop));
    }

    /// Samples the program into `buffer`, which may be shorter than the program.
    ///
    /// A segment cut by the end of the buffer keeps the slope it has at full length.
    pub fn fill_signal(&self, buffer: &mut ArrayViewMut1<f64>) {
        let n = buffer.len();
        assert!(
            n <= self.len(),
            "Channel {} asked for {} samples but its program ends at {}",
            self.physical_name,
            n,
            self.len()
        );
        for book in self.instr_list.iter() {
            if book.start_pos >= n {
                break;
            }
            if book.end_pos <= n {
                let mut slice = buffer.slice_mut(s![book.start_pos..book.end_pos]);
                book.instr.eval_inplace(&mut slice);
            } else {
                let mut scratch = Array1::<f64>::zeros(book.len());
                book.instr.eval_inplace(&mut scratch.view_mut());
                buffer
                    .slice_mut(s![book.start_pos..n])
                    .assign(&scratch.slice(s![..n - book.start_pos]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(chan: &Channel, n: usize) -> Vec<f64> {
        let mut buffer = Array1::<f64>::zeros(n);
        chan.fill_signal(&mut buffer.view_mut());
        buffer.to_vec()
    }

    #[test]
    fn truncated_ramp_keeps_its_slope() {
        let mut chan = Channel::new("ao1");
        chan.linspace(5, 0.0, 4.0);
        chan.linspace(5, 4.0, 0.0);
        assert_eq!(sample(&chan, 7), vec![0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 3.0]);
    }

    #[test]
    fn zero_length_segments_are_skipped() {
        let mut chan = Channel::new("ao2");
        chan.constant(0, 5.0);
        chan.constant(3, 1.0);
        assert_eq!(chan.len(), 3);
        assert_eq!(sample(&chan, 3), vec![1.0; 3]);
    }
}
