//! Error type for the waveform compiler.
//!
//! Every failure raised by this crate is a configuration problem: the requested imaging
//! parameters cannot be turned into a valid output buffer. Nothing here touches hardware, so
//! all errors are recoverable by correcting the inputs and compiling again.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    /// The frame rate is not an exact integer multiple of the volume rate.
    #[error("Incompatible FPS & VPS combination ({fps} fps, {vps} vps): FPS must be an integer multiple of VPS")]
    IncompatibleRate { fps: u32, vps: f64 },

    #[error("Invalid imaging parameter: {0}")]
    InvalidParameter(String),
}
