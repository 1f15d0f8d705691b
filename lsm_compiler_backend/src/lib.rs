//! Waveform compiler of a light-sheet microscope.
//!
//! Turns imaging parameters (scan ranges, frame and volume rates, trigger mode, laser) into the
//! interleaved 4-channel sample buffer the analog-output board clocks out during one sweep.
//! Nothing in this crate touches hardware; see `lsm_ctrl_backend` for streaming.
//!
//! - [`optics`]: optical calibration, galvo degrees per µm and the camera field of view.
//! - [`params`]: operator scan settings and the resolved [`ImagingParameters`].
//! - [`sweep`]: compilation into a [`WaveformBuffer`], see [`compile_sweep`].
//! - [`channel`], [`instruction`]: the per-channel signal programs the sweep is built from.

pub mod channel;
pub mod error;
pub mod instruction;
pub mod optics;
pub mod params;
pub mod sweep;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use channel::*;
pub use error::*;
pub use optics::*;
pub use params::*;
pub use sweep::*;
pub use utils::*;
