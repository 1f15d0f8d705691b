//! Hardware control of a light-sheet microscope.
//!
//! Builds on [`lsm_compiler_backend`], which turns imaging parameters into an analog-output
//! buffer, and drives the instrument around it:
//!
//! - [`daq`]: the analog-output board session (load, play, terminate).
//! - [`stage`]: the XY stage session (moves, recentering, position).
//! - [`coordinator`]: worker dispatch with per-device outstanding-operation counts.
//! - [`sequencer`]: the functional, time-lapse and structural imaging scripts.
//! - [`instrument`]: the [`Instrument`] handle composing all of the above.
//! - [`log`]: the message stream the UI renders.
//!
//! Vendor libraries sit behind the [`driver`] traits: `mccul` (feature `mcc_hardware`) and
//! `microdrive` (feature `mcl_hardware`) bind the real ones, [`sim`] simulates both.

pub mod config;
pub mod coordinator;
pub mod daq;
pub mod driver;
pub mod error;
pub mod instrument;
pub mod log;
pub mod sequencer;
pub mod sim;
pub mod stage;

#[cfg(feature = "mcc_hardware")]
pub mod mccul;
#[cfg(feature = "mcl_hardware")]
pub mod microdrive;

pub use crate::config::InstrumentConfig;
pub use crate::coordinator::{DeviceKind, TaskCoordinator, TaskHandle};
pub use crate::daq::{DaqSession, DaqState, PlaybackMode};
pub use crate::driver::Axis;
pub use crate::error::ControlError;
pub use crate::instrument::{Instrument, JogDirection, LimitSide, SoftLimits};
pub use crate::log::{MessageLog, MessageSink, StatusSignal};
pub use crate::sequencer::{AcquisitionHandle, AcquisitionMode, FunctionalSettings, StructuralPlan};
pub use crate::stage::{StageSession, StageSettings, StageState};
