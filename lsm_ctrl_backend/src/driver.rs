//! Vendor driver boundary.
//!
//! [`DaqDriver`] mirrors the handful of Universal Library calls the analog-output session needs,
//! [`StageDriver`] the MicroDrive calls of the stage session. Implementations: `mccul::UlDriver`
//! and `microdrive::MicroDriveDriver` behind the hardware features, and the simulators in
//! [`crate::sim`].

use serde::{Deserialize, Serialize};

use crate::error::{McoError, UlError};

/// Opaque handle of a buffer allocated in driver memory.
pub type MemHandle = usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardDescriptor {
    pub product_name: String,
    pub unique_id: String,
}

/// One background analog-output scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub low_chan: u32,
    pub high_chan: u32,
    /// Interleaved samples over all channels.
    pub total_samples: usize,
    /// Samples per second per channel.
    pub rate: u32,
    pub memhandle: MemHandle,
    pub continuous: bool,
}

pub trait DaqDriver: Send + Sync {
    fn inventory(&self) -> Result<Vec<BoardDescriptor>, UlError>;
    fn create_device(&self, board: u32, descriptor: &BoardDescriptor) -> Result<(), UlError>;
    fn release_device(&self, board: u32) -> Result<(), UlError>;
    fn num_da_chans(&self, board: u32) -> Result<u32, UlError>;

    fn buf_alloc(&self, samples: usize) -> Result<MemHandle, UlError>;
    fn buf_write(&self, memhandle: MemHandle, samples: &[u16]) -> Result<(), UlError>;
    fn buf_free(&self, memhandle: MemHandle) -> Result<(), UlError>;

    /// Starts a background scan and returns the rate the board actually runs at.
    fn aout_scan(&self, board: u32, request: &ScanRequest) -> Result<u32, UlError>;
    fn stop_background(&self, board: u32) -> Result<(), UlError>;
    /// Immediate single-sample write.
    fn aout(&self, board: u32, chan: u32, value: u16) -> Result<(), UlError>;
    fn is_running(&self, board: u32) -> Result<bool, UlError>;
}

/// Stage axes in lab coordinates. Axis 1 of the controller is Y.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Y,
    X,
}

impl Axis {
    pub fn index(self) -> u32 {
        match self {
            Axis::Y => 1,
            Axis::X => 2,
        }
    }
}

/// Motor properties reported by `MCL_MDInformation`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StageInfo {
    pub encoder_resolution_um: f64,
    pub microstep_mm: f64,
    pub max_velocity: f64,
    pub max_velocity_two_axis: f64,
    pub min_velocity: f64,
}

pub trait StageDriver: Send + Sync {
    /// A positive handle, or zero/negative when no stage answered.
    fn init_handle(&self) -> i32;
    fn release_handle(&self, handle: i32);
    fn serial_number(&self, handle: i32) -> i32;
    fn info(&self, handle: i32) -> Result<StageInfo, McoError>;

    /// Relative move; velocity in mm/s, distance in mm. Returns once the move is issued.
    fn move_axis(
        &self,
        handle: i32,
        axis: Axis,
        velocity: f64,
        distance_mm: f64,
    ) -> Result<(), McoError>;
    fn move_two_axes(
        &self,
        handle: i32,
        velocity: f64,
        y_mm: f64,
        x_mm: f64,
    ) -> Result<(), McoError>;
    /// Blocks until the current move has finished.
    fn wait(&self, handle: i32) -> Result<(), McoError>;
    fn position_microsteps(&self, handle: i32, axis: Axis) -> Result<i32, McoError>;
    fn stop(&self, handle: i32) -> Result<(), McoError>;
}
