//! Error types of the controller.
//!
//! Vendor codes keep their own types ([`UlError`] for the analog-output board, [`McoError`] for
//! the MicroDrive stage) and are wrapped by [`ControlError`], the error every session, task and
//! sequencer script returns.

use lsm_compiler_backend::SynthesisError;
use thiserror::Error;

/// Universal Library codes reporting that the board itself is gone.
pub const UL_BADBOARD: i32 = 1;
pub const UL_DEADDADEV: i32 = 4;
/// Not a Universal Library code: `cbWinBufAlloc` reports failure with a null handle.
pub const UL_ALLOC_FAILED: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("UL error {code}: {message}")]
pub struct UlError {
    pub code: i32,
    pub message: String,
}

impl UlError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self.code, UL_BADBOARD | UL_DEADDADEV)
    }
}

/// Error codes of the MicroDrive controller library.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum McoError {
    #[error("MCL_GENERAL_ERROR")]
    GeneralError,
    #[error("MCL_DEV_ERROR")]
    DevError,
    #[error("MCL_DEV_NOT_ATTACHED")]
    DevNotAttached,
    #[error("MCL_USAGE_ERROR")]
    UsageError,
    #[error("MCL_DEV_NOT_READY")]
    DevNotReady,
    #[error("MCL_ARGUMENT_ERROR")]
    ArgumentError,
    #[error("MCL_INVALID_AXIS")]
    InvalidAxis,
    #[error("MCL_INVALID_HANDLE")]
    InvalidHandle,
    /// Any code outside the documented table.
    #[error("connection to the stage controller lost")]
    ConnectionLost,
}

impl McoError {
    /// `None` for `MCL_SUCCESS`.
    ///
    /// ```
    /// # use lsm_ctrl_backend::error::McoError;
    /// assert_eq!(McoError::from_code(0), None);
    /// assert_eq!(McoError::from_code(-6), Some(McoError::ArgumentError));
    /// assert_eq!(McoError::from_code(-42), Some(McoError::ConnectionLost));
    /// ```
    pub fn from_code(code: i32) -> Option<Self> {
        use McoError::*;
        match code {
            0 => None,
            -1 => Some(GeneralError),
            -2 => Some(DevError),
            -3 => Some(DevNotAttached),
            -4 => Some(UsageError),
            -5 => Some(DevNotReady),
            -6 => Some(ArgumentError),
            -7 => Some(InvalidAxis),
            -8 => Some(InvalidHandle),
            _ => Some(ConnectionLost),
        }
    }

    pub fn code(&self) -> Option<i32> {
        use McoError::*;
        match self {
            GeneralError => Some(-1),
            DevError => Some(-2),
            DevNotAttached => Some(-3),
            UsageError => Some(-4),
            DevNotReady => Some(-5),
            ArgumentError => Some(-6),
            InvalidAxis => Some(-7),
            InvalidHandle => Some(-8),
            ConnectionLost => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// Imaging parameters rejected before any hardware action.
    #[error(transparent)]
    Configuration(#[from] SynthesisError),

    #[error("DAQ device not found: {0}")]
    DeviceNotFound(String),

    #[error("MCL stage connection failed. Is the device detectable?")]
    StageNotFound,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to allocate memory for DAQ output: {0}")]
    Allocation(String),

    #[error("A UL error occurred with MCC DAQ. Code: {}, Message: {}", .0.code, .0.message)]
    Daq(UlError),

    #[error("Stage error: {0}")]
    Motion(McoError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration record: {0}")]
    Config(String),
}

impl From<McoError> for ControlError {
    fn from(err: McoError) -> Self {
        match err {
            McoError::ConnectionLost => ControlError::ConnectionLost(err.to_string()),
            other => ControlError::Motion(other),
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Config(err.to_string())
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Config(err.to_string())
    }
}
