//! Persisted configuration record.
//!
//! One JSON document holding the optical calibration, the last scan settings, stage velocities
//! and the board index. Missing sections fall back to their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use lsm_compiler_backend::{OpticalTrain, ScanSettings};

use crate::error::ControlError;
use crate::stage::StageSettings;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqSettings {
    /// Index into the USB inventory.
    pub board: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub optics: OpticalTrain,
    pub scan: ScanSettings,
    pub stage: StageSettings,
    pub daq: DaqSettings,
}

impl InstrumentConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ControlError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| ControlError::Config(format!("{}: {}", path.display(), err)))?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, ControlError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ControlError> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_record_takes_defaults() {
        let config =
            InstrumentConfig::from_json_str(r#"{"scan": {"fps": 40, "vps": 2.0}, "daq": {"board": 1}}"#)
                .unwrap();
        assert_eq!(config.scan.fps, 40);
        assert_eq!(config.scan.galvo1_range_um, ScanSettings::default().galvo1_range_um);
        assert_eq!(config.daq.board, 1);
        assert_eq!(config.stage, StageSettings::default());
        assert_eq!(config.optics, OpticalTrain::default());
    }

    #[test]
    fn malformed_record_is_config_error() {
        assert!(matches!(
            InstrumentConfig::from_json_str("{\"scan\": 3"),
            Err(ControlError::Config(_))
        ));
    }
}
