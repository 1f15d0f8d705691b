//! Imaging parameters: the physical inputs of one sweep.
//!
//! [`ScanSettings`] is what the operator edits (µm, frame and volume rates, laser choice).
//! [`ImagingParameters`] is the same information resolved against the optical calibration into
//! galvo voltages, ready for [`crate::sweep::compile_sweep`].

use serde::{Deserialize, Serialize};

use crate::error::SynthesisError;
use crate::optics::OpticalTrain;
use crate::utils::*;

/// One galvo's scan, described in sample space (µm) together with its calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GalvoScan {
    pub range_um: f64,
    pub offset_um: f64,
    pub volts_per_degree: f64,
    pub degrees_per_um: f64,
}

impl GalvoScan {
    pub fn volts_per_um(&self) -> f64 {
        self.volts_per_degree * self.degrees_per_um
    }

    pub fn range_volts(&self) -> f64 {
        self.range_um * self.volts_per_um()
    }

    pub fn offset_volts(&self) -> f64 {
        self.offset_um * self.volts_per_um()
    }

    /// `(V_min, V_max)` of the scan, each limited to the ±10 V output span.
    pub fn voltage_bounds(&self) -> (f64, f64) {
        let (range, offset) = (self.range_volts(), self.offset_volts());
        (
            (offset - range / 2.).max(-MAX_OUTPUT_VOLTS),
            (offset + range / 2.).min(MAX_OUTPUT_VOLTS),
        )
    }
}

/// Operator-facing scan settings, as stored in the configuration record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub galvo1_range_um: f64,
    pub galvo1_offset_um: f64,
    pub galvo2_range_um: f64,
    pub galvo2_offset_um: f64,
    pub fps: u32,
    pub vps: f64,
    /// 0 selects no laser.
    pub laser_index: u32,
    pub trigger_active: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            galvo1_range_um: 100.,
            galvo1_offset_um: 0.,
            galvo2_range_um: 220.,
            galvo2_offset_um: 0.,
            fps: 80,
            vps: 4.,
            laser_index: 1,
            trigger_active: true,
        }
    }
}

/// Complete input of the waveform compiler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagingParameters {
    /// Lateral light-sheet sweep.
    pub galvo1: GalvoScan,
    /// Oblique-plane creation.
    pub galvo2: GalvoScan,
    pub fps: u32,
    pub vps: f64,
    pub laser_index: u32,
    pub trigger_active: bool,
    pub points_per_ramp: u32,
}

impl ImagingParameters {
    /// Resolves operator settings against the optical calibration.
    pub fn from_config(optics: &OpticalTrain, scan: &ScanSettings) -> Result<Self, SynthesisError> {
        let galvo1 = GalvoScan {
            range_um: scan.galvo1_range_um,
            offset_um: scan.galvo1_offset_um,
            volts_per_degree: optics.galvo1_volts_per_degree,
            degrees_per_um: optics.galvo1_degrees_per_um()?,
        };
        let galvo2 = GalvoScan {
            range_um: scan.galvo2_range_um,
            offset_um: scan.galvo2_offset_um,
            volts_per_degree: optics.galvo2_volts_per_degree,
            degrees_per_um: optics.galvo2_degrees_per_um()?,
        };
        Ok(Self {
            galvo1,
            galvo2,
            fps: scan.fps,
            vps: scan.vps,
            laser_index: scan.laser_index,
            trigger_active: scan.trigger_active,
            points_per_ramp: optics.points_per_ramp(scan.galvo2_range_um),
        })
    }

    /// Image planes in one sweep, `FPS / VPS`.
    pub fn image_planes(&self) -> Result<u32, SynthesisError> {
        image_planes(self.fps, self.vps)
    }

    pub fn laser_volts(&self) -> f64 {
        LASER_VOLTS_PER_INDEX * self.laser_index as f64
    }

    /// Copy with a different rate pair, for falling back to a known-good combination.
    pub fn with_rates(&self, fps: u32, vps: f64) -> Self {
        Self {
            fps,
            vps,
            ..self.clone()
        }
    }
}

/// Checks that `fps` is an exact integer multiple of `vps` and returns the ratio.
///
/// ```
/// # use lsm_compiler_backend::params::image_planes;
/// assert_eq!(image_planes(80, 4.), Ok(20));
/// assert_eq!(image_planes(80, 0.5), Ok(160));
/// assert!(image_planes(80, 3.).is_err());
/// ```
pub fn image_planes(fps: u32, vps: f64) -> Result<u32, SynthesisError> {
    if fps == 0 || !vps.is_finite() || vps <= 0. {
        return Err(SynthesisError::IncompatibleRate { fps, vps });
    }
    let ratio = fps as f64 / vps;
    let planes = ratio.round();
    if planes < 1. || (ratio - planes).abs() > 1e-9 * ratio.max(1.) {
        return Err(SynthesisError::IncompatibleRate { fps, vps });
    }
    Ok(planes as u32)
}
