//! Optical calibration of the oblique-plane microscope.
//!
//! The light path is three objective/tube-lens pairs with a scan engine of three scan lenses
//! between the first two. [`OpticalTrain`] holds that description, as it is stored in the
//! configuration record, and derives from it everything the waveform compiler needs:
//!
//! - the galvo rotation (degrees) per µm of scan range, for both galvos;
//! - the overall system magnification and the camera field of view along X;
//! - the number of output samples per oblique-scan ramp.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SynthesisError;

/// Manufacturer of an objective. Decides the tube-lens focal length the objective is designed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveMake {
    Nikon,
    Leica,
    Mitutoyo,
    Olympus,
    Zeiss,
}

impl ObjectiveMake {
    /// Design tube-lens focal length, mm.
    pub fn tube_lens_focal_mm(&self) -> f64 {
        match self {
            ObjectiveMake::Nikon | ObjectiveMake::Leica | ObjectiveMake::Mitutoyo => 200.,
            ObjectiveMake::Olympus => 180.,
            ObjectiveMake::Zeiss => 165.,
        }
    }
}

impl fmt::Display for ObjectiveMake {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub make: ObjectiveMake,
    /// Label as engraved on the barrel, e.g. `"20X"` or `"60x/1.0W"`.
    pub magnification: String,
}

impl Objective {
    pub fn new(make: ObjectiveMake, magnification: &str) -> Self {
        Self {
            make,
            magnification: magnification.to_string(),
        }
    }

    /// Nominal magnification, read from the label by dropping every non-digit.
    ///
    /// ```
    /// # use lsm_compiler_backend::optics::*;
    /// assert_eq!(Objective::new(ObjectiveMake::Nikon, "20X").magnification_value().unwrap(), 20.);
    /// assert!(Objective::new(ObjectiveMake::Zeiss, "X").magnification_value().is_err());
    /// ```
    pub fn magnification_value(&self) -> Result<f64, SynthesisError> {
        let non_digits =
            Regex::new(r"\D").map_err(|err| SynthesisError::InvalidParameter(err.to_string()))?;
        let digits = non_digits.replace_all(&self.magnification, "");
        digits.parse::<u32>().map(f64::from).map_err(|_| {
            SynthesisError::InvalidParameter(format!(
                "objective magnification label {:?} carries no number",
                self.magnification
            ))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub pixel_size_um: f64,
    pub width_px: u32,
    pub height_px: u32,
}

/// The full optical description of the instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalTrain {
    pub galvo1_volts_per_degree: f64,
    pub galvo2_volts_per_degree: f64,
    pub objectives: [Objective; 3],
    pub tube_lenses_mm: [f64; 3],
    /// A scan lens that is not installed is `None`.
    pub scan_lenses_mm: [Option<f64>; 3],
    pub camera: Camera,
}

impl Default for OpticalTrain {
    fn default() -> Self {
        Self {
            galvo1_volts_per_degree: 1.0,
            galvo2_volts_per_degree: 1.0,
            objectives: [
                Objective::new(ObjectiveMake::Nikon, "20X"),
                Objective::new(ObjectiveMake::Nikon, "20X"),
                Objective::new(ObjectiveMake::Nikon, "20X"),
            ],
            tube_lenses_mm: [200., 200., 200.],
            scan_lenses_mm: [Some(75.), Some(75.), Some(75.)],
            camera: Camera {
                pixel_size_um: 11.,
                width_px: 1200,
                height_px: 1200,
            },
        }
    }
}

impl OpticalTrain {
    fn scan_lens(&self, idx: usize) -> Result<f64, SynthesisError> {
        match self.scan_lenses_mm[idx] {
            Some(fl) if fl > 0. => Ok(fl),
            _ => Err(SynthesisError::InvalidParameter(format!(
                "scan lens {} focal length is not set",
                idx + 1
            ))),
        }
    }

    /// `M · TL / F` of one objective/tube-lens pair.
    fn stage_magnification(&self, idx: usize) -> Result<f64, SynthesisError> {
        let objective = &self.objectives[idx];
        Ok(objective.magnification_value()? * self.tube_lenses_mm[idx]
            / objective.make.tube_lens_focal_mm())
    }

    /// Mechanical rotation of galvo 1 per µm of lateral scan range.
    pub fn galvo1_degrees_per_um(&self) -> Result<f64, SynthesisError> {
        let sl1 = self.scan_lens(0)?;
        let ratio = self.stage_magnification(0)? / (2. * sl1 * 1000.);
        Ok(ratio.atan().to_degrees())
    }

    /// Mechanical rotation of galvo 2 per µm of oblique scan range.
    pub fn galvo2_degrees_per_um(&self) -> Result<f64, SynthesisError> {
        let (sl1, sl2, sl3) = (self.scan_lens(0)?, self.scan_lens(1)?, self.scan_lens(2)?);
        let ratio = self.stage_magnification(0)? * sl2 / (2. * sl1 * sl3 * 1000.);
        Ok(ratio.atan().to_degrees())
    }

    /// Magnification from the sample to the camera sensor.
    pub fn system_magnification(&self) -> Result<f64, SynthesisError> {
        let (sl1, sl2) = (self.scan_lens(0)?, self.scan_lens(1)?);
        let mag = self.stage_magnification(0)? * (sl2 / sl1) / self.stage_magnification(1)?
            * self.stage_magnification(2)?;
        if !(mag.is_finite() && mag > 0.) {
            return Err(SynthesisError::InvalidParameter(format!(
                "system magnification {} is not positive",
                mag
            )));
        }
        Ok(mag)
    }

    /// Field of view along the camera width, whole µm.
    pub fn x_fov_um(&self) -> Result<u32, SynthesisError> {
        let cam = &self.camera;
        Ok((cam.width_px as f64 * cam.pixel_size_um / self.system_magnification()?).floor() as u32)
    }

    /// Samples per oblique-scan ramp: one per 6 sensor columns, since the pencil beam waist spans
    /// more than a dozen pixels. Without a second galvo a coarse 200 is enough.
    pub fn points_per_ramp(&self, galvo2_range_um: f64) -> u32 {
        if galvo2_range_um == 0. {
            return 200;
        }
        let even_width = self.camera.width_px - self.camera.width_px % 2;
        even_width / 6
    }
}
