// Fixed constants of the optical train and the analog-output board, plus small helpers shared by
// the compiler and the controller.
use std::time::Instant;

use crate::error::SynthesisError;

/// Rolling-shutter read rate of the camera sensor, in sweeps per second.
pub const BASE_SWEEP_RATE_HZ: u32 = 80;
/// Maximum output throughput of the board, samples per second per channel.
pub const MAX_SAMPLE_RATE: u32 = 96_000;
/// Share of each oblique-scan ramp spent along the rolling-shutter direction.
pub const UP_RAMP_FRACTION: f64 = 0.96;
pub const NUM_CHANNELS: usize = 4;
pub const TRIGGER_HIGH_VOLTS: f64 = 5.0;
/// Laser selection voltage per laser index.
pub const LASER_VOLTS_PER_INDEX: f64 = 1.5;
pub const MAX_OUTPUT_VOLTS: f64 = 10.0;
/// Sample value the board maps to 0 V.
pub const MIDSCALE_SAMPLE: u16 = 32768;
/// Counts per volt of the board's ±10 V / 16-bit conversion.
pub const COUNTS_PER_VOLT: f64 = 3061.8;

/// Maps a voltage to the board's unsigned 16-bit sample value.
///
/// ```
/// # use lsm_compiler_backend::utils::volts_to_sample;
/// assert_eq!(volts_to_sample(0.0), 32768);
/// assert_eq!(volts_to_sample(10.0), 63386);
/// assert_eq!(volts_to_sample(-10.0), 2150);
/// ```
pub fn volts_to_sample(volts: f64) -> u16 {
    (MIDSCALE_SAMPLE as f64 + volts * COUNTS_PER_VOLT)
        .round()
        .clamp(0.0, u16::MAX as f64) as u16
}

/// Number of tiles needed to cover `range_um` with tiles of `fov_um`.
///
/// Integer division whose remainder, if any, adds one more tile so the whole range is imaged.
pub fn structural_steps(range_um: u32, fov_um: u32) -> Result<u32, SynthesisError> {
    if fov_um == 0 {
        return Err(SynthesisError::InvalidParameter(
            "field of view must be at least 1 µm to plan structural steps".to_string(),
        ));
    }
    let (steps, rem) = (range_um / fov_um, range_um % fov_um);
    Ok(if rem > 0 { steps + 1 } else { steps })
}

/// Rounds to 5 decimals, the precision stage positions are reported with.
pub fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}
