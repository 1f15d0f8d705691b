//! Compiles [`ImagingParameters`] into the interleaved sample buffer of one sweep.
//!
//! A sweep is `image_planes` consecutive exposure windows of `samples_per_exposure` samples each.
//! The four analog outputs are assembled as [`Channel`] programs, sampled into a `(4, n)` array of
//! volts, converted to board samples and finally interleaved `ao0, ao1, ao2, ao3, ao0, ...`.
//!
//! | Channel | Drives | Waveform |
//! |---------|--------|----------|
//! | `ao0` | galvo 1, lateral sweep | staircase, one level per plane with a short ramp to the next |
//! | `ao1` | galvo 2, oblique plane | sawtooth, one cycle per ramp |
//! | `ao2` | camera trigger | one TTL pulse per plane, or flat zero |
//! | `ao3` | laser select | constant, 0 V on the final sample |
//!
//! The sample rate follows from the ramp resolution: `points_per_ramp · 80`, capped at the board
//! ceiling of 96 kS/s. When the cap applies the ramp resolution is lowered to match and
//! [`CompiledSweep::ppr_clamped`] is set.
//!
//! Compilation is a pure function of its input.

use std::time::Duration;

use ndarray::{s, Array1, Array2};

use crate::channel::Channel;
use crate::error::SynthesisError;
use crate::params::ImagingParameters;
use crate::utils::*;

/// The four analog outputs, in interleaving order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AoChannel {
    LateralGalvo,
    ObliqueGalvo,
    CameraTrigger,
    LaserSelect,
}

impl AoChannel {
    pub const ALL: [AoChannel; NUM_CHANNELS] = [
        AoChannel::LateralGalvo,
        AoChannel::ObliqueGalvo,
        AoChannel::CameraTrigger,
        AoChannel::LaserSelect,
    ];

    /// Position inside one interleaved frame.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn physical_name(self) -> &'static str {
        match self {
            AoChannel::LateralGalvo => "ao0",
            AoChannel::ObliqueGalvo => "ao1",
            AoChannel::CameraTrigger => "ao2",
            AoChannel::LaserSelect => "ao3",
        }
    }
}

/// Device-ready output buffer: `NUM_CHANNELS` interleaved channels of 16-bit samples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveformBuffer {
    samples: Vec<u16>,
}

impl WaveformBuffer {
    /// Wraps already interleaved samples. The length must be a non-zero multiple of 4.
    pub fn from_interleaved(samples: Vec<u16>) -> Result<Self, SynthesisError> {
        if samples.is_empty() || samples.len() % NUM_CHANNELS != 0 {
            return Err(SynthesisError::InvalidParameter(format!(
                "an interleaved buffer needs a non-zero multiple of {} samples, got {}",
                NUM_CHANNELS,
                samples.len()
            )));
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / NUM_CHANNELS
    }

    /// Samples of one channel in time order.
    pub fn channel(&self, chan: AoChannel) -> impl Iterator<Item = u16> + '_ {
        self.samples
            .iter()
            .skip(chan.index())
            .step_by(NUM_CHANNELS)
            .copied()
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.samples
    }

    pub fn into_vec(self) -> Vec<u16> {
        self.samples
    }
}

/// Result of a compilation: the buffer plus how it must be clocked out.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledSweep {
    pub buffer: WaveformBuffer,
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// Ramp resolution actually used, after the sample-rate cap.
    pub points_per_ramp: u32,
    pub image_planes: u32,
    pub samples_per_exposure: usize,
    pub ppr_clamped: bool,
}

impl CompiledSweep {
    /// Playback time of one pass through the buffer.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.buffer.samples_per_channel() as f64 / self.sample_rate as f64)
    }
}

/// Sample-count layout of a sweep, resolved from the parameters before anything is built.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepTiming {
    pub sample_rate: u32,
    pub points_per_ramp: usize,
    pub ppr_clamped: bool,
    pub image_planes: usize,
    pub samples_per_exposure: usize,
    pub up_ramp: usize,
    pub down_ramp: usize,
}

impl SweepTiming {
    pub fn new(params: &ImagingParameters) -> Result<Self, SynthesisError> {
        let image_planes = params.image_planes()? as usize;
        if params.points_per_ramp < 2 {
            return Err(SynthesisError::InvalidParameter(format!(
                "points per ramp must be at least 2, got {}",
                params.points_per_ramp
            )));
        }

        let unclamped_rate = params.points_per_ramp as u64 * BASE_SWEEP_RATE_HZ as u64;
        let (sample_rate, points_per_ramp, ppr_clamped) = if unclamped_rate > MAX_SAMPLE_RATE as u64 {
            (MAX_SAMPLE_RATE, MAX_SAMPLE_RATE / BASE_SWEEP_RATE_HZ, true)
        } else {
            (unclamped_rate as u32, params.points_per_ramp, false)
        };

        let samples_per_exposure = (sample_rate / params.fps) as usize;
        if samples_per_exposure < 2 {
            return Err(SynthesisError::InvalidParameter(format!(
                "{} fps leaves fewer than 2 samples per exposure at {} S/s",
                params.fps, sample_rate
            )));
        }

        let points_per_ramp = points_per_ramp as usize;
        let up_ramp = (UP_RAMP_FRACTION * points_per_ramp as f64).round() as usize;
        Ok(Self {
            sample_rate,
            points_per_ramp,
            ppr_clamped,
            image_planes,
            samples_per_exposure,
            up_ramp,
            down_ramp: points_per_ramp - up_ramp,
        })
    }

    /// Samples per channel.
    pub fn total_samps(&self) -> usize {
        self.image_planes * self.samples_per_exposure
    }

    /// Length of the plane-to-plane transition of the lateral galvo.
    ///
    /// Exposures longer than one ramp stretch it proportionally.
    pub fn plane_down_ramp(&self) -> usize {
        let stretch = (self.samples_per_exposure / self.points_per_ramp).max(1);
        (self.down_ramp * stretch).min(self.samples_per_exposure)
    }
}

/// The four channel programs of one sweep.
pub struct SweepProgram {
    timing: SweepTiming,
    channels: [Channel; NUM_CHANNELS],
}

impl SweepProgram {
    pub fn new(params: &ImagingParameters) -> Result<Self, SynthesisError> {
        let timing = SweepTiming::new(params)?;
        let laser_volts = params.laser_volts();
        if laser_volts > MAX_OUTPUT_VOLTS {
            return Err(SynthesisError::InvalidParameter(format!(
                "laser index {} asks for {} V, above the {} V output span",
                params.laser_index, laser_volts, MAX_OUTPUT_VOLTS
            )));
        }

        let channels = [
            lateral_staircase(&timing, params),
            oblique_sawtooth(&timing, params),
            camera_trigger(&timing, params.trigger_active),
            laser_select(&timing, laser_volts),
        ];
        Ok(Self { timing, channels })
    }

    pub fn timing(&self) -> &SweepTiming {
        &self.timing
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Samples every channel into a `(4, n)` array of volts, one row per channel.
    pub fn calc_signal(&self) -> Array2<f64> {
        let nsamps = self.timing.total_samps();
        let mut buffer = Array2::<f64>::zeros((NUM_CHANNELS, nsamps));
        for (i, chan) in self.channels.iter().enumerate() {
            let mut row = buffer.slice_mut(s![i, ..]);
            chan.fill_signal(&mut row);
        }
        buffer
    }

    /// Converts to board samples and interleaves.
    pub fn compile(&self) -> CompiledSweep {
        let mut timer = TickTimer::new();
        let signal = self.calc_signal();
        timer.tick_log("sampled channel programs");

        // Walking the transposed view in logical order yields ao0, ao1, ao2, ao3 per sample
        let samples: Vec<u16> = signal.t().iter().map(|&v| volts_to_sample(v)).collect();
        timer.tick_log("mapped and interleaved samples");

        let timing = &self.timing;
        tracing::debug!(
            "compiled sweep: {} planes x {} samples at {} S/s ({} samples per ramp{})",
            timing.image_planes,
            timing.samples_per_exposure,
            timing.sample_rate,
            timing.points_per_ramp,
            if timing.ppr_clamped { ", clamped" } else { "" }
        );
        CompiledSweep {
            buffer: WaveformBuffer { samples },
            sample_rate: timing.sample_rate,
            points_per_ramp: timing.points_per_ramp as u32,
            image_planes: timing.image_planes as u32,
            samples_per_exposure: timing.samples_per_exposure,
            ppr_clamped: timing.ppr_clamped,
        }
    }
}

/// Builds the sweep for `params`. Fails before producing anything if the parameters are invalid.
///
/// ```
/// # use lsm_compiler_backend::params::*;
/// # use lsm_compiler_backend::optics::OpticalTrain;
/// # use lsm_compiler_backend::sweep::compile_sweep;
/// let params = ImagingParameters::from_config(&OpticalTrain::default(), &ScanSettings::default()).unwrap();
/// let sweep = compile_sweep(&params).unwrap();
/// assert_eq!(sweep.sample_rate, 16_000);
/// assert_eq!(sweep.image_planes, 20);
/// assert_eq!(sweep.buffer.len(), 4 * 4_000);
///
/// assert!(compile_sweep(&params.with_rates(80, 3.)).is_err());
/// ```
pub fn compile_sweep(params: &ImagingParameters) -> Result<CompiledSweep, SynthesisError> {
    Ok(SweepProgram::new(params)?.compile())
}

/// Plane voltages of the lateral galvo. Ascending for continuous volumes, descending when a
/// single sweep takes longer than a second.
fn plane_voltages(timing: &SweepTiming, params: &ImagingParameters) -> Array1<f64> {
    let (v_min, v_max) = params.galvo1.voltage_bounds();
    if params.vps < 1. {
        Array1::linspace(v_max, v_min, timing.image_planes)
    } else {
        Array1::linspace(v_min, v_max, timing.image_planes)
    }
}

fn lateral_staircase(timing: &SweepTiming, params: &ImagingParameters) -> Channel {
    let mut chan = Channel::new(AoChannel::LateralGalvo.physical_name());
    let levels = plane_voltages(timing, params);
    let down = timing.plane_down_ramp();
    let hold = timing.samples_per_exposure - down;
    for i in 0..timing.image_planes {
        let next = levels[(i + 1) % timing.image_planes];
        chan.constant(hold, levels[i]);
        chan.linspace(down, levels[i], next);
    }
    chan
}

fn oblique_sawtooth(timing: &SweepTiming, params: &ImagingParameters) -> Channel {
    let mut chan = Channel::new(AoChannel::ObliqueGalvo.physical_name());
    let (v_min, v_max) = params.galvo2.voltage_bounds();
    let cycles = (timing.total_samps() + timing.points_per_ramp - 1) / timing.points_per_ramp;
    for _ in 0..cycles {
        chan.linspace(timing.up_ramp, v_min, v_max);
        chan.linspace(timing.down_ramp, v_max, v_min);
    }
    chan
}

fn camera_trigger(timing: &SweepTiming, trigger_active: bool) -> Channel {
    let mut chan = Channel::new(AoChannel::CameraTrigger.physical_name());
    if !trigger_active {
        chan.constant(timing.total_samps(), 0.);
        return chan;
    }
    let spe = timing.samples_per_exposure;
    let high = spe / 2 - 1;
    for _ in 0..timing.image_planes {
        chan.constant(1, 0.);
        chan.constant(high, TRIGGER_HIGH_VOLTS);
        chan.constant(spe - 1 - high, 0.);
    }
    chan
}

fn laser_select(timing: &SweepTiming, laser_volts: f64) -> Channel {
    let mut chan = Channel::new(AoChannel::LaserSelect.physical_name());
    chan.constant(timing.total_samps() - 1, laser_volts);
    chan.constant(1, 0.);
    chan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::GalvoScan;

    fn params(fps: u32, vps: f64, ppr: u32) -> ImagingParameters {
        let galvo = |range_um| GalvoScan {
            range_um,
            offset_um: 0.,
            volts_per_degree: 1.,
            degrees_per_um: 0.01,
        };
        ImagingParameters {
            galvo1: galvo(200.),
            galvo2: galvo(100.),
            fps,
            vps,
            laser_index: 2,
            trigger_active: true,
            points_per_ramp: ppr,
        }
    }

    #[test]
    fn timing_of_default_sweep() {
        let timing = SweepTiming::new(&params(80, 4., 200)).unwrap();
        assert_eq!(timing.sample_rate, 16_000);
        assert_eq!(timing.samples_per_exposure, 200);
        assert_eq!((timing.up_ramp, timing.down_ramp), (192, 8));
        assert_eq!(timing.plane_down_ramp(), 8);
        assert_eq!(timing.total_samps(), 4_000);
        assert!(!timing.ppr_clamped);
    }

    #[test]
    fn sample_rate_is_capped() {
        let timing = SweepTiming::new(&params(80, 4., 1500)).unwrap();
        assert_eq!(timing.sample_rate, 96_000);
        assert_eq!(timing.points_per_ramp, 1200);
        assert!(timing.ppr_clamped);
        // exactly at the ceiling is not a clamp
        assert!(!SweepTiming::new(&params(80, 4., 1200)).unwrap().ppr_clamped);
    }

    #[test]
    fn slow_frames_stretch_the_transition() {
        let timing = SweepTiming::new(&params(40, 2., 200)).unwrap();
        assert_eq!(timing.samples_per_exposure, 400);
        assert_eq!(timing.plane_down_ramp(), 16);
    }

    #[test]
    fn staircase_levels_and_direction() {
        let program = SweepProgram::new(&params(80, 20., 200)).unwrap();
        let sig = program.calc_signal();
        // 4 planes over [-1, 1]
        assert_eq!(sig[[0, 0]], -1.);
        assert_eq!(sig[[0, 191]], -1.);
        assert!((sig[[0, 200]] - (-1. / 3.)).abs() < 1e-12);
        // last plane ramps back to the first level
        assert_eq!(sig[[0, 799]], -1.);

        let program = SweepProgram::new(&params(80, 0.5, 200)).unwrap();
        let sig = program.calc_signal();
        assert_eq!(sig[[0, 0]], 1.);
        assert_eq!(sig[[0, 160 * 200 - 1]], 1.);
    }

    #[test]
    fn sawtooth_cycles_per_ramp() {
        let program = SweepProgram::new(&params(80, 4., 200)).unwrap();
        let sig = program.calc_signal();
        assert_eq!(sig[[1, 0]], -0.5);
        assert_eq!(sig[[1, 191]], 0.5);
        assert_eq!(sig[[1, 199]], -0.5);
        assert_eq!(sig[[1, 200]], -0.5);
    }

    #[test]
    fn trigger_pulse_shape() {
        let program = SweepProgram::new(&params(80, 4., 200)).unwrap();
        let sig = program.calc_signal();
        let trig: ndarray::ArrayView1<f64> = sig.slice(s![2, ..]);
        assert_eq!(trig[0], 0.);
        assert_eq!(trig[1], TRIGGER_HIGH_VOLTS);
        assert_eq!(trig[99], TRIGGER_HIGH_VOLTS);
        assert_eq!(trig[100], 0.);
        assert_eq!(trig[199], 0.);
        assert_eq!(trig.iter().filter(|&&v| v > 0.).count(), 20 * 99);
    }

    #[test]
    fn odd_exposure_keeps_planes_aligned() {
        // 16000 / 60 leaves 266 samples per exposure, not a whole number of ramps
        let program = SweepProgram::new(&params(60, 3., 200)).unwrap();
        let timing = *program.timing();
        assert_eq!(timing.samples_per_exposure, 266);
        for chan in program.channels() {
            assert!(chan.len() >= timing.total_samps(), "{}", chan.physical_name());
        }
        let sweep = program.compile();
        assert_eq!(sweep.buffer.samples_per_channel(), 20 * 266);
    }

    #[test]
    fn laser_ends_off() {
        let sweep = compile_sweep(&params(80, 4., 200)).unwrap();
        let laser: Vec<u16> = sweep.buffer.channel(AoChannel::LaserSelect).collect();
        assert_eq!(laser[0], volts_to_sample(3.));
        assert_eq!(*laser.last().unwrap(), MIDSCALE_SAMPLE);
    }

    #[test]
    fn laser_above_span_is_rejected() {
        let mut p = params(80, 4., 200);
        p.laser_index = 7;
        assert!(matches!(
            compile_sweep(&p),
            Err(SynthesisError::InvalidParameter(_))
        ));
    }

    #[test]
    fn too_fast_frames_are_rejected() {
        assert!(SweepTiming::new(&params(16_000, 16_000., 200)).is_err());
        assert!(SweepTiming::new(&params(80, 4., 1)).is_err());
    }

    #[test]
    fn interleaving_order() {
        let sweep = compile_sweep(&params(80, 4., 200)).unwrap();
        let raw = sweep.buffer.as_slice();
        assert_eq!(raw[0], volts_to_sample(-1.));
        assert_eq!(raw[1], volts_to_sample(-0.5));
        assert_eq!(raw[2], MIDSCALE_SAMPLE);
        assert_eq!(raw[3], volts_to_sample(3.));
        assert_eq!(raw[6], volts_to_sample(TRIGGER_HIGH_VOLTS));
        assert_eq!(sweep.duration(), Duration::from_millis(250));
    }

    #[test]
    fn buffer_rejects_ragged_input() {
        assert!(WaveformBuffer::from_interleaved(vec![]).is_err());
        assert!(WaveformBuffer::from_interleaved(vec![0; 6]).is_err());
        let buf = WaveformBuffer::from_interleaved(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(buf.channel(AoChannel::ObliqueGalvo).collect::<Vec<_>>(), vec![2, 6]);
    }

    #[test]
    fn every_output_line_reads_back() {
        let buf = WaveformBuffer::from_interleaved((0..12).collect()).unwrap();
        for (idx, chan) in AoChannel::ALL.into_iter().enumerate() {
            assert_eq!(chan.index(), idx);
            assert_eq!(chan.physical_name(), format!("ao{}", idx));
            let expected: Vec<u16> = (0..3).map(|n| (n * NUM_CHANNELS + idx) as u16).collect();
            assert_eq!(buf.channel(chan).collect::<Vec<_>>(), expected);
        }
    }
}
