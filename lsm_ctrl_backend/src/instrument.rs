//! Top-level orchestrator.
//!
//! [`Instrument`] owns one DAQ session, one stage session and the task coordinator, and keeps
//! the current imaging parameters. It is a cheap handle: clones share everything. All device
//! work it starts runs on coordinator workers; the returned [`TaskHandle`]s and
//! [`AcquisitionHandle`]s carry the outcome back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lsm_compiler_backend::{
    compile_sweep, CompiledSweep, ImagingParameters, OpticalTrain, ScanSettings,
};

use crate::config::InstrumentConfig;
use crate::coordinator::{DeviceKind, TaskCoordinator, TaskHandle, TASK_POLL_INTERVAL};
use crate::daq::{DaqSession, DaqState, DAQ_POLL_INTERVAL};
use crate::driver::{Axis, DaqDriver, StageDriver};
use crate::error::ControlError;
use crate::log::MessageSink;
use crate::sequencer::{
    run_functional, run_structural, AcquisitionHandle, AcquisitionMode, AcquisitionRun,
    FunctionalSettings, Rig, StructuralPlan,
};
use crate::stage::{StageSession, StageSettings};

const STAGE_BUSY: &str = "Stage is already busy, try to move after previous move has finished!";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitSide {
    YPos,
    YNeg,
    XPos,
    XNeg,
}

/// Direction of a continuous jog along one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JogDirection {
    Forward,
    Reverse,
}

impl JogDirection {
    fn sign(self) -> f64 {
        match self {
            JogDirection::Forward => 1.,
            JogDirection::Reverse => -1.,
        }
    }
}

/// Operator-set travel limits in logical µm, captured from the stage position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    pub y_pos: Option<f64>,
    pub y_neg: Option<f64>,
    pub x_pos: Option<f64>,
    pub x_neg: Option<f64>,
}

impl SoftLimits {
    pub fn get(&self, side: LimitSide) -> Option<f64> {
        match side {
            LimitSide::YPos => self.y_pos,
            LimitSide::YNeg => self.y_neg,
            LimitSide::XPos => self.x_pos,
            LimitSide::XNeg => self.x_neg,
        }
    }

    fn set(&mut self, side: LimitSide, value: f64) {
        let slot = match side {
            LimitSide::YPos => &mut self.y_pos,
            LimitSide::YNeg => &mut self.y_neg,
            LimitSide::XPos => &mut self.x_pos,
            LimitSide::XNeg => &mut self.x_neg,
        };
        *slot = Some(value);
    }

    /// Whole µm between the two Y limits, once both are set.
    pub fn y_range_um(&self) -> Option<u32> {
        span(self.y_pos, self.y_neg)
    }

    pub fn x_range_um(&self) -> Option<u32> {
        span(self.x_pos, self.x_neg)
    }
}

fn span(pos: Option<f64>, neg: Option<f64>) -> Option<u32> {
    match (pos, neg) {
        (Some(pos), Some(neg)) => Some((pos - neg).trunc().max(0.) as u32),
        _ => None,
    }
}

struct Settings {
    optics: OpticalTrain,
    scan: ScanSettings,
    params: ImagingParameters,
    /// Last (FPS, VPS) that compiled.
    last_good_rates: (u32, f64),
    limits: SoftLimits,
    stage: StageSettings,
    board: u32,
}

#[derive(Clone)]
pub struct Instrument {
    rig: Rig,
    settings: Arc<Mutex<Settings>>,
}

impl Instrument {
    pub fn new(
        config: InstrumentConfig,
        daq_driver: Arc<dyn DaqDriver>,
        stage_driver: Arc<dyn StageDriver>,
        sink: MessageSink,
    ) -> Result<Self, ControlError> {
        Self::with_poll_interval(config, daq_driver, stage_driver, sink, TASK_POLL_INTERVAL)
    }

    /// As [`Instrument::new`], with every completion barrier polling at `poll`.
    pub fn with_poll_interval(
        config: InstrumentConfig,
        daq_driver: Arc<dyn DaqDriver>,
        stage_driver: Arc<dyn StageDriver>,
        sink: MessageSink,
        poll: Duration,
    ) -> Result<Self, ControlError> {
        let InstrumentConfig {
            optics,
            mut scan,
            stage,
            daq,
        } = config;
        let mut params = ImagingParameters::from_config(&optics, &scan)?;
        if let Err(err) = params.image_planes() {
            let fallback = ScanSettings::default();
            sink.warn(format!(
                "{}. Resetting to {} fps, {} vps ...",
                err, fallback.fps, fallback.vps
            ));
            scan.fps = fallback.fps;
            scan.vps = fallback.vps;
            params = params.with_rates(fallback.fps, fallback.vps);
        }
        let daq_session = DaqSession::new(daq_driver, sink.clone())
            .with_poll_interval(poll.min(DAQ_POLL_INTERVAL));
        let rig = Rig::new(
            Arc::new(daq_session),
            Arc::new(StageSession::new(stage_driver, sink.clone())),
            TaskCoordinator::new(sink.clone()).with_poll_interval(poll),
            sink,
        );
        Ok(Self {
            rig,
            settings: Arc::new(Mutex::new(Settings {
                optics,
                last_good_rates: (scan.fps, scan.vps),
                scan,
                params,
                limits: SoftLimits::default(),
                stage,
                board: daq.board,
            })),
        })
    }

    pub fn daq(&self) -> &Arc<DaqSession> {
        &self.rig.daq
    }

    pub fn stage(&self) -> &Arc<StageSession> {
        &self.rig.stage
    }

    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.rig.coordinator
    }

    pub fn parameters(&self) -> ImagingParameters {
        self.settings.lock().params.clone()
    }

    pub fn scan_settings(&self) -> ScanSettings {
        self.settings.lock().scan.clone()
    }

    pub fn limits(&self) -> SoftLimits {
        self.settings.lock().limits
    }

    pub fn stage_settings(&self) -> StageSettings {
        self.settings.lock().stage.clone()
    }

    /// Current settings as a configuration record.
    pub fn config(&self) -> InstrumentConfig {
        let settings = self.settings.lock();
        InstrumentConfig {
            optics: settings.optics.clone(),
            scan: settings.scan.clone(),
            stage: settings.stage.clone(),
            daq: crate::config::DaqSettings {
                board: settings.board,
            },
        }
    }

    /// Connects the board and starts looping the current sweep.
    pub fn connect_daq(&self, board: Option<u32>) -> Result<TaskHandle<()>, ControlError> {
        let board = {
            let mut settings = self.settings.lock();
            if let Some(board) = board {
                settings.board = board;
            }
            settings.board
        };
        self.rig.daq.connect(board)?;
        self.push_signal(true)
    }

    /// Stops the output, waits for every DAQ task and releases the board.
    pub fn disconnect_daq(&self) -> Result<(), ControlError> {
        let stopped = self.rig.stop_pushes();
        let disconnected = self.rig.daq.disconnect();
        stopped.and(disconnected)
    }

    pub fn connect_stage(&self) -> Result<(), ControlError> {
        self.rig.stage.connect()
    }

    pub fn disconnect_stage(&self) -> Result<(), ControlError> {
        if !self.rig.stage.is_connected() {
            return Ok(());
        }
        let halted = self.rig.stage.halt().map(|_| ());
        self.rig.coordinator.await_count(DeviceKind::Stage, 0);
        let disconnected = self.rig.stage.disconnect();
        halted.and(disconnected)
    }

    /// Releases both devices.
    pub fn shutdown(&self) -> Result<(), ControlError> {
        let daq = self.disconnect_daq();
        let stage = self.disconnect_stage();
        daq.and(stage)
    }

    /// Adopts new scan settings and, with a board connected, loads and plays them.
    ///
    /// An FPS/VPS pair that does not compile is replaced by the last pair that did. Other
    /// configuration errors are returned before anything reaches the board.
    pub fn update_parameters(
        &self,
        scan: ScanSettings,
    ) -> Result<Option<TaskHandle<()>>, ControlError> {
        {
            let mut settings = self.settings.lock();
            let mut scan = scan;
            let mut params = ImagingParameters::from_config(&settings.optics, &scan)?;
            match params.image_planes() {
                Ok(_) => settings.last_good_rates = (scan.fps, scan.vps),
                Err(err) => {
                    let (fps, vps) = settings.last_good_rates;
                    self.rig.sink.warn(format!(
                        "{}. Resetting to {} fps, {} vps ...",
                        err, fps, vps
                    ));
                    scan.fps = fps;
                    scan.vps = vps;
                    params = params.with_rates(fps, vps);
                }
            }
            // Rejects anything else before the new settings are adopted
            compile_sweep(&params)?;
            settings.scan = scan;
            settings.params = params;
        }
        if self.rig.daq.is_connected() {
            self.push_signal(true).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Switches the camera trigger channel and reloads.
    pub fn set_trigger_active(
        &self,
        active: bool,
    ) -> Result<Option<TaskHandle<()>>, ControlError> {
        let mut scan = self.scan_settings();
        scan.trigger_active = active;
        self.update_parameters(scan)
    }

    /// Dispatches a DAQ push task; with `reload` the current parameters are compiled and staged
    /// first.
    pub fn push_signal(&self, reload: bool) -> Result<TaskHandle<()>, ControlError> {
        let sweep = if reload {
            Some(self.compile_current()?)
        } else {
            None
        };
        self.rig.dispatch_push(sweep)
    }

    fn compile_current(&self) -> Result<CompiledSweep, ControlError> {
        let params = self.parameters();
        Ok(compile_sweep(&params)?)
    }

    /// Sweep to stage before an acquisition: the current one with the camera trigger turned on
    /// if it was off, or the current one if nothing is staged yet. The flag tells whether the
    /// trigger gets switched on; the stored settings only change in [`Self::commit_trigger`].
    fn acquisition_sweep(&self) -> Result<(Option<CompiledSweep>, bool), ControlError> {
        let mut params = {
            let settings = self.settings.lock();
            if settings.params.trigger_active && self.rig.daq.state() != DaqState::Idle {
                return Ok((None, false));
            }
            settings.params.clone()
        };
        let enabling = !params.trigger_active;
        params.trigger_active = true;
        Ok((Some(compile_sweep(&params)?), enabling))
    }

    /// Records the camera trigger as on once the acquisition that needs it is running.
    fn commit_trigger(&self) {
        let mut settings = self.settings.lock();
        settings.scan.trigger_active = true;
        settings.params.trigger_active = true;
        self.rig.sink.info("Enabling camera trigger for acquisition ...");
    }

    fn stage_busy(&self) -> Result<(), ControlError> {
        if self.rig.coordinator.outstanding(DeviceKind::Stage) > 0 {
            self.rig.sink.warn(STAGE_BUSY);
            return Err(ControlError::InvalidState(STAGE_BUSY.to_string()));
        }
        Ok(())
    }

    /// Relative move of one axis at the jog velocity.
    pub fn jog(&self, axis: Axis, distance_um: f64) -> Result<TaskHandle<()>, ControlError> {
        self.stage_busy()?;
        let velocity = self.settings.lock().stage.jog_velocity;
        self.rig.dispatch_move(axis, distance_um, velocity)
    }

    /// Drives one axis toward its end of travel at the jog velocity. The move runs until
    /// [`Self::halt_stage`] stops it or the end is reached.
    pub fn jog_continuous(
        &self,
        axis: Axis,
        direction: JogDirection,
    ) -> Result<TaskHandle<()>, ControlError> {
        self.stage_busy()?;
        let (velocity, travel_um) = {
            let settings = self.settings.lock();
            (settings.stage.jog_velocity, settings.stage.center_travel_um)
        };
        let (y, x) = self.rig.stage.refresh_position()?;
        let position = match axis {
            Axis::Y => y,
            Axis::X => x,
        };
        let distance_um = direction.sign() * travel_um - position;
        tracing::debug!(?axis, ?direction, distance_um, "continuous jog");
        self.rig.dispatch_move(axis, distance_um, velocity)
    }

    pub fn recenter_stage(&self) -> Result<TaskHandle<()>, ControlError> {
        self.stage_busy()?;
        let stage = self.rig.stage.clone();
        let settings = self.stage_settings();
        self.rig
            .coordinator
            .dispatch("stage-recenter", Some(DeviceKind::Stage), move || {
                stage.recenter(&settings)
            })
    }

    /// Immediate stop; not a task, so it gets through while a move is running.
    pub fn halt_stage(&self) -> Result<(f64, f64), ControlError> {
        self.rig.stage.halt()
    }

    pub fn stage_position(&self) -> (f64, f64) {
        self.rig.stage.current_position()
    }

    /// Stores the current position as the `side` soft limit and returns it.
    pub fn set_limit(&self, side: LimitSide) -> Result<f64, ControlError> {
        if !self.rig.stage.is_connected() {
            return Err(ControlError::InvalidState(
                "MCL stage not connected".to_string(),
            ));
        }
        let (y, x) = self.rig.stage.current_position();
        let value = match side {
            LimitSide::YPos | LimitSide::YNeg => y,
            LimitSide::XPos | LimitSide::XNeg => x,
        };
        self.settings.lock().limits.set(side, value);
        self.rig
            .sink
            .info(format!("{:?} limit set at {} µm", side, value));
        Ok(value)
    }

    pub fn reset_limits(&self) {
        self.settings.lock().limits = SoftLimits::default();
        self.rig.sink.info("Stage limits cleared");
    }

    /// Tiling for the given ranges. An axis with both soft limits set uses their span as its
    /// range, and an axis with a negative limit starts there.
    pub fn structural_plan(
        &self,
        y_range_um: u32,
        x_range_um: u32,
    ) -> Result<StructuralPlan, ControlError> {
        let settings = self.settings.lock();
        let limits = settings.limits;
        let y_range = limits.y_range_um().unwrap_or(y_range_um);
        let x_range = limits.x_range_um().unwrap_or(x_range_um);
        let y_step = settings.params.galvo1.range_um.round().max(0.) as u32;
        let x_step = settings.optics.x_fov_um()?;
        let planes = settings.params.image_planes()?;
        let (start_y, start_x) = (limits.y_neg, limits.x_neg);
        Ok(StructuralPlan::new(y_range, x_range, y_step, x_step, planes)?
            .starting_at(start_y, start_x))
    }

    fn require_daq(&self) -> Result<(), ControlError> {
        if !self.rig.daq.is_connected() {
            return Err(ControlError::InvalidState(
                "DAQ board not connected".to_string(),
            ));
        }
        Ok(())
    }

    /// Continuous triggering for `scan_time_s`, or single sweeps with a pause when
    /// `time_delay_s` is set.
    pub fn start_functional(
        &self,
        settings: FunctionalSettings,
    ) -> Result<AcquisitionHandle, ControlError> {
        self.require_daq()?;
        let params = self.parameters();
        let planned = match settings.mode() {
            AcquisitionMode::TimeLapse => settings.num_sweeps(params.vps),
            _ => 1,
        };
        self.rig.sink.info(format!(
            "#frames {}",
            settings.frames(params.fps)
        ));
        let (trigger_sweep, enabling) = self.acquisition_sweep()?;
        let run = Arc::new(AcquisitionRun::new(settings.mode(), planned));
        let task = {
            let (rig, run) = (self.rig.clone(), run.clone());
            self.rig
                .coordinator
                .dispatch("functional-imaging", None, move || {
                    run_functional(&rig, &run, &settings, trigger_sweep)
                })?
        };
        if enabling {
            self.commit_trigger();
        }
        Ok(AcquisitionHandle::new(run, task))
    }

    pub fn start_time_lapse(
        &self,
        scan_time_s: f64,
        time_delay_s: f64,
    ) -> Result<AcquisitionHandle, ControlError> {
        self.start_functional(FunctionalSettings {
            scan_time_s,
            time_delay_s: Some(time_delay_s),
        })
    }

    pub fn start_structural(&self, plan: StructuralPlan) -> Result<AcquisitionHandle, ControlError> {
        self.require_daq()?;
        if !self.rig.stage.is_connected() {
            return Err(ControlError::InvalidState(
                "MCL stage not connected".to_string(),
            ));
        }
        self.rig.sink.info(format!("#frames {}", plan.frames));
        let (trigger_sweep, enabling) = self.acquisition_sweep()?;
        let velocity = self.settings.lock().stage.jog_velocity;
        let run = Arc::new(AcquisitionRun::new(AcquisitionMode::Structural, plan.tiles()));
        let task = {
            let (rig, run) = (self.rig.clone(), run.clone());
            self.rig
                .coordinator
                .dispatch("structural-imaging", None, move || {
                    run_structural(&rig, &run, &plan, velocity, trigger_sweep)
                })?
        };
        if enabling {
            self.commit_trigger();
        }
        Ok(AcquisitionHandle::new(run, task))
    }
}
