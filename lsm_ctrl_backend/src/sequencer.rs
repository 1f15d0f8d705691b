//! Imaging scripts.
//!
//! Each imaging mode is a fixed script of device tasks. A script never talks to a device while
//! another of its own tasks is in flight: every push or move is dispatched through the
//! [`TaskCoordinator`] and followed by a barrier on that device's outstanding count.
//!
//! Cancellation is cooperative. The flag of an [`AcquisitionRun`] is checked between steps, and
//! the cleanup (DAQ output terminated, continuous looping restored) runs on every exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lsm_compiler_backend::{structural_steps, CompiledSweep, SynthesisError};

use crate::coordinator::{DeviceKind, TaskCoordinator, TaskHandle};
use crate::daq::{DaqSession, PlaybackMode};
use crate::driver::Axis;
use crate::error::ControlError;
use crate::log::MessageSink;
use crate::stage::StageSession;

/// Starting-corner tolerance of structural runs, µm.
pub const START_TOLERANCE_UM: f64 = 0.1;

/// Sweep waiting for the next push to put it on the board.
#[derive(Default)]
struct Staging {
    /// Ticket of the newest sweep offered, loaded or not.
    ticket: u64,
    pending: Option<CompiledSweep>,
}

/// Devices and plumbing shared by the orchestrator and its scripts.
#[derive(Clone)]
pub struct Rig {
    pub daq: Arc<DaqSession>,
    pub stage: Arc<StageSession>,
    pub coordinator: TaskCoordinator,
    pub sink: MessageSink,
    /// Held by the push task that owns the current playback.
    playback: Arc<Mutex<()>>,
    /// Serializes board commands of push tasks against the supersede check.
    staging: Arc<Mutex<Staging>>,
    tickets: Arc<AtomicU64>,
    newest_push: Arc<AtomicU64>,
}

impl Rig {
    pub fn new(
        daq: Arc<DaqSession>,
        stage: Arc<StageSession>,
        coordinator: TaskCoordinator,
        sink: MessageSink,
    ) -> Self {
        Self {
            daq,
            stage,
            coordinator,
            sink,
            playback: Arc::new(Mutex::new(())),
            staging: Arc::new(Mutex::new(Staging::default())),
            tickets: Arc::new(AtomicU64::new(0)),
            newest_push: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Ticket of a new push; every push holding an older one is superseded from now on.
    pub(crate) fn claim_push(&self) -> u64 {
        let ticket = self.next_ticket();
        self.newest_push.fetch_max(ticket, Ordering::SeqCst);
        ticket
    }

    fn superseded(&self, ticket: u64) -> bool {
        ticket < self.newest_push.load(Ordering::SeqCst)
    }

    /// Queues `sweep` for the next push unless a newer sweep was offered or loaded already.
    fn offer(&self, ticket: u64, sweep: CompiledSweep) {
        let mut staging = self.staging.lock();
        if ticket > staging.ticket {
            staging.ticket = ticket;
            staging.pending = Some(sweep);
        }
    }

    /// Body of a DAQ push task: stop the previous playback, wait for the task that owned it to
    /// finish, load the newest offered sweep if any, then play once or in a loop until the
    /// board goes idle.
    ///
    /// The newest push wins. It keeps terminating whatever plays until the owner lets go, while
    /// a push overtaken by a newer one returns without touching the board.
    pub fn push_staged(&self, ticket: u64) -> Result<(), ControlError> {
        let _playback = loop {
            {
                let _commands = self.staging.lock();
                if self.superseded(ticket) {
                    tracing::debug!(ticket, "push superseded before playing");
                    return Ok(());
                }
                self.daq.terminate()?;
            }
            if let Some(slot) = self.playback.try_lock_for(self.coordinator.poll_interval()) {
                break slot;
            }
        };
        {
            let mut staging = self.staging.lock();
            if self.superseded(ticket) {
                tracing::debug!(ticket, "push superseded before playing");
                return Ok(());
            }
            if let Some(sweep) = staging.pending.take() {
                self.daq.load_sweep(sweep)?;
            }
            self.daq.play(self.daq.playback_mode())?;
        }
        self.daq.await_completion()
    }

    /// Dispatches a push task, offering `reload` for staging first when given.
    pub fn dispatch_push(
        &self,
        reload: Option<CompiledSweep>,
    ) -> Result<TaskHandle<()>, ControlError> {
        let ticket = self.claim_push();
        if let Some(sweep) = reload {
            self.offer(ticket, sweep);
        }
        let rig = self.clone();
        self.coordinator
            .dispatch("daq-push", Some(DeviceKind::Daq), move || {
                rig.push_staged(ticket)
            })
    }

    pub fn dispatch_move(
        &self,
        axis: Axis,
        distance_um: f64,
        velocity: f64,
    ) -> Result<TaskHandle<()>, ControlError> {
        let stage = self.stage.clone();
        self.coordinator
            .dispatch("stage-move", Some(DeviceKind::Stage), move || {
                stage.move_axis(axis, distance_um, velocity)?;
                stage.await_completion()
            })
    }

    /// Stages a sweep with the camera trigger on, counted as a DAQ operation.
    fn enable_trigger(&self, trigger_sweep: Option<CompiledSweep>) -> Result<(), ControlError> {
        if let Some(sweep) = trigger_sweep {
            let _guard = self.coordinator.begin(DeviceKind::Daq);
            let ticket = self.next_ticket();
            let mut staging = self.staging.lock();
            // Anything offered before is older than the trigger sweep
            staging.ticket = ticket;
            staging.pending = None;
            let generation = self.daq.load_sweep(sweep)?;
            tracing::debug!(generation, "trigger enabled for acquisition");
        }
        Ok(())
    }

    /// One push, and the barrier after it.
    fn push_and_wait(&self) -> Result<(), ControlError> {
        let task = self.dispatch_push(None)?;
        self.coordinator.await_count(DeviceKind::Daq, 0);
        task.join()
    }

    fn move_and_wait(&self, axis: Axis, distance_um: f64, velocity: f64) -> Result<(), ControlError> {
        let task = self.dispatch_move(axis, distance_um, velocity)?;
        self.coordinator.await_count(DeviceKind::Stage, 0);
        task.join()
    }

    /// Terminates the output until no DAQ task is left. A push that had not started playing
    /// yet when first terminated is stopped on the next round.
    pub(crate) fn stop_pushes(&self) -> Result<(), ControlError> {
        let mut first_err = None;
        loop {
            if let Err(err) = self.daq.terminate() {
                first_err.get_or_insert(err);
            }
            if self.coordinator.outstanding(DeviceKind::Daq) == 0 {
                break;
            }
            thread::sleep(self.coordinator.poll_interval());
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Silences the board, waits for every device task and restores continuous looping.
    fn finish_run(&self) -> Result<(), ControlError> {
        let stopped = self.stop_pushes();
        self.coordinator.await_count(DeviceKind::Stage, 0);
        self.daq.set_playback_mode(PlaybackMode::ContinuousLoop);
        stopped
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// Continuous triggering for a fixed time.
    Functional,
    /// Single sweeps separated by a delay.
    TimeLapse,
    /// Tiled mosaic with stage steps between sweeps.
    Structural,
}

/// Progress and cancellation state of one run.
#[derive(Debug)]
pub struct AcquisitionRun {
    mode: AcquisitionMode,
    planned: usize,
    completed: AtomicUsize,
    cancelled: AtomicBool,
}

impl AcquisitionRun {
    pub fn new(mode: AcquisitionMode, planned: usize) -> Self {
        Self {
            mode,
            planned,
            completed: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    /// Sweeps (functional, time-lapse) or tiles (structural) the run will perform.
    pub fn planned(&self) -> usize {
        self.planned
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn step_done(&self) -> usize {
        self.completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sleeps `duration` in slices of `slice`, returning early once cancelled.
    fn pause(&self, duration: Duration, slice: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.is_cancelled() {
                return;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

/// Returned by the `start_*` operations of the orchestrator.
pub struct AcquisitionHandle {
    run: Arc<AcquisitionRun>,
    task: TaskHandle<()>,
}

impl AcquisitionHandle {
    pub(crate) fn new(run: Arc<AcquisitionRun>, task: TaskHandle<()>) -> Self {
        Self { run, task }
    }

    pub fn run(&self) -> &Arc<AcquisitionRun> {
        &self.run
    }

    /// Skips the remaining steps; cleanup still runs.
    pub fn cancel(&self) {
        self.run.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn join(self) -> Result<(), ControlError> {
        self.task.join()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionalSettings {
    /// Total acquisition time, s.
    pub scan_time_s: f64,
    /// Pause after each single sweep, s. `None` triggers continuously instead.
    pub time_delay_s: Option<f64>,
}

impl FunctionalSettings {
    pub fn mode(&self) -> AcquisitionMode {
        match self.time_delay_s {
            Some(_) => AcquisitionMode::TimeLapse,
            None => AcquisitionMode::Functional,
        }
    }

    /// Sweeps of a time-lapse run, `scan_time · VPS` truncated.
    pub fn num_sweeps(&self, vps: f64) -> usize {
        (self.scan_time_s * vps).max(0.) as usize
    }

    /// Camera frames the run triggers.
    pub fn frames(&self, fps: u32) -> usize {
        (self.scan_time_s * fps as f64).max(0.) as usize
    }
}

/// Tiling of a structural run. Distances in µm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuralPlan {
    pub y_range_um: u32,
    pub x_range_um: u32,
    /// One tile along Y: the lateral light-sheet scan range.
    pub y_step_um: u32,
    /// One tile along X: the camera field of view.
    pub x_step_um: u32,
    pub y_steps: u32,
    pub x_steps: u32,
    /// Logical stage position of the first tile; `None` starts where the stage is.
    pub start_y: Option<f64>,
    pub start_x: Option<f64>,
    /// Camera frames over the whole run.
    pub frames: u64,
}

impl StructuralPlan {
    pub fn new(
        y_range_um: u32,
        x_range_um: u32,
        y_step_um: u32,
        x_step_um: u32,
        image_planes: u32,
    ) -> Result<Self, SynthesisError> {
        let y_steps = structural_steps(y_range_um, y_step_um)?;
        let x_steps = structural_steps(x_range_um, x_step_um)?;
        Ok(Self {
            y_range_um,
            x_range_um,
            y_step_um,
            x_step_um,
            y_steps,
            x_steps,
            start_y: None,
            start_x: None,
            frames: y_steps as u64 * x_steps as u64 * image_planes as u64,
        })
    }

    pub fn starting_at(mut self, start_y: Option<f64>, start_x: Option<f64>) -> Self {
        self.start_y = start_y;
        self.start_x = start_x;
        self
    }

    pub fn tiles(&self) -> usize {
        self.y_steps as usize * self.x_steps as usize
    }
}

/// Functional or time-lapse script.
///
/// `trigger_sweep` is a compiled sweep with the camera trigger on, staged before the first push
/// when the currently loaded signal has the trigger off.
pub fn run_functional(
    rig: &Rig,
    run: &AcquisitionRun,
    settings: &FunctionalSettings,
    trigger_sweep: Option<CompiledSweep>,
) -> Result<(), ControlError> {
    rig.sink
        .info("******************************************************");
    rig.sink.info("Starting functional imaging thread now ...");
    let result = functional_steps(rig, run, settings, trigger_sweep);
    if result.is_ok() && !run.is_cancelled() {
        rig.sink
            .info("Assigned time has elapsed. DAQ trigger is terminating now.");
    } else if run.is_cancelled() {
        rig.sink.warn("Functional imaging was stopped abruptly!");
    }
    let cleanup = rig.finish_run();
    result.and(cleanup)
}

fn functional_steps(
    rig: &Rig,
    run: &AcquisitionRun,
    settings: &FunctionalSettings,
    trigger_sweep: Option<CompiledSweep>,
) -> Result<(), ControlError> {
    rig.daq.terminate()?;
    match settings.time_delay_s {
        Some(_) => {
            rig.daq.set_playback_mode(PlaybackMode::SingleSweep);
            rig.sink.info("DAQ is all set for time-lapse imaging ....");
        }
        None => {
            rig.daq.set_playback_mode(PlaybackMode::ContinuousLoop);
            rig.sink.info("DAQ is all set for functional imaging ....");
        }
    }

    rig.enable_trigger(trigger_sweep)?;

    let poll = rig.coordinator.poll_interval();
    match settings.time_delay_s {
        Some(delay) => {
            let total = run.planned();
            for _ in 0..total {
                if run.is_cancelled() {
                    break;
                }
                rig.push_and_wait()?;
                run.pause(Duration::from_secs_f64(delay.max(0.)), poll);
                let done = run.step_done();
                rig.sink.info(format!(
                    "Done with {} out of {} sweeps in time-lapse",
                    done, total
                ));
            }
        }
        None => {
            let push = rig.dispatch_push(None)?;
            rig.sink
                .info("DAQ trigger signal is working with camera now ....");
            run.pause(Duration::from_secs_f64(settings.scan_time_s.max(0.)), poll);
            // The looping push only returns once its output is stopped
            let stopped = rig.stop_pushes();
            push.join()?;
            stopped?;
            run.step_done();
        }
    }
    Ok(())
}

/// Structural (tiled mosaic) script. `trigger_sweep` as for [`run_functional`].
pub fn run_structural(
    rig: &Rig,
    run: &AcquisitionRun,
    plan: &StructuralPlan,
    velocity: f64,
    trigger_sweep: Option<CompiledSweep>,
) -> Result<(), ControlError> {
    rig.sink
        .info("******************************************************");
    rig.sink.info("Starting structural imaging thread now ...");
    let result = mosaic_steps(rig, run, plan, velocity, trigger_sweep);
    if run.is_cancelled() {
        rig.sink.warn("Structural imaging was stopped abruptly!");
    }
    let cleanup = rig.finish_run();
    if result.is_ok() {
        rig.sink.info("Done with structural imaging thread.");
    }
    result.and(cleanup)
}

fn mosaic_steps(
    rig: &Rig,
    run: &AcquisitionRun,
    plan: &StructuralPlan,
    velocity: f64,
    trigger_sweep: Option<CompiledSweep>,
) -> Result<(), ControlError> {
    rig.daq.terminate()?;
    rig.daq.set_playback_mode(PlaybackMode::SingleSweep);
    rig.enable_trigger(trigger_sweep)?;

    rig.sink.info("Moving stage to the starting position ...");
    let (y, x) = rig.stage.current_position();
    for (axis, start, current) in [(Axis::Y, plan.start_y, y), (Axis::X, plan.start_x, x)] {
        if let Some(start) = start {
            let delta = start - current;
            if delta.abs() >= START_TOLERANCE_UM {
                rig.move_and_wait(axis, delta, velocity)?;
            }
        }
        tracing::debug!(?axis, "stage at the starting position");
    }
    rig.sink.info("DAQ is all set for structural imaging ....");

    let total = plan.tiles();
    rig.sink
        .info(format!("Starting a total of {} runs ...", total));
    let y_step = plan.y_step_um as f64;
    let x_step = plan.x_step_um as f64;
    for _ in 0..plan.x_steps {
        for _ in 0..plan.y_steps {
            if run.is_cancelled() {
                return Ok(());
            }
            rig.push_and_wait()?;
            let done = run.step_done();
            rig.sink.info(format!(
                "####### Finished step {} out of {}. ({},{}) #######",
                done, total, plan.y_steps, plan.x_steps
            ));
            rig.move_and_wait(Axis::Y, y_step, velocity)?;
        }
        if run.is_cancelled() {
            return Ok(());
        }
        rig.move_and_wait(Axis::Y, -y_step * plan.y_steps as f64, velocity)?;
        rig.move_and_wait(Axis::X, x_step, velocity)?;
    }
    if !run.is_cancelled() && plan.x_steps > 0 {
        rig.move_and_wait(Axis::X, -x_step * plan.x_steps as f64, velocity)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use lsm_compiler_backend::{AoChannel, WaveformBuffer};

    use crate::daq::DaqState;
    use crate::sim::{DaqCall, SimDaq, SimStage};

    fn rig(daq_scale: f64) -> (Arc<SimDaq>, Rig) {
        let sim = Arc::new(SimDaq::new().with_time_scale(daq_scale));
        let (sink, _log) = MessageSink::new();
        let poll = Duration::from_millis(1);
        let daq = DaqSession::new(sim.clone(), sink.clone()).with_poll_interval(poll);
        let stage = StageSession::new(Arc::new(SimStage::new()), sink.clone());
        let coordinator = TaskCoordinator::new(sink.clone()).with_poll_interval(poll);
        (sim, Rig::new(Arc::new(daq), Arc::new(stage), coordinator, sink))
    }

    fn sweep(level: u16) -> CompiledSweep {
        CompiledSweep {
            buffer: WaveformBuffer::from_interleaved(vec![level; 4 * 10]).unwrap(),
            sample_rate: 1000,
            points_per_ramp: 10,
            image_planes: 1,
            samples_per_exposure: 10,
            ppr_clamped: false,
        }
    }

    fn count(calls: &[DaqCall], pred: impl Fn(&DaqCall) -> bool) -> usize {
        calls.iter().filter(|call| pred(call)).count()
    }

    #[test]
    fn older_push_leaves_newer_playback_alone() {
        let (sim, rig) = rig(1.);
        rig.daq.connect(0).unwrap();
        // 100 samples at 200 S/s: half a second of playback
        let buffer = WaveformBuffer::from_interleaved(vec![40000; 4 * 100]).unwrap();
        rig.daq.load_signal(buffer, 200).unwrap();
        rig.daq.set_playback_mode(PlaybackMode::SingleSweep);

        let older = rig.claim_push();
        let newer = rig.claim_push();
        let playing = {
            let rig = rig.clone();
            thread::spawn(move || rig.push_staged(newer))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.daq.state() != DaqState::Playing(PlaybackMode::SingleSweep) {
            assert!(Instant::now() < deadline, "newer push never played");
            thread::sleep(Duration::from_millis(1));
        }
        let stops = count(&sim.calls(), |call| *call == DaqCall::StopBackground);

        rig.push_staged(older).unwrap();
        assert_eq!(rig.daq.state(), DaqState::Playing(PlaybackMode::SingleSweep));
        assert_eq!(count(&sim.calls(), |call| *call == DaqCall::StopBackground), stops);

        playing.join().unwrap().unwrap();
        let scans = count(&sim.calls(), |call| matches!(call, DaqCall::AOutScan(_)));
        assert_eq!(scans, 1);
    }

    #[test]
    fn trigger_sweep_replaces_offered_reload() {
        let (_sim, rig) = rig(0.);
        rig.daq.connect(0).unwrap();
        let ticket = rig.claim_push();
        rig.offer(ticket, sweep(1000));
        rig.enable_trigger(Some(sweep(50000))).unwrap();
        rig.daq.set_playback_mode(PlaybackMode::SingleSweep);

        rig.push_staged(ticket).unwrap();
        assert_eq!(rig.daq.generation(), 1);
        let staged = rig.daq.staged_buffer().unwrap();
        assert!(staged.channel(AoChannel::LateralGalvo).all(|v| v == 50000));
    }

    #[test]
    fn plan_rounds_partial_tiles_up() {
        let plan = StructuralPlan::new(250, 300, 100, 100, 20).unwrap();
        assert_eq!((plan.y_steps, plan.x_steps), (3, 3));
        assert_eq!(plan.tiles(), 9);
        assert_eq!(plan.frames, 180);
        assert!(StructuralPlan::new(250, 300, 100, 0, 20).is_err());
    }

    #[test]
    fn functional_counts() {
        let lapse = FunctionalSettings {
            scan_time_s: 10.,
            time_delay_s: Some(2.),
        };
        assert_eq!(lapse.mode(), AcquisitionMode::TimeLapse);
        assert_eq!(lapse.num_sweeps(0.5), 5);
        assert_eq!(lapse.frames(80), 800);
        let functional = FunctionalSettings {
            scan_time_s: 3.,
            time_delay_s: None,
        };
        assert_eq!(functional.mode(), AcquisitionMode::Functional);
    }

    #[test]
    fn pause_ends_on_cancel() {
        let run = AcquisitionRun::new(AcquisitionMode::Functional, 1);
        run.cancel();
        let started = Instant::now();
        run.pause(Duration::from_secs(30), Duration::from_millis(5));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
