//! Simulated analog-output board and XY stage.
//!
//! Both simulators record every command they receive, run on a configurable time scale
//! (`0.0` completes scans and moves instantly) and accept injected faults. The CLI uses them when
//! the crate is built without the hardware features.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};

use crate::driver::*;
use crate::error::{McoError, UlError, UL_ALLOC_FAILED, UL_BADBOARD, UL_DEADDADEV};

/// Code the simulator returns for requests a real board rejects as well.
pub const SIM_INVALID_REQUEST: i32 = 999;

pub const SIM_MICROSTEP_MM: f64 = 0.000095;
pub const SIM_TRAVEL_MM: f64 = 25.4;
pub const SIM_MAX_VELOCITY: f64 = 5.0;

#[derive(Clone, Debug, PartialEq)]
pub enum DaqCall {
    Inventory,
    CreateDevice(u32),
    ReleaseDevice(u32),
    BufAlloc(usize),
    BufWrite(MemHandle, usize),
    BufFree(MemHandle),
    AOutScan(ScanRequest),
    StopBackground,
    AOut { chan: u32, value: u16 },
}

struct SimScan {
    memhandle: MemHandle,
    started: Instant,
    length: Duration,
    continuous: bool,
}

impl SimScan {
    fn running(&self) -> bool {
        self.continuous || self.started.elapsed() < self.length
    }
}

#[derive(Default)]
struct SimDaqState {
    created: Option<u32>,
    buffers: IndexMap<MemHandle, Vec<u16>>,
    next_handle: MemHandle,
    scan: Option<SimScan>,
    outputs: IndexMap<u32, u16>,
    calls: Vec<DaqCall>,
    fail_alloc: bool,
    unplugged: bool,
}

impl SimDaqState {
    fn board_check(&self, board: u32) -> Result<(), UlError> {
        if self.unplugged {
            return Err(UlError::new(UL_DEADDADEV, "D/A device is not responding"));
        }
        match self.created {
            Some(created) if created == board => Ok(()),
            _ => Err(UlError::new(UL_BADBOARD, "Invalid board number")),
        }
    }
}

pub struct SimDaq {
    state: Mutex<SimDaqState>,
    boards: Vec<BoardDescriptor>,
    da_chans: u32,
    time_scale: f64,
}

impl SimDaq {
    /// A single 4-channel USB board.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimDaqState::default()),
            boards: vec![BoardDescriptor {
                product_name: "USB-3101FS".to_string(),
                unique_id: "SIM0001".to_string(),
            }],
            da_chans: 4,
            time_scale: 1.0,
        }
    }

    pub fn with_boards(mut self, boards: Vec<BoardDescriptor>) -> Self {
        self.boards = boards;
        self
    }

    pub fn with_da_chans(mut self, da_chans: u32) -> Self {
        self.da_chans = da_chans;
        self
    }

    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    pub fn calls(&self) -> Vec<DaqCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn buffer(&self, memhandle: MemHandle) -> Option<Vec<u16>> {
        self.state.lock().buffers.get(&memhandle).cloned()
    }

    /// Last value written to `chan` with a single-sample write.
    pub fn output(&self, chan: u32) -> Option<u16> {
        self.state.lock().outputs.get(&chan).copied()
    }

    pub fn fail_next_alloc(&self) {
        self.state.lock().fail_alloc = true;
    }

    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
    }
}

impl Default for SimDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqDriver for SimDaq {
    fn inventory(&self) -> Result<Vec<BoardDescriptor>, UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::Inventory);
        if state.unplugged {
            return Ok(Vec::new());
        }
        Ok(self.boards.clone())
    }

    fn create_device(&self, board: u32, descriptor: &BoardDescriptor) -> Result<(), UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::CreateDevice(board));
        if state.unplugged || !self.boards.contains(descriptor) {
            return Err(UlError::new(UL_BADBOARD, "Invalid board number"));
        }
        state.created = Some(board);
        Ok(())
    }

    fn release_device(&self, board: u32) -> Result<(), UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::ReleaseDevice(board));
        state.board_check(board)?;
        state.created = None;
        state.scan = None;
        Ok(())
    }

    fn num_da_chans(&self, board: u32) -> Result<u32, UlError> {
        self.state.lock().board_check(board)?;
        Ok(self.da_chans)
    }

    fn buf_alloc(&self, samples: usize) -> Result<MemHandle, UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::BufAlloc(samples));
        if state.fail_alloc {
            state.fail_alloc = false;
            return Err(UlError::new(UL_ALLOC_FAILED, "cbWinBufAlloc returned a null handle"));
        }
        state.next_handle += 1;
        let memhandle = state.next_handle;
        state.buffers.insert(memhandle, vec![0; samples]);
        Ok(memhandle)
    }

    fn buf_write(&self, memhandle: MemHandle, samples: &[u16]) -> Result<(), UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::BufWrite(memhandle, samples.len()));
        match state.buffers.get_mut(&memhandle) {
            Some(buf) if buf.len() >= samples.len() => {
                buf[..samples.len()].copy_from_slice(samples);
                Ok(())
            }
            _ => Err(UlError::new(SIM_INVALID_REQUEST, "Invalid memory handle or count")),
        }
    }

    fn buf_free(&self, memhandle: MemHandle) -> Result<(), UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::BufFree(memhandle));
        if let Some(scan) = &state.scan {
            if scan.memhandle == memhandle && scan.running() {
                return Err(UlError::new(
                    SIM_INVALID_REQUEST,
                    "Buffer is in use by a background scan",
                ));
            }
        }
        match state.buffers.shift_remove(&memhandle) {
            Some(_) => Ok(()),
            None => Err(UlError::new(SIM_INVALID_REQUEST, "Invalid memory handle")),
        }
    }

    fn aout_scan(&self, board: u32, request: &ScanRequest) -> Result<u32, UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::AOutScan(*request));
        state.board_check(board)?;
        if state.scan.as_ref().map_or(false, |scan| scan.running()) {
            return Err(UlError::new(
                SIM_INVALID_REQUEST,
                "A background process is already active",
            ));
        }
        let buffer_ok = state
            .buffers
            .get(&request.memhandle)
            .map_or(false, |buf| buf.len() >= request.total_samples);
        let nchans = request.high_chan.saturating_sub(request.low_chan) as usize + 1;
        if !buffer_ok || request.rate == 0 || request.total_samples % nchans != 0 {
            return Err(UlError::new(SIM_INVALID_REQUEST, "Invalid scan request"));
        }
        let secs = (request.total_samples / nchans) as f64 / request.rate as f64;
        state.scan = Some(SimScan {
            memhandle: request.memhandle,
            started: Instant::now(),
            length: Duration::from_secs_f64(secs * self.time_scale),
            continuous: request.continuous,
        });
        Ok(request.rate)
    }

    fn stop_background(&self, board: u32) -> Result<(), UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::StopBackground);
        state.board_check(board)?;
        state.scan = None;
        Ok(())
    }

    fn aout(&self, board: u32, chan: u32, value: u16) -> Result<(), UlError> {
        let mut state = self.state.lock();
        state.calls.push(DaqCall::AOut { chan, value });
        state.board_check(board)?;
        if chan >= self.da_chans {
            return Err(UlError::new(SIM_INVALID_REQUEST, "Invalid D/A channel"));
        }
        state.outputs.insert(chan, value);
        Ok(())
    }

    fn is_running(&self, board: u32) -> Result<bool, UlError> {
        let state = self.state.lock();
        state.board_check(board)?;
        Ok(state.scan.as_ref().map_or(false, |scan| scan.running()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StageCall {
    Init,
    Release,
    Move {
        axis: Axis,
        velocity: f64,
        distance_mm: f64,
    },
    MoveTwo {
        velocity: f64,
        y_mm: f64,
        x_mm: f64,
    },
    Wait,
    Stop,
}

struct Motion {
    from: [i64; 2],
    to: [i64; 2],
    started: Instant,
    length: Duration,
}

struct SimStageState {
    handle: i32,
    /// Microsteps along (Y, X); the negative limit switch sits at 0.
    raw: [i64; 2],
    motion: Option<Motion>,
    calls: Vec<StageCall>,
    fault: Option<McoError>,
}

impl SimStageState {
    fn check(&mut self, handle: i32) -> Result<(), McoError> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        if handle <= 0 || handle != self.handle {
            return Err(McoError::InvalidHandle);
        }
        Ok(())
    }

    fn settle(&mut self) {
        if let Some(motion) = &self.motion {
            if motion.started.elapsed() >= motion.length {
                self.raw = motion.to;
                self.motion = None;
            }
        }
    }
}

fn axis_slot(axis: Axis) -> usize {
    match axis {
        Axis::Y => 0,
        Axis::X => 1,
    }
}

pub struct SimStage {
    state: Mutex<SimStageState>,
    done: Condvar,
    present: bool,
    travel_steps: i64,
    time_scale: f64,
}

impl SimStage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimStageState {
                handle: 0,
                raw: [61_234, 150_321],
                motion: None,
                calls: Vec::new(),
                fault: None,
            }),
            done: Condvar::new(),
            present: true,
            travel_steps: (SIM_TRAVEL_MM / SIM_MICROSTEP_MM).round() as i64,
            time_scale: 1.0,
        }
    }

    /// A library that finds no stage: `init_handle` returns 0.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }

    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// The next command fails with `fault`.
    pub fn fail_next(&self, fault: McoError) {
        self.state.lock().fault = Some(fault);
    }

    /// Microsteps along (Y, X) once the current move completes.
    pub fn raw_target(&self) -> (i64, i64) {
        let state = self.state.lock();
        let raw = state.motion.as_ref().map_or(state.raw, |m| m.to);
        (raw[0], raw[1])
    }

    pub fn is_moving(&self) -> bool {
        let mut state = self.state.lock();
        state.settle();
        state.motion.is_some()
    }

    fn start_motion(
        &self,
        state: &mut SimStageState,
        velocity: f64,
        steps: [i64; 2],
    ) -> Result<(), McoError> {
        state.settle();
        if state.motion.is_some() {
            return Err(McoError::DevNotReady);
        }
        if !(velocity > 0. && velocity <= SIM_MAX_VELOCITY) {
            return Err(McoError::ArgumentError);
        }
        let from = state.raw;
        // Limit switches stop the motor at either end of travel
        let to = [
            (from[0] + steps[0]).clamp(0, self.travel_steps),
            (from[1] + steps[1]).clamp(0, self.travel_steps),
        ];
        let longest = (to[0] - from[0]).abs().max((to[1] - from[1]).abs());
        let secs = longest as f64 * SIM_MICROSTEP_MM / velocity;
        state.motion = Some(Motion {
            from,
            to,
            started: Instant::now(),
            length: Duration::from_secs_f64(secs * self.time_scale),
        });
        Ok(())
    }
}

impl Default for SimStage {
    fn default() -> Self {
        Self::new()
    }
}

fn to_steps(distance_mm: f64) -> i64 {
    (distance_mm / SIM_MICROSTEP_MM).round() as i64
}

impl StageDriver for SimStage {
    fn init_handle(&self) -> i32 {
        let mut state = self.state.lock();
        state.calls.push(StageCall::Init);
        state.handle = if self.present { 1 } else { 0 };
        state.handle
    }

    fn release_handle(&self, handle: i32) {
        let mut state = self.state.lock();
        state.calls.push(StageCall::Release);
        if handle == state.handle {
            state.handle = 0;
        }
    }

    fn serial_number(&self, _handle: i32) -> i32 {
        2701
    }

    fn info(&self, handle: i32) -> Result<StageInfo, McoError> {
        self.state.lock().check(handle)?;
        Ok(StageInfo {
            encoder_resolution_um: 0.,
            microstep_mm: SIM_MICROSTEP_MM,
            max_velocity: SIM_MAX_VELOCITY,
            max_velocity_two_axis: SIM_MAX_VELOCITY,
            min_velocity: 0.01,
        })
    }

    fn move_axis(
        &self,
        handle: i32,
        axis: Axis,
        velocity: f64,
        distance_mm: f64,
    ) -> Result<(), McoError> {
        let mut state = self.state.lock();
        state.calls.push(StageCall::Move {
            axis,
            velocity,
            distance_mm,
        });
        state.check(handle)?;
        let steps = to_steps(distance_mm);
        if steps == 0 {
            return Err(McoError::ArgumentError);
        }
        let mut both = [0, 0];
        both[axis_slot(axis)] = steps;
        self.start_motion(&mut state, velocity, both)
    }

    fn move_two_axes(
        &self,
        handle: i32,
        velocity: f64,
        y_mm: f64,
        x_mm: f64,
    ) -> Result<(), McoError> {
        let mut state = self.state.lock();
        state.calls.push(StageCall::MoveTwo {
            velocity,
            y_mm,
            x_mm,
        });
        state.check(handle)?;
        let steps = [to_steps(y_mm), to_steps(x_mm)];
        if steps.contains(&0) {
            return Err(McoError::ArgumentError);
        }
        self.start_motion(&mut state, velocity, steps)
    }

    fn wait(&self, handle: i32) -> Result<(), McoError> {
        let mut state = self.state.lock();
        state.calls.push(StageCall::Wait);
        state.check(handle)?;
        loop {
            state.settle();
            let deadline = match &state.motion {
                Some(motion) => motion.started + motion.length,
                None => return Ok(()),
            };
            self.done.wait_until(&mut state, deadline);
        }
    }

    fn position_microsteps(&self, handle: i32, axis: Axis) -> Result<i32, McoError> {
        let mut state = self.state.lock();
        state.check(handle)?;
        state.settle();
        Ok(state.raw[axis_slot(axis)] as i32)
    }

    fn stop(&self, handle: i32) -> Result<(), McoError> {
        let mut state = self.state.lock();
        state.calls.push(StageCall::Stop);
        state.check(handle)?;
        state.settle();
        if let Some(motion) = state.motion.take() {
            let fraction = if motion.length.is_zero() {
                1.
            } else {
                (motion.started.elapsed().as_secs_f64() / motion.length.as_secs_f64()).min(1.)
            };
            for slot in 0..2 {
                let travelled = (motion.to[slot] - motion.from[slot]) as f64 * fraction;
                state.raw[slot] = motion.from[slot] + travelled.round() as i64;
            }
            self.done.notify_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daq_scan_runs_for_buffer_duration() {
        let daq = SimDaq::new().with_time_scale(0.);
        let board = daq.inventory().unwrap().remove(0);
        daq.create_device(0, &board).unwrap();
        let memhandle = daq.buf_alloc(8).unwrap();
        daq.buf_write(memhandle, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut request = ScanRequest {
            low_chan: 0,
            high_chan: 3,
            total_samples: 8,
            rate: 1000,
            memhandle,
            continuous: false,
        };
        daq.aout_scan(0, &request).unwrap();
        assert!(!daq.is_running(0).unwrap());

        request.continuous = true;
        daq.aout_scan(0, &request).unwrap();
        assert!(daq.is_running(0).unwrap());
        // In use by the running scan
        assert!(daq.buf_free(memhandle).is_err());
        daq.stop_background(0).unwrap();
        daq.buf_free(memhandle).unwrap();
        assert_eq!(daq.live_buffers(), 0);
    }

    #[test]
    fn daq_requires_created_board() {
        let daq = SimDaq::new();
        assert_eq!(daq.aout(0, 0, 32768).unwrap_err().code, UL_BADBOARD);
        daq.unplug();
        assert!(daq.inventory().unwrap().is_empty());
    }

    #[test]
    fn stage_clamps_at_limit_switch() {
        let stage = SimStage::new().with_time_scale(0.);
        let handle = stage.init_handle();
        stage.move_axis(handle, Axis::Y, 3., -30.).unwrap();
        stage.wait(handle).unwrap();
        assert_eq!(stage.position_microsteps(handle, Axis::Y).unwrap(), 0);
        assert_eq!(
            stage.move_axis(handle, Axis::X, 3., 0.),
            Err(McoError::ArgumentError)
        );
        assert_eq!(
            stage.move_axis(handle + 1, Axis::X, 3., 1.),
            Err(McoError::InvalidHandle)
        );
    }

    #[test]
    fn stage_stop_ends_wait() {
        let stage = std::sync::Arc::new(SimStage::new());
        let handle = stage.init_handle();
        // 2 mm at 0.1 mm/s: 20 s unless stopped
        stage.move_axis(handle, Axis::X, 0.1, 2.).unwrap();
        let waiter = {
            let stage = stage.clone();
            std::thread::spawn(move || stage.wait(handle))
        };
        std::thread::sleep(Duration::from_millis(20));
        stage.stop(handle).unwrap();
        waiter.join().unwrap().unwrap();
        assert!(!stage.is_moving());
        let x = stage.position_microsteps(handle, Axis::X).unwrap();
        assert!(x > 150_321 && x < 150_321 + to_steps(2.) as i32);
    }
}
