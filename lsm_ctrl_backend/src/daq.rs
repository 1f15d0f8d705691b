//! Analog-output board session.
//!
//! Owns the board handle and the staged buffer, and drives the state machine
//!
//! ```text
//! Disconnected --connect--> Idle --load_signal--> Loaded --play--> Playing(mode)
//!                                                   ^                  |
//!                                                   +----terminate-----+
//! ```
//!
//! Any state falls back to `Disconnected` on [`DaqSession::disconnect`] or when the driver reports
//! the board lost. Only one buffer is ever held in driver memory: loading frees the previous one
//! first, after stopping playback so the board never scans freed memory.
//!
//! Methods take `&self`; the session is shared between the orchestrator and worker tasks. The
//! internal lock is never held while sleeping in [`DaqSession::await_completion`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lsm_compiler_backend::{CompiledSweep, WaveformBuffer, MIDSCALE_SAMPLE, NUM_CHANNELS};

use crate::driver::{BoardDescriptor, DaqDriver, MemHandle, ScanRequest};
use crate::error::{ControlError, UlError};
use crate::log::{MessageSink, StatusSignal};

/// Status poll interval of [`DaqSession::await_completion`].
pub const DAQ_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackMode {
    SingleSweep,
    ContinuousLoop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaqState {
    Disconnected,
    Idle,
    /// Idle with a buffer staged in driver memory.
    Loaded,
    Playing(PlaybackMode),
}

struct StagedSignal {
    memhandle: MemHandle,
    buffer: WaveformBuffer,
    sample_rate: u32,
}

struct DaqInner {
    state: DaqState,
    board: u32,
    low_chan: u32,
    high_chan: u32,
    mode: PlaybackMode,
    staged: Option<StagedSignal>,
    generation: u64,
}

pub struct DaqSession {
    driver: Arc<dyn DaqDriver>,
    sink: MessageSink,
    inner: Mutex<DaqInner>,
    poll_interval: Duration,
}

impl DaqSession {
    pub fn new(driver: Arc<dyn DaqDriver>, sink: MessageSink) -> Self {
        Self {
            driver,
            sink,
            inner: Mutex::new(DaqInner {
                state: DaqState::Disconnected,
                board: 0,
                low_chan: 0,
                high_chan: 0,
                mode: PlaybackMode::ContinuousLoop,
                staged: None,
                generation: 0,
            }),
            poll_interval: DAQ_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> DaqState {
        let mut inner = self.inner.lock();
        if let Err(err) = self.refresh(&mut inner) {
            tracing::debug!("status poll failed: {}", err);
        }
        inner.state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state != DaqState::Disconnected
    }

    pub fn board(&self) -> Option<u32> {
        let inner = self.inner.lock();
        (inner.state != DaqState::Disconnected).then_some(inner.board)
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.inner.lock().mode
    }

    /// Mode used by the next playback started from the orchestrator.
    pub fn set_playback_mode(&self, mode: PlaybackMode) {
        let mut inner = self.inner.lock();
        if inner.mode != mode {
            self.sink.info(match mode {
                PlaybackMode::SingleSweep => "Going to scan once ...",
                PlaybackMode::ContinuousLoop => "Going to scan continuously ...",
            });
        }
        inner.mode = mode;
    }

    /// Number of successful loads so far; the acknowledgement that a fresh signal is staged.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.inner.lock().staged.as_ref().map(|s| s.sample_rate)
    }

    /// Copy of the staged buffer.
    pub fn staged_buffer(&self) -> Option<WaveformBuffer> {
        self.inner.lock().staged.as_ref().map(|s| s.buffer.clone())
    }

    /// Enumerates the USB boards the driver can see.
    pub fn boards(&self) -> Result<Vec<BoardDescriptor>, ControlError> {
        let boards = self.driver.inventory().map_err(ControlError::Daq)?;
        for (idx, board) in boards.iter().enumerate() {
            self.sink.info(format!(
                "Found {} with serial# {} as board# {}",
                board.product_name, board.unique_id, idx
            ));
        }
        if boards.is_empty() {
            self.sink.warn("No USB DAQ device detected");
        }
        Ok(boards)
    }

    pub fn connect(&self, board: u32) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.state != DaqState::Disconnected {
            return Err(ControlError::InvalidState(format!(
                "DAQ board #{} is already connected",
                inner.board
            )));
        }
        let boards = self.boards()?;
        let descriptor = match boards.get(board as usize) {
            Some(descriptor) => descriptor,
            None if boards.is_empty() => {
                return Err(ControlError::DeviceNotFound(
                    "No USB DAQ device detected".to_string(),
                ))
            }
            None => {
                return Err(ControlError::DeviceNotFound(format!(
                    "out of bound entry for board number {} ({} detected)",
                    board,
                    boards.len()
                )))
            }
        };
        self.driver.create_device(board, descriptor).map_err(|err| {
            ControlError::DeviceNotFound(format!(
                "Error in selecting DAQ device #{}: {}",
                board, err
            ))
        })?;

        let chans = self.driver.num_da_chans(board).map_err(ControlError::Daq);
        let chans = match chans {
            Ok(chans) if chans as usize >= NUM_CHANNELS => chans,
            other => {
                if let Err(err) = self.driver.release_device(board) {
                    tracing::warn!("releasing rejected board #{}: {}", board, err);
                }
                return Err(match other {
                    Err(err) => err,
                    Ok(chans) => ControlError::DeviceNotFound(format!(
                        "board #{} has {} analog outputs, {} needed",
                        board, chans, NUM_CHANNELS
                    )),
                });
            }
        };

        inner.state = DaqState::Idle;
        inner.board = board;
        inner.low_chan = 0;
        inner.high_chan = NUM_CHANNELS as u32 - 1;
        inner.mode = PlaybackMode::ContinuousLoop;
        inner.staged = None;
        tracing::info!(board, chans, "DAQ board connected");
        self.sink.info(format!("Board# {} initialized", board));
        self.sink.status(StatusSignal::DaqConnected);
        Ok(())
    }

    /// Stages a compiled sweep, warning when the ramp resolution was lowered to fit the board.
    pub fn load_sweep(&self, sweep: CompiledSweep) -> Result<u64, ControlError> {
        if sweep.ppr_clamped {
            self.sink.warn(format!(
                "Sample rate capped at {} S/s: ramp resolution lowered to {} points",
                sweep.sample_rate, sweep.points_per_ramp
            ));
        }
        self.load_signal(sweep.buffer, sweep.sample_rate)
    }

    /// Replaces the staged buffer and returns the new signal generation.
    ///
    /// On failure the session is left `Idle` with no buffer; reload before playing.
    pub fn load_signal(
        &self,
        buffer: WaveformBuffer,
        sample_rate: u32,
    ) -> Result<u64, ControlError> {
        let mut inner = self.inner.lock();
        match inner.state {
            DaqState::Disconnected => {
                return Err(ControlError::InvalidState(
                    "DAQ board not connected".to_string(),
                ))
            }
            DaqState::Playing(_) => {
                self.stop_output(&mut inner)?;
            }
            DaqState::Idle | DaqState::Loaded => {}
        }
        if sample_rate == 0 {
            return Err(ControlError::InvalidState(
                "cannot stage a signal with a zero sample rate".to_string(),
            ));
        }

        if let Some(old) = inner.staged.take() {
            inner.state = DaqState::Idle;
            self.driver
                .buf_free(old.memhandle)
                .map_err(|err| self.fault(&mut inner, err))?;
            self.sink.info("Freed up old system memory for DAQ device ....");
        }
        inner.state = DaqState::Idle;

        let memhandle = match self.driver.buf_alloc(buffer.len()) {
            Ok(memhandle) => memhandle,
            Err(err) => return Err(self.alloc_failed(&mut inner, err)),
        };
        if let Err(err) = self.driver.buf_write(memhandle, buffer.as_slice()) {
            if let Err(free_err) = self.driver.buf_free(memhandle) {
                tracing::warn!("freeing a half-written buffer: {}", free_err);
            }
            return Err(self.alloc_failed(&mut inner, err));
        }

        inner.generation += 1;
        let generation = inner.generation;
        tracing::debug!(samples = buffer.len(), sample_rate, generation, "signal staged");
        inner.staged = Some(StagedSignal {
            memhandle,
            buffer,
            sample_rate,
        });
        inner.state = DaqState::Loaded;
        self.sink
            .info("Done with loading signals in the system memory ......");
        self.sink.status(StatusSignal::SignalLoaded { generation });
        Ok(generation)
    }

    /// Starts background playback of the staged buffer and returns immediately.
    pub fn play(&self, mode: PlaybackMode) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        let request = match (&inner.state, &inner.staged) {
            (DaqState::Loaded, Some(staged)) => ScanRequest {
                low_chan: inner.low_chan,
                high_chan: inner.high_chan,
                total_samples: staged.buffer.len(),
                rate: staged.sample_rate,
                memhandle: staged.memhandle,
                continuous: mode == PlaybackMode::ContinuousLoop,
            },
            (DaqState::Disconnected, _) => {
                return Err(ControlError::InvalidState(
                    "DAQ board not connected".to_string(),
                ))
            }
            (DaqState::Playing(_), _) => {
                return Err(ControlError::InvalidState(
                    "DAQ output is already playing; terminate it first".to_string(),
                ))
            }
            _ => {
                return Err(ControlError::InvalidState(
                    "no DAQ signal loaded".to_string(),
                ))
            }
        };
        let rate = self
            .driver
            .aout_scan(inner.board, &request)
            .map_err(|err| self.fault(&mut inner, err))?;
        if rate != request.rate {
            tracing::warn!(requested = request.rate, actual = rate, "board adjusted the sample rate");
        }
        inner.state = DaqState::Playing(mode);
        self.sink.info(match mode {
            PlaybackMode::ContinuousLoop => {
                "Pushed a new AO signal through DAQ board ...looping continuously"
            }
            PlaybackMode::SingleSweep => "Pushed a new AO signal through DAQ board ...once",
        });
        Ok(())
    }

    pub fn is_running(&self) -> Result<bool, ControlError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        Ok(matches!(inner.state, DaqState::Playing(_)))
    }

    /// Polls the board until it stops scanning. A continuous loop only ends through
    /// [`DaqSession::terminate`] from another thread.
    pub fn await_completion(&self) -> Result<(), ControlError> {
        while self.is_running()? {
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Stops background playback and forces every channel to 0 V.
    pub fn terminate(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.state == DaqState::Disconnected {
            return Ok(());
        }
        self.stop_output(&mut inner)
    }

    /// Stops playback, frees the staged buffer and releases the board.
    pub fn disconnect(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.state == DaqState::Disconnected {
            return Ok(());
        }
        let stopped = self.stop_output(&mut inner);
        let freed = match inner.staged.take() {
            Some(staged) => self.driver.buf_free(staged.memhandle).map_err(ControlError::Daq),
            None => Ok(()),
        };
        // A lost board has already been reported by stop_output
        if inner.state != DaqState::Disconnected {
            let released = self
                .driver
                .release_device(inner.board)
                .map_err(ControlError::Daq);
            inner.state = DaqState::Disconnected;
            self.sink.info("DAQ device de-initialized.");
            self.sink.status(StatusSignal::DaqDisconnected);
            return stopped.and(freed).and(released);
        }
        stopped.and(freed)
    }

    /// Marks a finished single sweep as `Loaded` again.
    fn refresh(&self, inner: &mut DaqInner) -> Result<(), ControlError> {
        if let DaqState::Playing(_) = inner.state {
            let running = self
                .driver
                .is_running(inner.board)
                .map_err(|err| self.fault(inner, err))?;
            if !running {
                inner.state = DaqState::Loaded;
            }
        }
        Ok(())
    }

    fn stop_output(&self, inner: &mut DaqInner) -> Result<(), ControlError> {
        let board = inner.board;
        let running = self
            .driver
            .is_running(board)
            .map_err(|err| self.fault(inner, err))?;

        // Zero every channel even if stopping failed
        let mut first_err: Option<UlError> = None;
        if running {
            if let Err(err) = self.driver.stop_background(board) {
                first_err = first_err.or(Some(err));
            }
        }
        for chan in inner.low_chan..=inner.high_chan {
            if let Err(err) = self.driver.aout(board, chan, MIDSCALE_SAMPLE) {
                first_err = first_err.or(Some(err));
            }
        }
        if let Some(err) = first_err {
            self.sink.error("Error in stopping old background DAQ task");
            return Err(self.fault(inner, err));
        }

        inner.state = if inner.staged.is_some() {
            DaqState::Loaded
        } else {
            DaqState::Idle
        };
        if running {
            self.sink.info("Stopped old background DAQ task");
        }
        Ok(())
    }

    fn alloc_failed(&self, inner: &mut DaqInner, err: UlError) -> ControlError {
        if err.is_device_lost() {
            return self.fault(inner, err);
        }
        self.sink.error("Failed to allocate memory for DAQ output.");
        ControlError::Allocation(err.to_string())
    }

    /// Converts a driver error, dropping to `Disconnected` when the board is gone.
    fn fault(&self, inner: &mut DaqInner, err: UlError) -> ControlError {
        if !err.is_device_lost() {
            let err = ControlError::Daq(err);
            self.sink.error(err.to_string());
            return err;
        }
        if let Some(staged) = inner.staged.take() {
            if let Err(free_err) = self.driver.buf_free(staged.memhandle) {
                tracing::warn!("freeing buffer of a lost board: {}", free_err);
            }
        }
        inner.state = DaqState::Disconnected;
        self.sink.error(format!(
            "Lost connection to DAQ board #{}: {}",
            inner.board, err
        ));
        self.sink.status(StatusSignal::DaqDisconnected);
        ControlError::ConnectionLost(err.to_string())
    }
}

impl Drop for DaqSession {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            tracing::warn!("DAQ cleanup failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DaqCall, SimDaq};

    fn session(time_scale: f64) -> (Arc<SimDaq>, DaqSession) {
        let sim = Arc::new(SimDaq::new().with_time_scale(time_scale));
        let (sink, _log) = MessageSink::new();
        let daq = DaqSession::new(sim.clone(), sink).with_poll_interval(Duration::from_millis(1));
        (sim, daq)
    }

    fn buffer() -> WaveformBuffer {
        WaveformBuffer::from_interleaved(vec![40000; 4 * 100]).unwrap()
    }

    #[test]
    fn state_machine() {
        let (_sim, daq) = session(0.);
        assert_eq!(daq.state(), DaqState::Disconnected);
        assert!(daq.play(PlaybackMode::SingleSweep).is_err());

        daq.connect(0).unwrap();
        assert_eq!(daq.state(), DaqState::Idle);
        assert_eq!(daq.playback_mode(), PlaybackMode::ContinuousLoop);
        assert!(matches!(
            daq.play(PlaybackMode::SingleSweep),
            Err(ControlError::InvalidState(_))
        ));

        assert_eq!(daq.load_signal(buffer(), 1000).unwrap(), 1);
        assert_eq!(daq.state(), DaqState::Loaded);

        daq.play(PlaybackMode::ContinuousLoop).unwrap();
        assert_eq!(daq.state(), DaqState::Playing(PlaybackMode::ContinuousLoop));
        daq.terminate().unwrap();
        assert_eq!(daq.state(), DaqState::Loaded);

        // Zero time scale: the sweep is over as soon as it starts
        daq.play(PlaybackMode::SingleSweep).unwrap();
        daq.await_completion().unwrap();
        assert_eq!(daq.state(), DaqState::Loaded);

        daq.disconnect().unwrap();
        assert_eq!(daq.state(), DaqState::Disconnected);
    }

    #[test]
    fn only_one_buffer_is_live() {
        let (sim, daq) = session(0.);
        daq.connect(0).unwrap();
        daq.load_signal(buffer(), 1000).unwrap();
        daq.play(PlaybackMode::ContinuousLoop).unwrap();
        assert_eq!(daq.load_signal(buffer(), 1000).unwrap(), 2);
        assert_eq!(sim.live_buffers(), 1);

        // Playback was stopped before the old buffer was freed
        let calls = sim.calls();
        let stop = calls.iter().position(|c| *c == DaqCall::StopBackground).unwrap();
        let free = calls.iter().position(|c| matches!(c, DaqCall::BufFree(_))).unwrap();
        assert!(stop < free);

        daq.disconnect().unwrap();
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn terminate_zeroes_every_channel() {
        let (sim, daq) = session(1.);
        daq.connect(0).unwrap();
        daq.load_signal(buffer(), 1000).unwrap();
        daq.play(PlaybackMode::ContinuousLoop).unwrap();
        daq.terminate().unwrap();
        for chan in 0..4 {
            assert_eq!(sim.output(chan), Some(MIDSCALE_SAMPLE));
        }
        assert!(!daq.is_running().unwrap());
    }

    #[test]
    fn allocation_failure_leaves_idle() {
        let (sim, daq) = session(0.);
        daq.connect(0).unwrap();
        daq.load_signal(buffer(), 1000).unwrap();
        sim.fail_next_alloc();
        assert!(matches!(
            daq.load_signal(buffer(), 1000),
            Err(ControlError::Allocation(_))
        ));
        assert_eq!(daq.state(), DaqState::Idle);
        assert_eq!(daq.sample_rate(), None);
        assert_eq!(sim.live_buffers(), 0);
        assert_eq!(daq.generation(), 1);
    }

    #[test]
    fn lost_board_disconnects() {
        let (sim, daq) = session(1.);
        daq.connect(0).unwrap();
        daq.load_signal(buffer(), 1000).unwrap();
        sim.unplug();
        assert!(matches!(
            daq.play(PlaybackMode::SingleSweep),
            Err(ControlError::ConnectionLost(_))
        ));
        assert_eq!(daq.state(), DaqState::Disconnected);
        assert_eq!(sim.live_buffers(), 0);
        assert!(daq.terminate().is_ok());
    }

    #[test]
    fn connect_checks_inventory() {
        let sim = Arc::new(SimDaq::new().with_boards(Vec::new()));
        let (sink, _log) = MessageSink::new();
        let daq = DaqSession::new(sim, sink);
        assert!(matches!(daq.connect(0), Err(ControlError::DeviceNotFound(_))));

        let (_sim, daq) = session(0.);
        assert!(matches!(daq.connect(3), Err(ControlError::DeviceNotFound(_))));

        let sim = Arc::new(SimDaq::new().with_da_chans(2));
        let (sink, _log) = MessageSink::new();
        let daq = DaqSession::new(sim, sink);
        assert!(matches!(daq.connect(0), Err(ControlError::DeviceNotFound(_))));
        assert!(!daq.is_connected());
    }
}
