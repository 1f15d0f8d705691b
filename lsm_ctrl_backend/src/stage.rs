//! XY translation stage session.
//!
//! Distances are in µm and velocities in mm/s. Moves are issued asynchronously by the
//! controller; [`StageSession::await_completion`] is the barrier after which
//! [`StageSession::current_position`] is meaningful. Failed motion commands are never retried.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lsm_compiler_backend::round5;

use crate::driver::{Axis, StageDriver};
use crate::error::{ControlError, McoError};
use crate::log::{MessageSink, StatusSignal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Disconnected,
    Idle,
    Moving,
}

/// Velocities and travels used for jogging and recentering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Manual and structural-scan moves, mm/s.
    pub jog_velocity: f64,
    /// Travel towards the reverse limit switches, mm/s.
    pub limit_velocity: f64,
    /// Travel from the limit switches to the center, mm/s.
    pub center_velocity: f64,
    /// Longer than the full travel, so the limit switch always stops the move.
    pub limit_travel_um: f64,
    /// Half an inch: the center of the travel seen from the reverse limit.
    pub center_travel_um: f64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            jog_velocity: 1.0,
            limit_velocity: 3.0,
            center_velocity: 4.0,
            limit_travel_um: 30_000.,
            center_travel_um: 12_700.,
        }
    }
}

struct StageInner {
    state: StageState,
    handle: i32,
    microstep_um: f64,
    /// Raw position (µm) reported as the logical origin.
    offset: (f64, f64),
    /// Last polled (Y, X), µm.
    position: (f64, f64),
}

pub struct StageSession {
    driver: Arc<dyn StageDriver>,
    sink: MessageSink,
    inner: Mutex<StageInner>,
}

impl StageSession {
    pub fn new(driver: Arc<dyn StageDriver>, sink: MessageSink) -> Self {
        Self {
            driver,
            sink,
            inner: Mutex::new(StageInner {
                state: StageState::Disconnected,
                handle: 0,
                microstep_um: 0.,
                offset: (0., 0.),
                position: (0., 0.),
            }),
        }
    }

    pub fn state(&self) -> StageState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() != StageState::Disconnected
    }

    pub fn microstep_um(&self) -> f64 {
        self.inner.lock().microstep_um
    }

    /// Last polled (Y, X) in µm. Stale while a move is in progress.
    pub fn current_position(&self) -> (f64, f64) {
        self.inner.lock().position
    }

    pub fn connect(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.state != StageState::Disconnected {
            return Err(ControlError::InvalidState(
                "MCL stage is already connected".to_string(),
            ));
        }
        let handle = self.driver.init_handle();
        if handle <= 0 {
            self.sink
                .error("MCL stage connection failed. Is the device detectable?");
            return Err(ControlError::StageNotFound);
        }
        let info = match self.driver.info(handle) {
            Ok(info) => info,
            Err(err) => {
                self.driver.release_handle(handle);
                self.sink
                    .error(format!("Error while fetching MCL MDInfo: {}", err));
                return Err(err.into());
            }
        };
        inner.handle = handle;
        inner.microstep_um = info.microstep_mm * 1e3;
        inner.offset = (0., 0.);
        inner.state = StageState::Idle;
        self.sink.info(format!(
            "Connected to MCL stage with Serial#: {}",
            self.driver.serial_number(handle)
        ));
        self.sink
            .info(format!("Microstep size = {} µm", inner.microstep_um));
        self.sink.status(StatusSignal::StageConnected);
        drop(inner);
        self.refresh_position()?;
        Ok(())
    }

    /// Relative single-axis move; returns once the controller accepted it.
    pub fn move_axis(
        &self,
        axis: Axis,
        distance_um: f64,
        velocity: f64,
    ) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        let handle = self.ready_handle(&inner)?;
        let distance_um = at_least_one_step(distance_um, inner.microstep_um);
        tracing::debug!(?axis, distance_um, velocity, "stage move");
        self.driver
            .move_axis(handle, axis, velocity, distance_um * 1e-3)
            .map_err(|err| self.motion_failed(&mut inner, err))?;
        inner.state = StageState::Moving;
        Ok(())
    }

    /// Simultaneous relative move of both axes.
    pub fn move_yx(&self, y_um: f64, x_um: f64, velocity: f64) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        let handle = self.ready_handle(&inner)?;
        let y_um = at_least_one_step(y_um, inner.microstep_um);
        let x_um = at_least_one_step(x_um, inner.microstep_um);
        tracing::debug!(y_um, x_um, velocity, "stage two-axis move");
        self.driver
            .move_two_axes(handle, velocity, y_um * 1e-3, x_um * 1e-3)
            .map_err(|err| self.motion_failed(&mut inner, err))?;
        inner.state = StageState::Moving;
        Ok(())
    }

    /// Blocks until the controller reports the move finished, then polls the position.
    pub fn await_completion(&self) -> Result<(), ControlError> {
        let handle = {
            let inner = self.inner.lock();
            if inner.state == StageState::Disconnected {
                return Err(not_connected());
            }
            inner.handle
        };
        // Unlocked: halt() must get through while we wait
        if let Err(err) = self.driver.wait(handle) {
            self.sink.error(format!(
                "Error while waiting for the stage move to finish: {}",
                err
            ));
            return Err(err.into());
        }
        {
            let mut inner = self.inner.lock();
            if inner.state == StageState::Moving {
                inner.state = StageState::Idle;
            }
        }
        self.refresh_position()?;
        Ok(())
    }

    /// Polls the controller and stores the logical (Y, X) position.
    pub fn refresh_position(&self) -> Result<(f64, f64), ControlError> {
        let mut inner = self.inner.lock();
        if inner.state == StageState::Disconnected {
            return Err(not_connected());
        }
        let handle = inner.handle;
        let y = self.raw_um(handle, Axis::Y, inner.microstep_um)?;
        let x = self.raw_um(handle, Axis::X, inner.microstep_um)?;
        let position = (round5(y - inner.offset.0), round5(x - inner.offset.1));
        inner.position = position;
        self.sink.status(StatusSignal::PositionUpdated {
            y: position.0,
            x: position.1,
        });
        Ok(position)
    }

    /// Drives both axes onto their reverse limit switches, then half the travel forward, and
    /// makes the resulting position the logical origin.
    pub fn recenter(&self, settings: &StageSettings) -> Result<(), ControlError> {
        let (limit, center) = (settings.limit_travel_um, settings.center_travel_um);
        let phases = [
            (Axis::Y, -limit, settings.limit_velocity, "1/4: Hit reverse limit on y-axis ..."),
            (Axis::X, -limit, settings.limit_velocity, "2/4: Hit reverse limit on x-axis ..."),
            (Axis::Y, center, settings.center_velocity, "3/4: Centered y-axis ..."),
            (Axis::X, center, settings.center_velocity, "4/4: Centered x-axis ..."),
        ];
        for (axis, distance_um, velocity, done) in phases {
            self.move_axis(axis, distance_um, velocity)?;
            self.await_completion()?;
            self.sink.info(done);
        }

        let mut inner = self.inner.lock();
        let handle = inner.handle;
        let y = self.raw_um(handle, Axis::Y, inner.microstep_um)?;
        let x = self.raw_um(handle, Axis::X, inner.microstep_um)?;
        inner.offset = (y, x);
        inner.position = (0., 0.);
        tracing::info!(y_offset = y, x_offset = x, "stage origin redefined");
        self.sink.status(StatusSignal::PositionUpdated { y: 0., x: 0. });
        Ok(())
    }

    /// Immediate stop followed by a position refresh.
    pub fn halt(&self) -> Result<(f64, f64), ControlError> {
        {
            let mut inner = self.inner.lock();
            if inner.state == StageState::Disconnected {
                return Err(not_connected());
            }
            if let Err(err) = self.driver.stop(inner.handle) {
                self.sink
                    .error(format!("Error while stopping stage: {}", err));
                return Err(err.into());
            }
            inner.state = StageState::Idle;
        }
        self.refresh_position()
    }

    pub fn disconnect(&self) -> Result<(), ControlError> {
        if self.state() == StageState::Disconnected {
            return Ok(());
        }
        let halted = self.halt().map(|_| ());
        let mut inner = self.inner.lock();
        self.driver.release_handle(inner.handle);
        inner.handle = 0;
        inner.state = StageState::Disconnected;
        self.sink.info("MCL stage disconnected ...");
        self.sink.status(StatusSignal::StageDisconnected);
        halted
    }

    fn ready_handle(&self, inner: &StageInner) -> Result<i32, ControlError> {
        match inner.state {
            StageState::Disconnected => Err(not_connected()),
            StageState::Idle | StageState::Moving => Ok(inner.handle),
        }
    }

    fn raw_um(&self, handle: i32, axis: Axis, microstep_um: f64) -> Result<f64, ControlError> {
        match self.driver.position_microsteps(handle, axis) {
            Ok(steps) => Ok(steps as f64 * microstep_um),
            Err(err) => {
                self.sink.error(format!(
                    "Error while locating {:?} position: {}",
                    axis, err
                ));
                Err(err.into())
            }
        }
    }

    /// A lost controller drops the session; the handle is useless until reconnecting.
    fn motion_failed(&self, inner: &mut StageInner, err: McoError) -> ControlError {
        self.sink
            .error(format!("Error while moving the MCL stage: {}", err));
        if err == McoError::ConnectionLost {
            self.driver.release_handle(inner.handle);
            inner.handle = 0;
            inner.state = StageState::Disconnected;
            self.sink.status(StatusSignal::StageDisconnected);
        }
        err.into()
    }
}

/// The controller rejects zero-length moves: anything shorter than one microstep becomes one.
fn at_least_one_step(distance_um: f64, microstep_um: f64) -> f64 {
    if distance_um.abs() < microstep_um {
        microstep_um.copysign(distance_um)
    } else {
        distance_um
    }
}

fn not_connected() -> ControlError {
    ControlError::InvalidState("MCL stage not connected".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimStage, StageCall, SIM_MICROSTEP_MM};

    fn session() -> (Arc<SimStage>, StageSession) {
        let sim = Arc::new(SimStage::new().with_time_scale(0.));
        let (sink, _log) = MessageSink::new();
        let stage = StageSession::new(sim.clone(), sink);
        (sim, stage)
    }

    #[test]
    fn connect_reads_microstep() {
        let (_sim, stage) = session();
        assert!(stage.move_axis(Axis::Y, 10., 1.).is_err());
        stage.connect().unwrap();
        assert_eq!(stage.state(), StageState::Idle);
        assert!((stage.microstep_um() - SIM_MICROSTEP_MM * 1e3).abs() < 1e-12);

        let (sink, _log) = MessageSink::new();
        let absent = StageSession::new(Arc::new(SimStage::absent()), sink);
        assert_eq!(absent.connect(), Err(ControlError::StageNotFound));
    }

    #[test]
    fn tiny_moves_become_one_microstep() {
        let (sim, stage) = session();
        stage.connect().unwrap();
        stage.move_axis(Axis::X, -0.01, 1.).unwrap();
        let step_mm = SIM_MICROSTEP_MM;
        match sim.calls().last() {
            Some(StageCall::Move { distance_mm, .. }) => {
                assert!((distance_mm + step_mm).abs() < 1e-12)
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(at_least_one_step(25., 0.095), 25.);
        assert_eq!(at_least_one_step(0.01, 0.095), 0.095);
    }

    #[test]
    fn recenter_defines_origin() {
        let (_sim, stage) = session();
        stage.connect().unwrap();
        stage.recenter(&StageSettings::default()).unwrap();
        assert_eq!(stage.current_position(), (0., 0.));
        assert_eq!(stage.refresh_position().unwrap(), (0., 0.));

        stage.move_axis(Axis::Y, 500., 1.).unwrap();
        stage.await_completion().unwrap();
        let (y, x) = stage.current_position();
        assert!((y - 500.).abs() <= stage.microstep_um());
        assert_eq!(x, 0.);
    }

    #[test]
    fn failed_move_is_not_retried() {
        let (sim, stage) = session();
        stage.connect().unwrap();
        sim.clear_calls();
        sim.fail_next(McoError::DevNotReady);
        assert_eq!(
            stage.move_axis(Axis::Y, 100., 1.),
            Err(ControlError::Motion(McoError::DevNotReady))
        );
        assert_eq!(sim.calls().len(), 1);
        assert_eq!(stage.state(), StageState::Idle);

        sim.fail_next(McoError::ConnectionLost);
        assert!(matches!(
            stage.move_axis(Axis::Y, 100., 1.),
            Err(ControlError::ConnectionLost(_))
        ));
        assert_eq!(stage.state(), StageState::Disconnected);
    }

    #[test]
    fn disconnect_halts_and_releases() {
        let (sim, stage) = session();
        stage.connect().unwrap();
        stage.disconnect().unwrap();
        let calls = sim.calls();
        let n = calls.len();
        assert_eq!(&calls[n - 2..], &[StageCall::Stop, StageCall::Release]);
        assert_eq!(stage.state(), StageState::Disconnected);
        assert!(stage.disconnect().is_ok());
    }
}
