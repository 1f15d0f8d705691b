//! Worker dispatch and per-device single-flight bookkeeping.
//!
//! Every device task holds an [`OperationGuard`] for its whole run. The guard is taken on the
//! caller's thread before the worker is spawned, so a barrier issued right after
//! [`TaskCoordinator::dispatch`] already sees the new task. A count above one is an overlap
//! hazard: it is reported as [`StatusSignal::OverlapWarning`] but never refused here.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::ControlError;
use crate::log::{MessageSink, StatusSignal};

/// Poll interval of the completion barriers.
pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Daq,
    Stage,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Daq => write!(f, "DAQ"),
            DeviceKind::Stage => write!(f, "Stage"),
        }
    }
}

struct Counters {
    outstanding: Mutex<IndexMap<DeviceKind, usize>>,
    changed: Condvar,
}

#[derive(Clone)]
pub struct TaskCoordinator {
    counters: Arc<Counters>,
    sink: MessageSink,
    poll_interval: Duration,
}

impl TaskCoordinator {
    pub fn new(sink: MessageSink) -> Self {
        let outstanding = [DeviceKind::Daq, DeviceKind::Stage]
            .into_iter()
            .map(|device| (device, 0))
            .collect();
        Self {
            counters: Arc::new(Counters {
                outstanding: Mutex::new(outstanding),
                changed: Condvar::new(),
            }),
            sink,
            poll_interval: TASK_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn outstanding(&self, device: DeviceKind) -> usize {
        self.counters
            .outstanding
            .lock()
            .get(&device)
            .copied()
            .unwrap_or(0)
    }

    /// Counts one more operation on `device` until the returned guard drops.
    pub fn begin(&self, device: DeviceKind) -> OperationGuard {
        let outstanding = {
            let mut counts = self.counters.outstanding.lock();
            let count = counts.entry(device).or_insert(0);
            *count += 1;
            *count
        };
        tracing::trace!(%device, outstanding, "operation started");
        if outstanding > 1 {
            self.sink.warn(format!(
                "More than one {} operation in flight ({}); wait for the previous one to finish",
                device, outstanding
            ));
            self.sink.status(StatusSignal::OverlapWarning {
                device,
                outstanding,
            });
        }
        OperationGuard {
            counters: self.counters.clone(),
            device,
        }
    }

    /// Runs `task` on its own named worker thread.
    ///
    /// With `device` set the task counts as an outstanding operation on it from this call until
    /// it returns. Failures are posted to the message log and handed back through
    /// [`TaskHandle::join`].
    pub fn dispatch<T, F>(
        &self,
        name: &str,
        device: Option<DeviceKind>,
        task: F,
    ) -> Result<TaskHandle<T>, ControlError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ControlError> + Send + 'static,
    {
        let guard = device.map(|device| self.begin(device));
        let sink = self.sink.clone();
        let task_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = task();
                drop(guard);
                match &result {
                    Ok(_) => sink.message(Level::DEBUG, format!("{} finished", task_name)),
                    Err(err) => sink.error(format!("{} failed: {}", task_name, err)),
                }
                result
            })
            .map_err(|err| {
                ControlError::InvalidState(format!("could not spawn worker {}: {}", name, err))
            })?;
        Ok(TaskHandle {
            name: name.to_string(),
            handle,
        })
    }

    /// Polls until at most `target` operations are outstanding on `device`.
    pub fn await_count(&self, device: DeviceKind, target: usize) {
        let mut counts = self.counters.outstanding.lock();
        while counts.get(&device).copied().unwrap_or(0) > target {
            self.counters
                .changed
                .wait_for(&mut counts, self.poll_interval);
        }
    }
}

/// Outstanding-operation token of one device.
pub struct OperationGuard {
    counters: Arc<Counters>,
    device: DeviceKind,
}

impl OperationGuard {
    pub fn device(&self) -> DeviceKind {
        self.device
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut counts = self.counters.outstanding.lock();
        if let Some(count) = counts.get_mut(&self.device) {
            *count = count.saturating_sub(1);
        }
        self.counters.changed.notify_all();
    }
}

/// Completion channel of a dispatched task.
pub struct TaskHandle<T> {
    name: String,
    handle: JoinHandle<Result<T, ControlError>>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the task returns. A panicking worker comes back as `InvalidState`.
    pub fn join(self) -> Result<T, ControlError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(ControlError::InvalidState(format!(
                "worker {} panicked",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn coordinator() -> (TaskCoordinator, crate::log::MessageLog) {
        let (sink, log) = MessageSink::new();
        (
            TaskCoordinator::new(sink).with_poll_interval(Duration::from_millis(5)),
            log,
        )
    }

    #[test]
    fn counter_covers_task_lifetime() {
        let (coord, _log) = coordinator();
        let (go_tx, go_rx) = channel::bounded::<()>(0);
        let task = coord
            .dispatch("hold", Some(DeviceKind::Daq), move || {
                go_rx.recv().map_err(|e| ControlError::InvalidState(e.to_string()))
            })
            .unwrap();
        // Counted before the worker had a chance to run
        assert_eq!(coord.outstanding(DeviceKind::Daq), 1);
        assert_eq!(coord.outstanding(DeviceKind::Stage), 0);

        go_tx.send(()).unwrap();
        task.join().unwrap();
        coord.await_count(DeviceKind::Daq, 0);
        assert_eq!(coord.outstanding(DeviceKind::Daq), 0);
    }

    #[test]
    fn overlap_is_reported_not_refused() {
        let (coord, log) = coordinator();
        let first = coord.begin(DeviceKind::Stage);
        let second = coord.begin(DeviceKind::Stage);
        assert_eq!(second.device(), DeviceKind::Stage);
        let warnings: Vec<_> = log
            .drain()
            .into_iter()
            .filter_map(|event| event.status().cloned())
            .collect();
        assert_eq!(
            warnings,
            vec![StatusSignal::OverlapWarning {
                device: DeviceKind::Stage,
                outstanding: 2
            }]
        );
        drop(first);
        coord.await_count(DeviceKind::Stage, 1);
        drop(second);
        assert_eq!(coord.outstanding(DeviceKind::Stage), 0);
    }

    #[test]
    fn errors_come_back_through_join() {
        let (coord, log) = coordinator();
        let task = coord
            .dispatch("fails", None, || -> Result<(), _> {
                Err(ControlError::StageNotFound)
            })
            .unwrap();
        assert_eq!(task.name(), "fails");
        assert_eq!(task.join(), Err(ControlError::StageNotFound));
        assert!(log
            .drain()
            .iter()
            .any(|event| event.text().starts_with("fails failed")));
    }

    #[test]
    fn panicking_worker_is_contained() {
        let (coord, _log) = coordinator();
        let task = coord
            .dispatch("boom", Some(DeviceKind::Daq), || -> Result<(), ControlError> {
                panic!("driver exploded")
            })
            .unwrap();
        assert!(matches!(task.join(), Err(ControlError::InvalidState(_))));
        // The guard is released during unwinding
        assert_eq!(coord.outstanding(DeviceKind::Daq), 0);
    }
}
