//! Outbound message stream for the UI.
//!
//! [`MessageSink`] is cloned into every session and worker; [`MessageLog`] is the single
//! receiving end the UI (or the CLI) drains. Every event is mirrored to `tracing`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::Level;

use crate::coordinator::DeviceKind;

#[derive(Clone, Debug, PartialEq)]
pub enum StatusSignal {
    DaqConnected,
    DaqDisconnected,
    StageConnected,
    StageDisconnected,
    /// A new buffer is staged on the board; `generation` increases with every load.
    SignalLoaded { generation: u64 },
    /// More than one operation is outstanding on `device`.
    OverlapWarning { device: DeviceKind, outstanding: usize },
    PositionUpdated { y: f64, x: f64 },
}

impl fmt::Display for StatusSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSignal::DaqConnected => write!(f, "DAQ connected"),
            StatusSignal::DaqDisconnected => write!(f, "DAQ disconnected"),
            StatusSignal::StageConnected => write!(f, "Stage connected"),
            StatusSignal::StageDisconnected => write!(f, "Stage disconnected"),
            StatusSignal::SignalLoaded { generation } => {
                write!(f, "DAQ signal #{} loaded", generation)
            }
            StatusSignal::OverlapWarning {
                device,
                outstanding,
            } => write!(f, "{} thread count is {} (expected at most 1)", device, outstanding),
            StatusSignal::PositionUpdated { y, x } => {
                write!(f, "Stage at ({:.2},{:.2}) µm", y, x)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventBody {
    Message { level: Level, text: String },
    Status(StatusSignal),
}

#[derive(Clone, Debug)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub body: EventBody,
}

impl LogEvent {
    pub fn text(&self) -> String {
        match &self.body {
            EventBody::Message { text, .. } => text.clone(),
            EventBody::Status(signal) => signal.to_string(),
        }
    }

    /// `HH:MM:SS: text`, the line format of the UI log.
    pub fn render(&self) -> String {
        format!("{}: {}", self.timestamp.format("%H:%M:%S"), self.text())
    }

    pub fn status(&self) -> Option<&StatusSignal> {
        match &self.body {
            EventBody::Status(signal) => Some(signal),
            EventBody::Message { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct MessageSink {
    tx: Sender<LogEvent>,
}

impl MessageSink {
    pub fn new() -> (Self, MessageLog) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, MessageLog { rx })
    }

    pub fn message(&self, level: Level, text: impl Into<String>) {
        let text = text.into();
        match level {
            Level::ERROR => tracing::error!("{}", text),
            Level::WARN => tracing::warn!("{}", text),
            Level::INFO => tracing::info!("{}", text),
            Level::DEBUG => tracing::debug!("{}", text),
            Level::TRACE => tracing::trace!("{}", text),
        }
        self.post(EventBody::Message { level, text });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(Level::INFO, text)
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.message(Level::WARN, text)
    }

    pub fn error(&self, text: impl Into<String>) {
        self.message(Level::ERROR, text)
    }

    pub fn status(&self, signal: StatusSignal) {
        match &signal {
            StatusSignal::OverlapWarning { .. } => tracing::warn!(status = %signal),
            _ => tracing::info!(status = %signal),
        }
        self.post(EventBody::Status(signal));
    }

    fn post(&self, body: EventBody) {
        // A closed log only means nobody is watching any more
        let _ = self.tx.send(LogEvent {
            timestamp: Local::now(),
            body,
        });
    }
}

pub struct MessageLog {
    rx: Receiver<LogEvent>,
}

impl MessageLog {
    /// Every event posted since the previous drain, oldest first.
    pub fn drain(&self) -> Vec<LogEvent> {
        self.rx.try_iter().collect()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<LogEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order_and_render() {
        let (sink, log) = MessageSink::new();
        sink.info("Board# 0 initialized");
        sink.status(StatusSignal::SignalLoaded { generation: 3 });
        sink.clone().warn("late");

        let events = log.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].text(), "Board# 0 initialized");
        assert_eq!(
            events[1].status(),
            Some(&StatusSignal::SignalLoaded { generation: 3 })
        );
        assert!(matches!(
            events[2].body,
            EventBody::Message { level: Level::WARN, .. }
        ));

        let line = events[0].render();
        // HH:MM:SS prefix
        assert_eq!(&line[2..3], ":");
        assert!(line.ends_with(": Board# 0 initialized"));
        assert!(log.drain().is_empty());
    }

    #[test]
    fn sink_outlives_log() {
        let (sink, log) = MessageSink::new();
        drop(log);
        sink.error("nobody listens");
    }
}
