//! Event definitions flowing between producers and the consumer loop.
//!
//! Supervisors and monitors publish immutable `StatusEvent`s onto a single unbounded
//! FIFO queue; the consumer drains it on its own tick. `ControlCommand` describes the
//! requests typed on stdin (or raised by OS signals) that drive the supervision facade.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// A point-in-time host reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Global CPU load in percent.
    pub cpu_pct: f32,
    /// Used memory in bytes.
    pub used_mem: u64,
    /// Total memory in bytes.
    pub total_mem: u64,
    /// Usage of the working directory's disk in percent.
    pub disk_pct: f32,
}

impl ResourceSnapshot {
    pub fn memory_pct(&self) -> f32 {
        if self.total_mem == 0 {
            return 0.0;
        }
        (self.used_mem as f64 / self.total_mem as f64 * 100.0) as f32
    }

    pub fn cpu_hot(&self) -> bool {
        self.cpu_pct > 80.0
    }

    pub fn memory_hot(&self) -> bool {
        self.memory_pct() > 85.0
    }
}

impl fmt::Display for ResourceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        write!(
            f,
            "CPU: {:.1}% | RAM: {:.1}/{:.1} GB | Disk: {:.1}%",
            self.cpu_pct,
            self.used_mem as f64 / GIB,
            self.total_mem as f64 / GIB,
            self.disk_pct
        )
    }
}

/// An event published to the consumer loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A supervisor entered or left the running state.
    ServiceStatusChanged { name: String, running: bool },
    /// Result of the latest docker daemon probe.
    DockerSnapshot { text: String, healthy: bool },
    /// Latest CPU, memory and disk reading.
    ResourceSnapshot(ResourceSnapshot),
    /// Free-form notice for the user.
    UserMessage { text: String },
}

impl StatusEvent {
    pub fn message(text: impl Into<String>) -> Self {
        StatusEvent::UserMessage { text: text.into() }
    }
}

/// Creates the status queue shared by every producer.
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatusSender { tx }, StatusReceiver { rx })
}

/// Producer half; cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusSender {
    pub fn send(&self, event: StatusEvent) {
        if let Err(err) = self.tx.send(event) {
            tracing::trace!(event = ?err.0, "status consumer is gone");
        }
    }
}

/// Consumer half, owned by the single consumer loop.
#[derive(Debug)]
pub struct StatusReceiver {
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl StatusReceiver {
    /// Takes every event queued right now, in arrival order, without waiting.
    pub fn drain(&mut self) -> Vec<StatusEvent> {
        let mut batch = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }
}

/// A request for the supervision facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start(String),
    Stop(String),
    Restart(String),
    StartAll,
    StopAll,
    Task(String),
    Status,
    Quit,
}

impl ControlCommand {
    /// Parses one line of control input, e.g. `restart Laravel Server`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let named = |build: fn(String) -> ControlCommand| {
            if rest.is_empty() {
                Err(anyhow!("{} needs a service name", verb))
            } else {
                Ok(build(rest.to_string()))
            }
        };
        let command = match verb {
            "start" => named(ControlCommand::Start)?,
            "stop" => named(ControlCommand::Stop)?,
            "restart" => named(ControlCommand::Restart)?,
            "task" => named(ControlCommand::Task)?,
            "start-all" => ControlCommand::StartAll,
            "stop-all" => ControlCommand::StopAll,
            "status" => ControlCommand::Status,
            "quit" | "exit" => ControlCommand::Quit,
            "" => bail!("empty command"),
            other => bail!(
                "unknown command {:?} (try start, stop, restart, start-all, stop-all, task, status, quit)",
                other
            ),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_from_many_producers_arrive_in_send_order() {
        let (tx, mut rx) = status_channel();
        let producers = [
            StatusEvent::ServiceStatusChanged {
                name: "api".into(),
                running: true,
            },
            StatusEvent::DockerSnapshot {
                text: "Docker: Active".into(),
                healthy: true,
            },
            StatusEvent::message("hello"),
        ];
        for event in producers.clone() {
            let tx = tx.clone();
            std::thread::spawn(move || tx.send(event)).join().unwrap();
        }
        assert_eq!(rx.drain(), producers.to_vec());
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn drain_survives_a_closed_queue() {
        let (tx, mut rx) = status_channel();
        tx.send(StatusEvent::message("last words"));
        drop(tx);
        assert_eq!(rx.drain().len(), 1);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn send_after_consumer_dropped_is_silent() {
        let (tx, rx) = status_channel();
        drop(rx);
        tx.send(StatusEvent::message("nobody listens"));
    }

    #[test]
    fn resource_snapshot_formats_and_flags() {
        let snapshot = ResourceSnapshot {
            cpu_pct: 91.0,
            used_mem: 15 * 1024 * 1024 * 1024,
            total_mem: 16 * 1024 * 1024 * 1024,
            disk_pct: 42.0,
        };
        assert_eq!(
            snapshot.to_string(),
            "CPU: 91.0% | RAM: 15.0/16.0 GB | Disk: 42.0%"
        );
        assert!(snapshot.cpu_hot());
        assert!(snapshot.memory_hot());
        let idle = ResourceSnapshot {
            cpu_pct: 0.0,
            used_mem: 0,
            total_mem: 0,
            disk_pct: 0.0,
        };
        assert_eq!(idle.memory_pct(), 0.0);
        assert!(!idle.cpu_hot());
    }

    #[test]
    fn parses_control_commands() {
        assert_eq!(
            ControlCommand::parse("restart Laravel Server").unwrap(),
            ControlCommand::Restart("Laravel Server".into())
        );
        assert_eq!(
            ControlCommand::parse("  start-all ").unwrap(),
            ControlCommand::StartAll
        );
        assert_eq!(ControlCommand::parse("exit").unwrap(), ControlCommand::Quit);
        assert_eq!(
            ControlCommand::parse("task clear-cache").unwrap(),
            ControlCommand::Task("clear-cache".into())
        );
        assert!(ControlCommand::parse("stop").is_err());
        assert!(ControlCommand::parse("launch api").is_err());
        assert!(ControlCommand::parse("").is_err());
    }
}
