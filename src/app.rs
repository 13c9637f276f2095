//! Application state for the consumer loop.
//!
//! `App` is the only place presentation state changes. It applies drained status events
//! and flushed log batches in a fixed order and forwards them to a [`Presenter`]. A
//! presenter failure on one item never stops the rest of the batch.

use std::collections::HashMap;

use tracing::warn;

use crate::events::{ResourceSnapshot, StatusEvent};
use crate::present::Presenter;

/// Last known state of one service, as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    pub name: String,
    pub running: bool,
}

/// The main application state container.
pub struct App<P: Presenter> {
    presenter: P,
    services: Vec<ServiceView>,
    order: HashMap<String, usize>,
    docker: Option<(String, bool)>,
    resources: Option<ResourceSnapshot>,
}

impl<P: Presenter> App<P> {
    /// `names` is the registration order used for log batches.
    pub fn new(names: Vec<String>, presenter: P) -> Self {
        let order = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        let services = names
            .into_iter()
            .map(|name| ServiceView {
                name,
                running: false,
            })
            .collect();
        Self {
            presenter,
            services,
            order,
            docker: None,
            resources: None,
        }
    }

    /// Applies a drained status batch in arrival order.
    pub fn apply_status(&mut self, events: Vec<StatusEvent>) {
        for event in events {
            let result = match &event {
                StatusEvent::ServiceStatusChanged { name, running } => {
                    if let Some(&idx) = self.order.get(name) {
                        self.services[idx].running = *running;
                    }
                    self.presenter.on_status_changed(name, *running)
                }
                StatusEvent::DockerSnapshot { text, healthy } => {
                    self.docker = Some((text.clone(), *healthy));
                    self.presenter.on_docker_snapshot(text, *healthy)
                }
                StatusEvent::ResourceSnapshot(snapshot) => {
                    self.resources = Some(*snapshot);
                    self.presenter.on_resource_snapshot(snapshot)
                }
                StatusEvent::UserMessage { text } => self.presenter.on_message(text),
            };
            if let Err(err) = result {
                warn!(event = ?event, error = %format!("{:#}", err), "presenter rejected status event");
            }
        }
    }

    /// Applies a flushed log batch: registered services first, in registration order,
    /// then any other keys (such as `System`) sorted by name.
    pub fn apply_logs(&mut self, batch: HashMap<String, String>) {
        let mut entries: Vec<(String, String)> = batch.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| {
            let rank = |name: &String| self.order.get(name).copied().unwrap_or(usize::MAX);
            rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
        });
        for (name, text) in entries {
            if let Err(err) = self.presenter.on_log_available(&name, &text) {
                warn!(service = %name, error = %format!("{:#}", err), "presenter rejected log batch");
            }
        }
    }

    /// Shows a message that did not come through the status queue.
    pub fn notify(&mut self, text: &str) {
        if let Err(err) = self.presenter.on_message(text) {
            warn!(error = %format!("{:#}", err), "presenter rejected message");
        }
    }

    /// One line per service plus the latest host readings. `pids` holds the live
    /// process ids known to the supervisors.
    pub fn status_lines(&self, pids: &HashMap<String, u32>) -> Vec<String> {
        let mut lines: Vec<String> = self
            .services
            .iter()
            .map(|view| match (view.running, pids.get(&view.name)) {
                (true, Some(pid)) => format!("{}: running (pid {})", view.name, pid),
                (true, None) => format!("{}: running", view.name),
                (false, _) => format!("{}: stopped", view.name),
            })
            .collect();
        if let Some((text, _)) = &self.docker {
            lines.push(text.clone());
        }
        if let Some(snapshot) = &self.resources {
            lines.push(snapshot.to_string());
        }
        lines
    }

    /// Presents [`status_lines`](Self::status_lines).
    pub fn report_status(&mut self, pids: &HashMap<String, u32>) {
        for line in self.status_lines(pids) {
            self.notify(&line);
        }
    }
}
