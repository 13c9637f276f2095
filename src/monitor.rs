//! Background host monitors.
//!
//! Each monitor runs on its own task, samples on a fixed cadence and publishes a snapshot
//! onto the status queue. Monitors never touch presentation state and never raise: a
//! failed probe is reported as an unhealthy snapshot.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use sysinfo::{Disks, System};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use crate::events::{ResourceSnapshot, StatusEvent, StatusSender};
use crate::process::{resolve_program, CommandLine, Platform};

/// Fixed-cadence tick source that stops once shutdown is announced.
pub struct Periodic {
    ticker: Interval,
    shutdown: watch::Receiver<bool>,
}

impl Periodic {
    pub fn new(period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticker, shutdown }
    }

    /// Waits for the next tick. Returns `false` once the loop should exit.
    pub async fn tick(&mut self) -> bool {
        loop {
            if *self.shutdown.borrow_and_update() {
                return false;
            }
            tokio::select! {
                _ = self.ticker.tick() => return !*self.shutdown.borrow(),
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Settings for the docker daemon probe.
#[derive(Debug, Clone)]
pub struct DockerProbe {
    pub command: CommandLine,
    pub timeout: Duration,
}

impl Default for DockerProbe {
    fn default() -> Self {
        Self {
            command: CommandLine::Shell("docker info".into()),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Polls the docker daemon and publishes `DockerSnapshot`s.
pub fn spawn_docker_monitor(
    probe: DockerProbe,
    period: Duration,
    status: StatusSender,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut periodic = Periodic::new(period, shutdown);
        while periodic.tick().await {
            status.send(docker_snapshot(&probe).await);
        }
        debug!("docker monitor stopped");
    })
}

/// Runs the probe once and turns the outcome into a snapshot.
pub async fn docker_snapshot(probe: &DockerProbe) -> StatusEvent {
    match run_probe(&probe.command, probe.timeout).await {
        Ok(()) => StatusEvent::DockerSnapshot {
            text: "Docker: Active".into(),
            healthy: true,
        },
        Err(err) => {
            debug!(error = %format!("{:#}", err), "docker probe failed");
            StatusEvent::DockerSnapshot {
                text: "Docker: Inactive".into(),
                healthy: false,
            }
        }
    }
}

async fn run_probe(command: &CommandLine, timeout: Duration) -> Result<()> {
    let argv = command.argv()?;
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty probe"))?;
    let mut probe = Command::new(resolve_program(program, Platform::current()));
    probe
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        probe.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
    }
    let status = tokio::time::timeout(timeout, probe.status())
        .await
        .map_err(|_| anyhow!("probe timed out after {:?}", timeout))?
        .with_context(|| format!("failed to run {}", program))?;
    ensure!(status.success(), "{} exited with {}", program, status);
    Ok(())
}

/// Samples CPU, memory and disk usage through `sysinfo`.
pub struct ResourceSampler {
    system: System,
    disk_path: PathBuf,
}

impl ResourceSampler {
    /// `disk_path` selects the disk to report: the one mounted closest above it.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: System::new(),
            disk_path: disk_path.into(),
        }
    }

    /// Takes a reading. CPU load is measured since the previous call, so the first
    /// reading is usually 0.
    pub fn sample(&mut self) -> ResourceSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space()));
        ResourceSnapshot {
            cpu_pct: self.system.global_cpu_usage(),
            used_mem: self.system.used_memory(),
            total_mem: self.system.total_memory(),
            disk_pct: disk_usage_for(&self.disk_path, mounts),
        }
    }
}

/// Usage percent of the mount that is the longest prefix of `path`; 0 when none match.
pub fn disk_usage_for<'a>(
    path: &Path,
    mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>,
) -> f32 {
    mounts
        .into_iter()
        .filter(|(mount, total, _)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, available)| {
            let used = total.saturating_sub(available);
            (used as f64 / total as f64 * 100.0) as f32
        })
        .unwrap_or(0.0)
}

/// Samples host resources and publishes `ResourceSnapshot`s.
pub fn spawn_resource_monitor(
    mut sampler: ResourceSampler,
    period: Duration,
    status: StatusSender,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut periodic = Periodic::new(period, shutdown);
        while periodic.tick().await {
            status.send(StatusEvent::ResourceSnapshot(sampler.sample()));
        }
        debug!("resource monitor stopped");
    })
}

/// Returns the tools from `tools` that cannot be run with `--version`.
pub async fn missing_tools(tools: &[String], timeout: Duration) -> Vec<String> {
    let mut missing = Vec::new();
    for tool in tools {
        let probe = CommandLine::Args(vec![tool.clone(), "--version".into()]);
        if let Err(err) = run_probe(&probe, timeout).await {
            debug!(tool = %tool, error = %format!("{:#}", err), "required tool unavailable");
            missing.push(tool.clone());
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::status_channel;

    #[test]
    fn disk_usage_picks_the_deepest_mount() {
        let mounts = [
            (Path::new("/"), 100, 50),
            (Path::new("/home"), 200, 20),
            (Path::new("/home/other"), 10, 0),
        ];
        let usage = disk_usage_for(Path::new("/home/dev/project"), mounts);
        assert!((usage - 90.0).abs() < 0.01);
        let root = disk_usage_for(Path::new("/srv/app"), mounts);
        assert!((root - 50.0).abs() < 0.01);
    }

    #[test]
    fn disk_usage_without_a_matching_mount_is_zero() {
        let mounts = [(Path::new("/data"), 100, 10), (Path::new("/"), 0, 0)];
        assert_eq!(disk_usage_for(Path::new("/srv"), mounts), 0.0);
    }

    #[test]
    fn sampler_reports_plausible_memory() {
        let mut sampler = ResourceSampler::new(std::env::temp_dir());
        let snapshot = sampler.sample();
        assert!(snapshot.total_mem > 0);
        assert!(snapshot.used_mem <= snapshot.total_mem);
        assert!((0.0..=100.0).contains(&snapshot.disk_pct));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_outcome_maps_to_health() {
        let healthy = DockerProbe {
            command: CommandLine::Shell("true".into()),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            docker_snapshot(&healthy).await,
            StatusEvent::DockerSnapshot {
                text: "Docker: Active".into(),
                healthy: true
            }
        );
        for command in ["false", "devrack-no-such-binary-4f2a info"] {
            let probe = DockerProbe {
                command: CommandLine::Shell(command.into()),
                timeout: Duration::from_secs(5),
            };
            assert!(matches!(
                docker_snapshot(&probe).await,
                StatusEvent::DockerSnapshot { healthy: false, .. }
            ));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_probe_times_out_as_inactive() {
        let probe = DockerProbe {
            command: CommandLine::Shell("sleep 5".into()),
            timeout: Duration::from_millis(100),
        };
        assert!(matches!(
            docker_snapshot(&probe).await,
            StatusEvent::DockerSnapshot { healthy: false, .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_tools_lists_only_unavailable_ones() {
        let tools = vec!["true".to_string(), "devrack-no-such-binary-4f2a".to_string()];
        let missing = missing_tools(&tools, Duration::from_secs(5)).await;
        assert_eq!(missing, vec!["devrack-no-such-binary-4f2a".to_string()]);
    }

    #[tokio::test]
    async fn periodic_loops_stop_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status, mut rx) = status_channel();
        let handle = spawn_resource_monitor(
            ResourceSampler::new(std::env::temp_dir()),
            Duration::from_millis(20),
            status,
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
        let snapshots = rx.drain();
        assert!(!snapshots.is_empty());
        assert!(snapshots
            .iter()
            .all(|event| matches!(event, StatusEvent::ResourceSnapshot(_))));
    }

    #[tokio::test]
    async fn periodic_returns_false_when_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        let mut periodic = Periodic::new(Duration::from_millis(10), rx);
        assert!(!periodic.tick().await);
    }
}
