//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file
//! and provides functionality to load and parse it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::process::CommandLine;

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Delay between service launches in `start-all` (0 disables staggering).
    pub stagger_ms: Option<u64>,
    /// Cadence of the status queue drain.
    pub status_tick_ms: Option<u64>,
    /// Cadence of the log store flush.
    pub log_flush_ms: Option<u64>,
    /// Cadence of the docker daemon probe.
    pub docker_poll_ms: Option<u64>,
    /// Cadence of the CPU/RAM/disk sampler.
    pub resource_poll_ms: Option<u64>,
    /// Pending-output size per service that triggers eviction.
    pub log_ceiling: Option<usize>,
    /// Trailing slice kept after eviction.
    pub log_keep: Option<usize>,
    /// How long a stopping service may take to exit before it is force-killed.
    pub exit_timeout_ms: Option<u64>,
    /// How long `quit` waits for services to report stopped.
    pub quit_grace_ms: Option<u64>,
    /// Warn once a running service has been silent this long.
    pub silence_warning_secs: Option<u64>,
    /// Start every service at boot (default: true).
    pub autostart: Option<bool>,
    /// Print resource snapshots to the console (default: false).
    pub show_resources: Option<bool>,
    /// Command used to probe the docker daemon; empty disables the probe.
    pub docker_probe: Option<String>,
    /// Tools that must be on PATH; missing ones are reported at boot.
    pub requires: Option<Vec<String>>,
    /// Services to supervise, in registration order.
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceConfig>,
    /// One-shot maintenance commands.
    #[serde(rename = "task", default)]
    pub tasks: Vec<TaskConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Display name of the service; must be unique.
    pub name: String,
    /// Command to execute, as a string or an argument array.
    pub cmd: CommandLine,
    /// Working directory for the service.
    pub cwd: Option<String>,
    /// Color override for the service prefix.
    pub color: Option<String>,
    /// Environment variables to set for the service.
    pub env: Option<HashMap<String, String>>,
}

/// Configuration for a one-shot task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub cmd: CommandLine,
    pub description: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
