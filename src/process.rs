//! Data structures describing supervised services.
//!
//! This module defines the immutable service description (`ServiceSpec`), the way its
//! command line is expressed (`CommandLine`), the supervisor lifecycle (`Lifecycle`) and
//! the platform-specific program aliasing applied right before a child is spawned.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// A command as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// A single string split with shell-style word rules.
    Shell(String),
    /// A pre-split argument vector, passed through untouched.
    Args(Vec<String>),
}

impl CommandLine {
    /// Returns the argument vector, program first.
    pub fn argv(&self) -> Result<Vec<String>> {
        let parts = match self {
            CommandLine::Shell(raw) => shell_words::split(raw)
                .with_context(|| format!("failed to parse command {:?}", raw))?,
            CommandLine::Args(args) => args.clone(),
        };
        if parts.first().map_or(true, |program| program.is_empty()) {
            bail!("empty command");
        }
        Ok(parts)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(raw) => f.write_str(raw),
            CommandLine::Args(args) => f.write_str(&shell_words::join(args)),
        }
    }
}

/// Specification for a supervised service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service name; also the key in the log store.
    pub name: String,
    /// Command to launch.
    pub command: CommandLine,
    /// Working directory; the current directory when unset.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Color used for the service prefix in console output.
    pub color: Option<String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: CommandLine) -> Self {
        Self {
            name: name.into(),
            command,
            cwd: None,
            env: HashMap::new(),
            color: None,
        }
    }
}

/// A one-shot maintenance command, run to completion on request.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub command: CommandLine,
    /// Human label used in the framing log lines.
    pub description: String,
}

/// Lifecycle of a service supervisor.
///
/// `Off -> Starting -> Running -> Stopping -> Off`. A failed launch goes straight from
/// `Running` back to `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Off,
    Starting,
    Running,
    Stopping,
}

impl Lifecycle {
    pub fn is_running(self) -> bool {
        self != Lifecycle::Off
    }
}

/// Target platform for command aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

// Package managers ship as batch launchers on Windows, which CreateProcess will not
// find by their bare name.
const WINDOWS_CMD_SHIMS: &[&str] = &["npm", "npx", "pnpm", "yarn"];

/// Maps a program name to the executable that actually has to be launched.
pub fn resolve_program(program: &str, platform: Platform) -> String {
    match platform {
        Platform::Windows if WINDOWS_CMD_SHIMS.contains(&program) => format!("{}.cmd", program),
        _ => program.to_string(),
    }
}

/// Applies [`resolve_program`] to the first element of an argument vector.
pub fn resolve_argv(mut argv: Vec<String>, platform: Platform) -> Vec<String> {
    if let Some(program) = argv.first_mut() {
        *program = resolve_program(program, platform);
    }
    argv
}
