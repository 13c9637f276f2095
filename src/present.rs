//! Presentation boundary.
//!
//! The consumer loop hands every drained event and log batch to a `Presenter`. The
//! console implementation prints prefixed lines; richer front ends plug in behind the
//! same trait.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use crossterm::style::{style, Color, Stylize};

use crate::events::ResourceSnapshot;
use crate::process::ServiceSpec;

const TOOL_MARK: &str = "◆ devrack:";

const PALETTE: [Color; 6] = [
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
    Color::Red,
];

/// Receives everything the consumer loop drains.
pub trait Presenter {
    /// New output for `name`; `text` holds one or more newline-terminated lines.
    fn on_log_available(&mut self, name: &str, text: &str) -> Result<()>;
    fn on_status_changed(&mut self, name: &str, running: bool) -> Result<()>;
    fn on_docker_snapshot(&mut self, text: &str, healthy: bool) -> Result<()>;
    fn on_resource_snapshot(&mut self, snapshot: &ResourceSnapshot) -> Result<()>;
    fn on_message(&mut self, text: &str) -> Result<()>;
}

/// Line-oriented presenter that writes `[name] line` to any writer.
pub struct ConsolePresenter<W: Write> {
    out: W,
    colors: HashMap<String, Color>,
    use_color: bool,
    show_resources: bool,
    docker_healthy: Option<bool>,
}

impl<W: Write> ConsolePresenter<W> {
    pub fn new(out: W, services: &[ServiceSpec], use_color: bool, show_resources: bool) -> Self {
        let colors = services
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                let color = spec
                    .color
                    .as_deref()
                    .and_then(parse_color)
                    .unwrap_or(PALETTE[idx % PALETTE.len()]);
                (spec.name.clone(), color)
            })
            .collect();
        Self {
            out,
            colors,
            use_color,
            show_resources,
            docker_healthy: None,
        }
    }

    fn prefix(&self, name: &str) -> String {
        let prefix = format!("[{}]", name);
        if !self.use_color {
            return prefix;
        }
        let color = self.colors.get(name).copied().unwrap_or(Color::DarkGrey);
        style(prefix).with(color).bold().to_string()
    }

    fn tool_line(&mut self, text: &str, color: Option<Color>) -> Result<()> {
        let line = format!("{} {}", TOOL_MARK, text);
        let written = match color {
            Some(color) if self.use_color => writeln!(self.out, "{}", style(line).with(color)),
            _ => writeln!(self.out, "{}", line),
        };
        written.context("failed to write to console")?;
        self.out.flush().context("failed to flush console")
    }
}

impl<W: Write> Presenter for ConsolePresenter<W> {
    fn on_log_available(&mut self, name: &str, text: &str) -> Result<()> {
        let prefix = self.prefix(name);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            writeln!(self.out, "{} {}", prefix, strip_existing_prefix(name, line))
                .context("failed to write to console")?;
        }
        self.out.flush().context("failed to flush console")
    }

    fn on_status_changed(&mut self, name: &str, running: bool) -> Result<()> {
        let (text, color) = if running {
            (format!("{} is running", name), Color::Green)
        } else {
            (format!("{} is stopped", name), Color::DarkGrey)
        };
        self.tool_line(&text, Some(color))
    }

    fn on_docker_snapshot(&mut self, text: &str, healthy: bool) -> Result<()> {
        if self.docker_healthy == Some(healthy) {
            return Ok(());
        }
        self.docker_healthy = Some(healthy);
        let color = if healthy { Color::Green } else { Color::Red };
        self.tool_line(text, Some(color))
    }

    fn on_resource_snapshot(&mut self, snapshot: &ResourceSnapshot) -> Result<()> {
        if !self.show_resources {
            return Ok(());
        }
        let color = if snapshot.cpu_hot() || snapshot.memory_hot() {
            Color::Red
        } else {
            Color::DarkGrey
        };
        self.tool_line(&snapshot.to_string(), Some(color))
    }

    fn on_message(&mut self, text: &str) -> Result<()> {
        self.tool_line(text, None)
    }
}

/// Maps a configured color name onto a terminal color.
pub fn parse_color(name: &str) -> Option<Color> {
    let color = match name.trim().to_lowercase().as_str() {
        "black" => Color::Black,
        "red" => Color::Red,
        "green" => Color::Green,
        "yellow" => Color::Yellow,
        "blue" => Color::Blue,
        "magenta" => Color::Magenta,
        "cyan" => Color::Cyan,
        "white" => Color::White,
        "gray" | "grey" => Color::DarkGrey,
        _ => return None,
    };
    Some(color)
}

// Supervisor notices already carry `[name] `; avoid printing it twice.
fn strip_existing_prefix<'a>(name: &str, line: &'a str) -> &'a str {
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_prefix(name))
        .and_then(|rest| rest.strip_prefix(']'))
        .map(str::trim_start)
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandLine;

    fn presenter(show_resources: bool) -> ConsolePresenter<Vec<u8>> {
        let services = vec![
            ServiceSpec::new("api", CommandLine::Shell("cargo run".into())),
            ServiceSpec::new("web", CommandLine::Shell("npm run dev".into())),
        ];
        ConsolePresenter::new(Vec::new(), &services, false, show_resources)
    }

    fn printed(presenter: ConsolePresenter<Vec<u8>>) -> String {
        String::from_utf8(presenter.out).unwrap()
    }

    #[test]
    fn prefixes_every_line_once() {
        let mut console = presenter(false);
        console
            .on_log_available("api", "[api] Starting: cargo run\nlistening\n\n  \n[apiary] ok\n")
            .unwrap();
        assert_eq!(
            printed(console),
            "[api] Starting: cargo run\n[api] listening\n[api] [apiary] ok\n"
        );
    }

    #[test]
    fn docker_is_printed_only_when_health_flips() {
        let mut console = presenter(false);
        console.on_docker_snapshot("Docker: Active", true).unwrap();
        console.on_docker_snapshot("Docker: Active", true).unwrap();
        console.on_docker_snapshot("Docker: Inactive", false).unwrap();
        console.on_docker_snapshot("Docker: Inactive", false).unwrap();
        assert_eq!(
            printed(console),
            "◆ devrack: Docker: Active\n◆ devrack: Docker: Inactive\n"
        );
    }

    #[test]
    fn resources_are_opt_in() {
        let snapshot = ResourceSnapshot {
            cpu_pct: 12.0,
            used_mem: 0,
            total_mem: 0,
            disk_pct: 42.0,
        };
        let mut quiet = presenter(false);
        quiet.on_resource_snapshot(&snapshot).unwrap();
        assert!(printed(quiet).is_empty());

        let mut loud = presenter(true);
        loud.on_resource_snapshot(&snapshot).unwrap();
        assert_eq!(
            printed(loud),
            "◆ devrack: CPU: 12.0% | RAM: 0.0/0.0 GB | Disk: 42.0%\n"
        );
    }

    #[test]
    fn status_and_messages_are_tool_lines() {
        let mut console = presenter(false);
        console.on_status_changed("web", true).unwrap();
        console.on_status_changed("web", false).unwrap();
        console.on_message("Local IP: 127.0.0.1").unwrap();
        assert_eq!(
            printed(console),
            "◆ devrack: web is running\n◆ devrack: web is stopped\n◆ devrack: Local IP: 127.0.0.1\n"
        );
    }

    #[test]
    fn colored_prefix_wraps_the_name() {
        let services = vec![ServiceSpec {
            color: Some("green".into()),
            ..ServiceSpec::new("api", CommandLine::Shell("cargo run".into()))
        }];
        let mut console = ConsolePresenter::new(Vec::new(), &services, true, false);
        console.on_log_available("api", "ready\n").unwrap();
        let out = printed(console);
        assert!(out.contains("[api]"));
        assert!(out.contains('\x1b'));
        assert!(out.ends_with(" ready\n"));
    }

    #[test]
    fn parses_color_names() {
        assert_eq!(parse_color("Green"), Some(Color::Green));
        assert_eq!(parse_color("grey"), Some(Color::DarkGrey));
        assert_eq!(parse_color("chartreuse"), None);
    }
}
