//! devrack: supervises local development services and multiplexes their output.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, starts the supervisors and monitors, and runs the consumer
//! loop that drains status events and log batches into the console.

mod app;
mod config;
mod events;
mod monitor;
mod output;
mod present;
mod process;
mod runner;

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, IsTerminal};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::{Config, ServiceConfig, TaskConfig};
use crate::events::{status_channel, ControlCommand, StatusEvent, StatusReceiver, StatusSender};
use crate::monitor::{DockerProbe, ResourceSampler};
use crate::output::LogAggregator;
use crate::present::{ConsolePresenter, Presenter};
use crate::process::{CommandLine, ServiceSpec, TaskSpec};
use crate::runner::{ManagerOptions, ServiceManager, SupervisorOptions};

const CONFIG_FILE: &str = "devrack.toml";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Local development service supervisor",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any devrack.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Delay between service launches (ms).
    #[arg(long)]
    stagger_ms: Option<u64>,
    /// Launch all services at once.
    #[arg(long)]
    no_stagger: bool,
    /// Interval between log flushes (ms).
    #[arg(long)]
    log_flush_ms: Option<u64>,
    /// Do not start services at boot.
    #[arg(long)]
    no_autostart: bool,
    /// Disable the docker daemon probe.
    #[arg(long)]
    no_docker: bool,
    /// Disable the CPU/RAM/disk sampler.
    #[arg(long)]
    no_resources: bool,
    /// Print resource snapshots to the console.
    #[arg(long)]
    show_resources: bool,
    /// Ignore control commands on stdin.
    #[arg(long)]
    no_input: bool,
    /// Enable debug diagnostics on stderr.
    #[arg(long, short)]
    verbose: bool,
    /// Service definitions: --name <name> [--cwd <dir>] [--env K=V] [--color <c>] -- <cmd> [args...]
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show version information.
    Version,
    /// Validate the configuration and check required tools.
    Check,
    /// Run one task and exit with its status.
    Task {
        /// Task name from the configuration.
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Some(Commands::Version) = &cli.command {
        println!("devrack {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let project = load_project(&cli)?;
    match &cli.command {
        Some(Commands::Check) => run_check(&project).await,
        Some(Commands::Task { name }) => run_single_task(&project, name).await,
        _ => {
            if project.services.is_empty() {
                bail!("no services defined (use devrack.toml or -- --name ... -- cmd)");
            }
            run(project).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(project: Project) -> Result<()> {
    let Project {
        services,
        tasks,
        settings,
    } = project;
    let logs = Arc::new(LogAggregator::new(settings.log_ceiling, settings.log_keep));
    let (status, mut status_rx) = status_channel();
    let manager = Arc::new(ServiceManager::new(
        services.clone(),
        tasks,
        Arc::clone(&logs),
        status.clone(),
        settings.manager_options(),
    )?);
    let presenter = ConsolePresenter::new(
        std::io::stdout(),
        &services,
        std::io::stdout().is_terminal(),
        settings.show_resources,
    );
    let mut app = App::new(manager.names(), presenter);

    status.send(StatusEvent::message(format!("Local IP: {}", local_ip().await)));
    if !settings.requires.is_empty() {
        spawn_preflight(settings.requires.clone(), status.clone());
    }
    if let Some(command) = settings.docker_probe.clone() {
        let probe = DockerProbe {
            command,
            ..DockerProbe::default()
        };
        monitor::spawn_docker_monitor(
            probe,
            settings.docker_poll,
            status.clone(),
            manager.shutdown_signal(),
        );
    }
    if settings.resources {
        let disk_path = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        monitor::spawn_resource_monitor(
            ResourceSampler::new(disk_path),
            settings.resource_poll,
            status.clone(),
            manager.shutdown_signal(),
        );
    }

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    spawn_signal_listener(control_tx.clone());
    if settings.input_enabled {
        spawn_stdin_listener(control_tx, status.clone());
    }
    if settings.autostart {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.start_all().await });
    }

    let mut status_tick = ticker(settings.status_tick);
    let mut log_tick = ticker(settings.log_flush);
    loop {
        tokio::select! {
            _ = status_tick.tick() => app.apply_status(status_rx.drain()),
            _ = log_tick.tick() => app.apply_logs(logs.flush()),
            command = control_rx.recv() => match command {
                Some(ControlCommand::Quit) | None => break,
                Some(command) => handle_control(command, &manager, &mut app, &status),
            },
        }
    }

    if !shut_down(&manager, &logs, &mut status_rx, &mut app, &settings).await {
        warn!(grace = ?settings.quit_grace, "services still stopping at exit");
    }
    info!("bye");
    Ok(())
}

/// Quits every service and keeps presenting until they report `Off` or the grace
/// period ends, then drains both queues once more. Returns whether all stopped.
async fn shut_down<P: Presenter>(
    manager: &ServiceManager,
    logs: &LogAggregator,
    status_rx: &mut StatusReceiver,
    app: &mut App<P>,
    settings: &RunSettings,
) -> bool {
    manager.quit();
    let mut status_tick = ticker(settings.status_tick);
    let mut log_tick = ticker(settings.log_flush);
    let stopped = manager.wait_stopped(settings.quit_grace);
    tokio::pin!(stopped);
    let drained = loop {
        tokio::select! {
            done = &mut stopped => break done,
            _ = status_tick.tick() => app.apply_status(status_rx.drain()),
            _ = log_tick.tick() => app.apply_logs(logs.flush()),
        }
    };
    // A supervisor reports `Off` only after its final notices are queued.
    app.apply_status(status_rx.drain());
    app.apply_logs(logs.flush());
    drained
}

fn handle_control<P: Presenter>(
    command: ControlCommand,
    manager: &Arc<ServiceManager>,
    app: &mut App<P>,
    status: &StatusSender,
) {
    debug!(?command, "control command");
    let result = match command {
        ControlCommand::Start(name) => manager.start(&name).map(|started| {
            if !started {
                status.send(StatusEvent::message(format!("{} is already running", name)));
            }
        }),
        ControlCommand::Stop(name) => manager.stop(&name),
        ControlCommand::Restart(name) => {
            let manager = Arc::clone(manager);
            let status = status.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.restart(&name).await {
                    status.send(StatusEvent::message(format!("{:#}", err)));
                }
            });
            Ok(())
        }
        ControlCommand::StartAll => {
            let manager = Arc::clone(manager);
            tokio::spawn(async move { manager.start_all().await });
            Ok(())
        }
        ControlCommand::StopAll => {
            manager.stop_all();
            Ok(())
        }
        ControlCommand::Task(name) => {
            let manager = Arc::clone(manager);
            let status = status.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.run_task(&name).await {
                    status.send(StatusEvent::message(format!("{:#}", err)));
                }
            });
            Ok(())
        }
        ControlCommand::Status => {
            let pids: HashMap<String, u32> = manager
                .services()
                .filter_map(|svc| svc.pid().map(|pid| (svc.name().to_string(), pid)))
                .collect();
            app.report_status(&pids);
            let tasks: Vec<&str> = manager.tasks().iter().map(|task| task.name.as_str()).collect();
            if !tasks.is_empty() {
                app.notify(&format!("Tasks: {}", tasks.join(", ")));
            }
            Ok(())
        }
        ControlCommand::Quit => Ok(()),
    };
    if let Err(err) = result {
        app.notify(&format!("{:#}", err));
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

// Address of the interface that would route to the internet; no packet is sent.
async fn local_ip() -> IpAddr {
    let probe = async {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        Ok::<_, std::io::Error>(socket.local_addr()?.ip())
    };
    match probe.await {
        Ok(ip) => ip,
        Err(err) => {
            debug!(error = %err, "local ip lookup failed");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn spawn_preflight(tools: Vec<String>, status: StatusSender) {
    tokio::spawn(async move {
        let missing = monitor::missing_tools(&tools, Duration::from_secs(10)).await;
        if !missing.is_empty() {
            status.send(StatusEvent::message(format!(
                "Missing tools: {}",
                missing.join(", ")
            )));
        }
    });
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<ControlCommand>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(ControlCommand::Quit);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(ControlCommand::Quit);
    });
}

fn spawn_stdin_listener(tx: mpsc::UnboundedSender<ControlCommand>, status: StatusSender) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    debug!(error = %err, "stdin closed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match ControlCommand::parse(&line) {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(err) => status.send(StatusEvent::message(format!("{:#}", err))),
            }
        }
    });
}

async fn run_check(project: &Project) -> Result<()> {
    for spec in &project.services {
        println!("service {}: {}", spec.name, spec.command);
    }
    for task in &project.tasks {
        println!("task {}: {}", task.name, task.command);
    }
    let missing = monitor::missing_tools(&project.settings.requires, Duration::from_secs(10)).await;
    if !missing.is_empty() {
        bail!("missing tools: {}", missing.join(", "));
    }
    println!("configuration ok");
    Ok(())
}

async fn run_single_task(project: &Project, name: &str) -> Result<()> {
    let task = project
        .tasks
        .iter()
        .find(|task| task.name == name)
        .ok_or_else(|| anyhow!("unknown task: {}", name))?;
    let logs = LogAggregator::new(project.settings.log_ceiling, project.settings.log_keep);
    let (status, mut status_rx) = status_channel();
    let succeeded = runner::run_oneshot(task, &logs, &status).await;
    let presenter = ConsolePresenter::new(
        std::io::stdout(),
        &[],
        std::io::stdout().is_terminal(),
        false,
    );
    let mut app = App::new(Vec::new(), presenter);
    app.apply_logs(logs.flush());
    app.apply_status(status_rx.drain());
    if !succeeded {
        bail!("task {} failed", name);
    }
    Ok(())
}

/// Everything resolved from the config file and the command line.
#[derive(Debug)]
struct Project {
    services: Vec<ServiceSpec>,
    tasks: Vec<TaskSpec>,
    settings: RunSettings,
}

fn load_project(cli: &Cli) -> Result<Project> {
    let mut config = Config::default();
    if !cli.no_config {
        let config_path = cli
            .config
            .clone()
            .or_else(|| default_config_path().filter(|path| path.exists()));
        if let Some(path) = config_path {
            config = config::load_config(&path)?;
        }
    }

    let mut services = Vec::new();
    for service in std::mem::take(&mut config.services) {
        services.push(spec_from_config(service)?);
    }
    if !cli.args.is_empty() {
        services.extend(parse_cli_processes(&cli.args)?);
    }
    ensure_unique_names(&services)?;

    let mut tasks = Vec::new();
    for task in std::mem::take(&mut config.tasks) {
        tasks.push(task_from_config(task)?);
    }
    let settings = RunSettings::from_cli(cli, &config)?;
    Ok(Project {
        services,
        tasks,
        settings,
    })
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn spec_from_config(config: ServiceConfig) -> Result<ServiceSpec> {
    config
        .cmd
        .argv()
        .with_context(|| format!("invalid cmd for service {}", config.name))?;
    Ok(ServiceSpec {
        name: config.name,
        command: config.cmd,
        cwd: config.cwd,
        env: config.env.unwrap_or_default(),
        color: config.color,
    })
}

fn task_from_config(config: TaskConfig) -> Result<TaskSpec> {
    config
        .cmd
        .argv()
        .with_context(|| format!("invalid cmd for task {}", config.name))?;
    let description = config.description.unwrap_or_else(|| config.name.clone());
    Ok(TaskSpec {
        name: config.name,
        command: config.cmd,
        description,
    })
}

fn parse_cli_processes(args: &[String]) -> Result<Vec<ServiceSpec>> {
    let mut specs = Vec::new();
    let mut idx = 0;
    while idx < args.len() {
        if args[idx] != "--name" {
            bail!("expected --name, got {}", args[idx]);
        }
        idx += 1;
        let name = args
            .get(idx)
            .ok_or_else(|| anyhow!("missing name after --name"))?
            .clone();
        idx += 1;
        let mut cwd = None;
        let mut env = HashMap::new();
        let mut color = None;
        while idx < args.len() && args[idx] != "--" {
            let option = args[idx].as_str();
            idx += 1;
            let value = args
                .get(idx)
                .ok_or_else(|| anyhow!("missing value for {}", option))?;
            match option {
                "--cwd" => cwd = Some(value.clone()),
                "--env" => {
                    let (key, value) = split_env(value)?;
                    env.insert(key, value);
                }
                "--color" => color = Some(value.clone()),
                other => bail!("unknown option {} for --name {}", other, name),
            }
            idx += 1;
        }

        if args.get(idx).map(|s| s.as_str()) != Some("--") {
            bail!("expected -- after --name {}", name);
        }
        idx += 1;
        let mut argv = Vec::new();
        while idx < args.len() && args[idx] != "--name" {
            argv.push(args[idx].clone());
            idx += 1;
        }
        if argv.is_empty() {
            bail!("missing command for --name {}", name);
        }
        specs.push(ServiceSpec {
            cwd,
            env,
            color,
            ..ServiceSpec::new(name, CommandLine::Args(argv))
        });
    }
    Ok(specs)
}

fn split_env(value: &str) -> Result<(String, String)> {
    let (key, value) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid env entry {} (expected KEY=VAL)", value))?;
    if key.is_empty() {
        bail!("invalid env entry {} (empty key)", value);
    }
    Ok((key.to_string(), value.to_string()))
}

fn ensure_unique_names(specs: &[ServiceSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            bail!("duplicate service name: {}", spec.name);
        }
    }
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Effective runtime settings: CLI flags over config values over defaults.
#[derive(Debug, Clone)]
struct RunSettings {
    stagger: Duration,
    status_tick: Duration,
    log_flush: Duration,
    docker_poll: Duration,
    resource_poll: Duration,
    log_ceiling: usize,
    log_keep: usize,
    exit_timeout: Duration,
    quit_grace: Duration,
    silence_warning: Option<Duration>,
    autostart: bool,
    show_resources: bool,
    docker_probe: Option<CommandLine>,
    resources: bool,
    input_enabled: bool,
    requires: Vec<String>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Result<Self> {
        let stagger_ms = if cli.no_stagger {
            0
        } else {
            cli.stagger_ms.or(config.stagger_ms).unwrap_or(800)
        };
        let status_tick_ms = config.status_tick_ms.unwrap_or(100);
        let log_flush_ms = cli.log_flush_ms.or(config.log_flush_ms).unwrap_or(500);
        let docker_poll_ms = config.docker_poll_ms.unwrap_or(5000);
        let resource_poll_ms = config.resource_poll_ms.unwrap_or(2000);
        for (label, value) in [
            ("status_tick_ms", status_tick_ms),
            ("log_flush_ms", log_flush_ms),
            ("docker_poll_ms", docker_poll_ms),
            ("resource_poll_ms", resource_poll_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", label);
            }
        }

        let log_ceiling = config.log_ceiling.unwrap_or(output::DEFAULT_LOG_CEILING);
        let log_keep = config.log_keep.unwrap_or(output::DEFAULT_LOG_KEEP);
        if log_keep > log_ceiling {
            bail!(
                "log_keep ({}) must not exceed log_ceiling ({})",
                log_keep,
                log_ceiling
            );
        }

        let docker_probe = if cli.no_docker {
            None
        } else {
            match config.docker_probe.as_deref().map(str::trim) {
                Some("") => None,
                Some(raw) => {
                    let command = CommandLine::Shell(raw.to_string());
                    command.argv().context("invalid docker_probe")?;
                    Some(command)
                }
                None => Some(DockerProbe::default().command),
            }
        };

        Ok(Self {
            stagger: Duration::from_millis(stagger_ms),
            status_tick: Duration::from_millis(status_tick_ms),
            log_flush: Duration::from_millis(log_flush_ms),
            docker_poll: Duration::from_millis(docker_poll_ms),
            resource_poll: Duration::from_millis(resource_poll_ms),
            log_ceiling,
            log_keep,
            exit_timeout: Duration::from_millis(config.exit_timeout_ms.unwrap_or(5000)),
            quit_grace: Duration::from_millis(config.quit_grace_ms.unwrap_or(3000)),
            silence_warning: config
                .silence_warning_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            autostart: !cli.no_autostart && config.autostart.unwrap_or(true),
            show_resources: cli.show_resources || config.show_resources.unwrap_or(false),
            docker_probe,
            resources: !cli.no_resources,
            input_enabled: !cli.no_input,
            requires: config.requires.clone().unwrap_or_default(),
        })
    }

    fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            stagger: self.stagger,
            supervisor: SupervisorOptions {
                exit_timeout: self.exit_timeout,
                silence_warning: self.silence_warning,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn cli(values: &[&str]) -> Cli {
        let mut argv = vec!["devrack"];
        argv.extend_from_slice(values);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parse_cli_processes_splits_commands() {
        let specs = parse_cli_processes(&args(&[
            "--name", "api", "--", "cargo", "run", "--name", "web", "--cwd", "frontend", "--env",
            "PORT=3000", "--", "pnpm", "dev",
        ]))
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "api");
        assert_eq!(
            specs[0].command,
            CommandLine::Args(vec!["cargo".into(), "run".into()])
        );
        assert_eq!(specs[1].cwd.as_deref(), Some("frontend"));
        assert_eq!(specs[1].env.get("PORT").map(String::as_str), Some("3000"));
    }

    #[test]
    fn parse_cli_processes_rejects_malformed_input() {
        assert!(parse_cli_processes(&args(&["cargo", "run"])).is_err());
        assert!(parse_cli_processes(&args(&["--name", "api", "cargo"])).is_err());
        assert!(parse_cli_processes(&args(&["--name", "api", "--"])).is_err());
        assert!(parse_cli_processes(&args(&["--name", "api", "--env", "NOEQ", "--", "x"])).is_err());
        assert!(parse_cli_processes(&args(&["--name", "api", "--port", "1", "--", "x"])).is_err());
    }

    #[test]
    fn trailing_args_reach_the_service_parser() {
        let cli = cli(&["--no-docker", "--", "--name", "api", "--", "cargo", "run"]);
        assert!(cli.no_docker);
        assert!(cli.command.is_none());
        let specs = parse_cli_processes(&cli.args).unwrap();
        assert_eq!(specs[0].name, "api");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let specs = vec![
            ServiceSpec::new("api", CommandLine::Shell("a".into())),
            ServiceSpec::new("api", CommandLine::Shell("b".into())),
        ];
        assert!(ensure_unique_names(&specs).is_err());
    }

    #[test]
    fn settings_default_when_nothing_is_configured() {
        let settings = RunSettings::from_cli(&cli(&[]), &Config::default()).unwrap();
        assert_eq!(settings.stagger, Duration::from_millis(800));
        assert_eq!(settings.status_tick, Duration::from_millis(100));
        assert_eq!(settings.log_flush, Duration::from_millis(500));
        assert_eq!(settings.log_ceiling, 50_000);
        assert_eq!(settings.log_keep, 20_000);
        assert_eq!(settings.quit_grace, Duration::from_secs(3));
        assert_eq!(settings.silence_warning, None);
        assert!(settings.autostart);
        assert!(!settings.show_resources);
        assert_eq!(
            settings.docker_probe,
            Some(CommandLine::Shell("docker info".into()))
        );
    }

    #[test]
    fn cli_flags_override_config() {
        let config: Config = toml::from_str(
            r#"
stagger_ms = 300
log_flush_ms = 250
autostart = true
docker_probe = "podman info"
silence_warning_secs = 60
"#,
        )
        .unwrap();
        let settings = RunSettings::from_cli(
            &cli(&["--no-stagger", "--log-flush-ms", "100", "--no-autostart", "--show-resources"]),
            &config,
        )
        .unwrap();
        assert!(settings.stagger.is_zero());
        assert_eq!(settings.log_flush, Duration::from_millis(100));
        assert!(!settings.autostart);
        assert!(settings.show_resources);
        assert_eq!(settings.silence_warning, Some(Duration::from_secs(60)));
        assert_eq!(
            settings.docker_probe,
            Some(CommandLine::Shell("podman info".into()))
        );
        let no_docker = RunSettings::from_cli(&cli(&["--no-docker"]), &config).unwrap();
        assert_eq!(no_docker.docker_probe, None);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let keep_too_big: Config = toml::from_str("log_ceiling = 100\nlog_keep = 200\n").unwrap();
        assert!(RunSettings::from_cli(&cli(&[]), &keep_too_big).is_err());
        let zero_tick: Config = toml::from_str("status_tick_ms = 0\n").unwrap();
        assert!(RunSettings::from_cli(&cli(&[]), &zero_tick).is_err());
        let empty_probe: Config = toml::from_str("docker_probe = \"\"\n").unwrap();
        assert_eq!(
            RunSettings::from_cli(&cli(&[]), &empty_probe)
                .unwrap()
                .docker_probe,
            None
        );
    }

    #[test]
    fn tasks_default_their_description_to_the_name() {
        let config: Config = toml::from_str(
            r#"
[[task]]
name = "migrate"
cmd = ["php", "artisan", "migrate"]
"#,
        )
        .unwrap();
        let task = task_from_config(config.tasks[0].clone()).unwrap();
        assert_eq!(task.description, "migrate");
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<std::sync::Mutex<Vec<String>>>);

    impl Recorder {
        fn push(&self, call: String) -> Result<()> {
            self.0.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl Presenter for Recorder {
        fn on_log_available(&mut self, name: &str, text: &str) -> Result<()> {
            self.push(format!("log {} {}", name, text))
        }

        fn on_status_changed(&mut self, name: &str, running: bool) -> Result<()> {
            self.push(format!("status {} {}", name, running))
        }

        fn on_docker_snapshot(&mut self, text: &str, healthy: bool) -> Result<()> {
            self.push(format!("docker {} {}", text, healthy))
        }

        fn on_resource_snapshot(&mut self, snapshot: &crate::events::ResourceSnapshot) -> Result<()> {
            self.push(format!("resources {}", snapshot))
        }

        fn on_message(&mut self, text: &str) -> Result<()> {
            self.push(format!("message {}", text))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shut_down_presents_the_final_stop() {
        let logs = Arc::new(LogAggregator::default());
        let (status, mut status_rx) = status_channel();
        let manager = ServiceManager::new(
            vec![ServiceSpec::new(
                "x",
                CommandLine::Args(vec!["sh".into(), "-c".into(), "sleep 30".into()]),
            )],
            Vec::new(),
            Arc::clone(&logs),
            status,
            ManagerOptions {
                stagger: Duration::ZERO,
                ..ManagerOptions::default()
            },
        )
        .unwrap();
        manager.start_all().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.get("x").and_then(|svc| svc.pid()).is_none() {
            assert!(tokio::time::Instant::now() < deadline, "x never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let recorder = Recorder::default();
        let mut app = App::new(manager.names(), recorder.clone());
        let mut settings = RunSettings::from_cli(&cli(&[]), &Config::default()).unwrap();
        settings.status_tick = Duration::from_millis(10);
        settings.log_flush = Duration::from_millis(20);
        settings.quit_grace = Duration::from_secs(5);

        assert!(shut_down(&manager, &logs, &mut status_rx, &mut app, &settings).await);
        let calls = recorder.0.lock().unwrap().clone();
        assert!(calls.iter().any(|call| call == "status x false"), "{:?}", calls);
        assert!(
            calls
                .iter()
                .any(|call| call.starts_with("log x ") && call.contains("[x] Stopped.")),
            "{:?}",
            calls
        );
        assert!(status_rx.drain().is_empty());
        assert!(logs.flush().is_empty());
    }
}
