//! Service execution and supervision.
//!
//! `ServiceSupervisor` owns one service's lifecycle: it launches the child on a dedicated
//! task, merges and sanitizes its output into the shared `LogAggregator`, and tears the
//! whole process tree down on request. `ServiceManager` is the facade over the fixed set
//! of supervisors: start-all with staggering, reverse-order stop-all, quit, lookup and
//! one-shot tasks.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{StatusEvent, StatusSender};
use crate::output::{strip, LogAggregator};
use crate::process::{resolve_argv, Lifecycle, Platform, ServiceSpec, TaskSpec};

/// Log key used for one-shot task output.
pub const SYSTEM_LOG: &str = "System";

/// Tunables shared by every supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Upper bound on waiting for a child to exit once its output has ended.
    pub exit_timeout: Duration,
    /// Report a running service that stays silent this long.
    pub silence_warning: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            exit_timeout: Duration::from_secs(5),
            silence_warning: None,
        }
    }
}

/// Supervises a single named service.
pub struct ServiceSupervisor {
    spec: ServiceSpec,
    shared: Arc<Shared>,
    // Also serializes start() against stop().
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

struct Shared {
    state: Mutex<Lifecycle>,
    // Pid of the live child; only set while a process is believed alive.
    handle: Mutex<Option<u32>>,
    logs: Arc<LogAggregator>,
    status: StatusSender,
    options: SupervisorOptions,
}

impl Shared {
    fn lifecycle(&self) -> Lifecycle {
        *lock(&self.state)
    }

    fn advance(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let mut state = lock(&self.state);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn set(&self, to: Lifecycle) {
        *lock(&self.state) = to;
    }

    fn log(&self, name: &str, text: &str) {
        self.logs.write(name, &format!("[{}] {}\n", name, text));
    }

    fn announce(&self, name: &str, running: bool) {
        self.status.send(StatusEvent::ServiceStatusChanged {
            name: name.to_string(),
            running,
        });
    }
}

impl ServiceSupervisor {
    pub fn new(
        spec: ServiceSpec,
        logs: Arc<LogAggregator>,
        status: StatusSender,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            spec,
            shared: Arc::new(Shared {
                state: Mutex::new(Lifecycle::Off),
                handle: Mutex::new(None),
                logs,
                status,
                options,
            }),
            cancel: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle().is_running()
    }

    /// Pid of the live child, if any.
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.shared.handle)
    }

    /// Launches the service on its own task.
    ///
    /// Returns `false` without doing anything unless the supervisor is `Off`. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut cancel = lock(&self.cancel);
        if !self.shared.advance(Lifecycle::Off, Lifecycle::Starting) {
            debug!(service = %self.spec.name, "start ignored, already running");
            return false;
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *cancel = Some(cancel_tx);
        let run = Run {
            spec: self.spec.clone(),
            shared: Arc::clone(&self.shared),
        };
        tokio::spawn(run.execute(cancel_rx));
        true
    }

    /// Cancels the capture loop and kills the whole process tree.
    ///
    /// Idempotent and infallible. Returns before the child is confirmed gone; the
    /// supervisor reports `Off` once its task has finished tearing down.
    pub fn stop(&self) {
        let mut cancel = lock(&self.cancel);
        if let Some(cancel) = cancel.take() {
            let _ = cancel.send(true);
        }
        if !self.shared.advance(Lifecycle::Running, Lifecycle::Stopping) {
            self.shared.advance(Lifecycle::Starting, Lifecycle::Stopping);
        }
        let pid = lock(&self.shared.handle).take();
        if let Some(pid) = pid {
            self.shared.log(&self.spec.name, "Stopping...");
            terminate(&self.spec.name, pid);
        }
    }
}

// State moved onto the service task.
struct Run {
    spec: ServiceSpec,
    shared: Arc<Shared>,
}

impl Run {
    async fn execute(self, mut cancel: watch::Receiver<bool>) {
        let name = self.spec.name.as_str();
        self.shared.advance(Lifecycle::Starting, Lifecycle::Running);
        self.shared.announce(name, true);
        self.shared
            .log(name, &format!("Starting: {}", self.spec.command));
        info!(service = %name, command = %self.spec.command, "starting service");

        if let Err(err) = self.supervise(&mut cancel).await {
            let message = format!("{:#}", err);
            warn!(service = %name, error = %message, "service failed");
            self.shared.log(name, &format!("Error: {}", strip(&message)));
        }

        // Off comes last so a new run cannot interleave with this run's final notices.
        lock(&self.shared.handle).take();
        self.shared.announce(name, false);
        self.shared.log(name, "Stopped.");
        self.shared.set(Lifecycle::Off);
        info!(service = %name, "service stopped");
    }

    async fn supervise(&self, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        let name = self.spec.name.as_str();
        let argv = resolve_argv(self.spec.command.argv()?, Platform::current());
        let mut child = build_command(&argv, self.spec.cwd.as_deref(), &self.spec.env)?
            .spawn()
            .with_context(|| format!("failed to spawn {}", argv[0]))?;
        let pid = child.id();
        *lock(&self.shared.handle) = pid;
        debug!(service = %name, pid = ?pid, "spawned");

        let mut lines = merge_output(&mut child, self.shared.logs.ceiling());
        let cancelled = self.pump(&mut lines, cancel).await;
        if cancelled {
            // stop() raced the spawn and found no handle to kill.
            let pid = lock(&self.shared.handle).take();
            if let Some(pid) = pid {
                terminate(name, pid);
            }
        }

        let status = self.reap(&mut child).await?;
        if let Some(status) = status {
            if !cancelled && !status.success() {
                self.shared.log(name, &format!("Exited ({})", status));
            }
        }
        Ok(())
    }

    // Forwards merged output until the stream ends (false) or cancellation (true).
    async fn pump(
        &self,
        lines: &mut mpsc::UnboundedReceiver<String>,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        let name = self.spec.name.as_str();
        let silence = self.shared.options.silence_warning;
        let mut quiet_since = Instant::now();
        let mut warned = false;
        loop {
            if *cancel.borrow_and_update() {
                return true;
            }
            tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => {
                        quiet_since = Instant::now();
                        warned = false;
                        let clean = strip(&line);
                        if !clean.trim().is_empty() {
                            self.shared.logs.write(name, &format!("{}\n", clean));
                        }
                    }
                    None => return false,
                },
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(quiet_since + silence.unwrap_or_default()),
                    if silence.is_some() && !warned =>
                {
                    warned = true;
                    let secs = silence.unwrap_or_default().as_secs_f32();
                    debug!(service = %name, "no output for {:.1}s", secs);
                    self.shared.status.send(StatusEvent::message(format!(
                        "{} has been silent for {:.0}s",
                        name, secs
                    )));
                }
            }
        }
    }

    // Bounded wait for exit; force-kills a child that outlives its output.
    async fn reap(&self, child: &mut Child) -> Result<Option<ExitStatus>> {
        let name = self.spec.name.as_str();
        match tokio::time::timeout(self.shared.options.exit_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(service = %name, %status, "child exited");
                Ok(Some(status))
            }
            Ok(Err(err)) => Err(err).context("failed to wait for exit"),
            Err(_) => {
                warn!(service = %name, "child did not exit in time, killing");
                if let Some(pid) = child.id() {
                    terminate(name, pid);
                }
                if let Err(err) = child.kill().await {
                    debug!(service = %name, error = %err, "kill after timeout failed");
                }
                Ok(None)
            }
        }
    }
}

fn build_command(
    argv: &[String],
    cwd: Option<&str>,
    env: &HashMap<String, String>,
) -> Result<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    if !env.is_empty() {
        command.envs(env);
    }

    // A fresh process group lets the whole tree be signalled through the child's pid.
    #[cfg(unix)]
    {
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        command.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
    }

    Ok(command)
}

// Merges stdout and stderr into one line stream; closes once both reach EOF.
fn merge_output(child: &mut Child, max_line: usize) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone(), max_line));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx, max_line));
    }
    rx
}

/// Splits a byte stream into lines ended by `\n`, `\r` or `\r\n`.
///
/// Progress bars that redraw with a bare `\r` are forwarded as they happen. A line that
/// reaches `max_line` bytes without a terminator is forwarded in pieces, so the pending
/// buffer never outgrows the log store's own bound.
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>, max_line: usize)
where
    R: AsyncRead + Unpin,
{
    let max_line = max_line.max(4);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut after_cr = false;
    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            // A broken pipe ends the stream like EOF does.
            Err(err) => {
                debug!(error = %err, "output stream failed");
                break;
            }
        };
        let consumed = chunk.len();
        for &byte in chunk {
            let piece = match byte {
                b'\n' if after_cr => None,
                b'\n' | b'\r' => Some(take_line(&mut line, true)),
                _ => {
                    line.push(byte);
                    (line.len() >= max_line).then(|| take_line(&mut line, false))
                }
            };
            after_cr = byte == b'\r';
            if let Some(piece) = piece {
                if tx.send(piece).is_err() {
                    return;
                }
            }
        }
        reader.consume(consumed);
    }
    if !line.is_empty() {
        let _ = tx.send(take_line(&mut line, true));
    }
}

// Drains `line` as text. Unless `whole`, a multi-byte character cut by the length cap
// stays behind for the next piece.
fn take_line(line: &mut Vec<u8>, whole: bool) -> String {
    let cut = match std::str::from_utf8(line) {
        Err(err) if !whole && err.error_len().is_none() && err.valid_up_to() > 0 => {
            err.valid_up_to()
        }
        _ => line.len(),
    };
    let rest = line.split_off(cut);
    let text = String::from_utf8_lossy(line).into_owned();
    *line = rest;
    text
}

// The kill runs off the calling task: `taskkill` is a full process round-trip and
// `stop()` is called from the consumer loop.
fn terminate(name: &str, pid: u32) {
    let name = name.to_string();
    offload(move || match kill_tree(pid) {
        Ok(()) => debug!(service = %name, pid, "killed process tree"),
        Err(err) => debug!(service = %name, pid, error = %err, "kill failed, process likely gone"),
    });
}

// Runs `work` on the blocking pool when inside a runtime, inline otherwise.
fn offload(work: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(work);
        }
        Err(_) => work(),
    }
}

/// Forcefully kills `pid` and every descendant sharing its process group.
#[cfg(unix)]
pub fn kill_tree(pid: u32) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    if unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let group_err = io::Error::last_os_error();
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    Err(group_err)
}

/// Forcefully kills `pid` and its whole descendant tree.
#[cfg(windows)]
pub fn kill_tree(pid: u32) -> io::Result<()> {
    use std::os::windows::process::CommandExt;
    use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;

    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ))
    }
}

#[cfg(not(any(unix, windows)))]
pub fn kill_tree(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process tree kill is not supported on this platform",
    ))
}

/// Runs a one-shot task to completion, writing its output under [`SYSTEM_LOG`].
///
/// Returns whether the task succeeded. Failures are reported through the log store and
/// the status queue, never as an error.
pub async fn run_oneshot(task: &TaskSpec, logs: &LogAggregator, status: &StatusSender) -> bool {
    let label = task.description.as_str();
    logs.write(SYSTEM_LOG, &format!("Executing: {}...\n", label));
    info!(task = %task.name, "running task");
    match execute_task(task, logs).await {
        Ok(exit) if exit.success() => {
            logs.write(SYSTEM_LOG, &format!("{}: SUCCESS\n", label));
            status.send(StatusEvent::message(format!(
                "{} completed successfully.",
                label
            )));
            true
        }
        Ok(exit) => {
            logs.write(SYSTEM_LOG, &format!("ERROR ({}): {}\n", label, exit));
            status.send(StatusEvent::message(format!("{} failed. Check logs.", label)));
            false
        }
        Err(err) => {
            let message = format!("{:#}", err);
            warn!(task = %task.name, error = %message, "task failed");
            logs.write(SYSTEM_LOG, &format!("ERROR ({}): {}\n", label, strip(&message)));
            status.send(StatusEvent::message(format!("{} failed. Check logs.", label)));
            false
        }
    }
}

async fn execute_task(task: &TaskSpec, logs: &LogAggregator) -> Result<ExitStatus> {
    let argv = resolve_argv(task.command.argv()?, Platform::current());
    let mut child = build_command(&argv, None, &HashMap::new())?
        .spawn()
        .with_context(|| format!("failed to spawn {}", argv[0]))?;
    let mut lines = merge_output(&mut child, logs.ceiling());
    logs.write(SYSTEM_LOG, &format!("--- Output ({}) ---\n", task.description));
    while let Some(line) = lines.recv().await {
        let clean = strip(&line);
        if !clean.trim().is_empty() {
            logs.write(SYSTEM_LOG, &format!("{}\n", clean));
        }
    }
    logs.write(SYSTEM_LOG, "----------------------\n");
    child.wait().await.context("failed to wait for task")
}

/// Settings for the supervision facade.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Delay between launches in `start_all`; zero disables staggering.
    pub stagger: Duration,
    pub supervisor: SupervisorOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(800),
            supervisor: SupervisorOptions::default(),
        }
    }
}

/// Coordinates the fixed set of service supervisors.
pub struct ServiceManager {
    supervisors: Vec<ServiceSupervisor>,
    index: HashMap<String, usize>,
    tasks: Vec<TaskSpec>,
    logs: Arc<LogAggregator>,
    status: StatusSender,
    options: ManagerOptions,
    shutdown: watch::Sender<bool>,
}

impl ServiceManager {
    /// Creates one supervisor per spec, in registration order. Names must be unique.
    pub fn new(
        specs: Vec<ServiceSpec>,
        tasks: Vec<TaskSpec>,
        logs: Arc<LogAggregator>,
        status: StatusSender,
        options: ManagerOptions,
    ) -> Result<Self> {
        let mut index = HashMap::new();
        let mut supervisors = Vec::with_capacity(specs.len());
        for spec in specs {
            if index.insert(spec.name.clone(), supervisors.len()).is_some() {
                bail!("duplicate service name: {}", spec.name);
            }
            supervisors.push(ServiceSupervisor::new(
                spec,
                Arc::clone(&logs),
                status.clone(),
                options.supervisor,
            ));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            supervisors,
            index,
            tasks,
            logs,
            status,
            options,
            shutdown,
        })
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceSupervisor> {
        self.supervisors.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.supervisors
            .iter()
            .map(|supervisor| supervisor.name().to_string())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSupervisor> {
        self.index.get(name).map(|&idx| &self.supervisors[idx])
    }

    fn require(&self, name: &str) -> Result<&ServiceSupervisor> {
        self.get(name)
            .ok_or_else(|| anyhow!("unknown service: {}", name))
    }

    pub fn start(&self, name: &str) -> Result<bool> {
        Ok(self.require(name)?.start())
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        self.require(name)?.stop();
        Ok(())
    }

    /// Stops the service, waits for it to report `Off`, then starts it again.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let supervisor = self.require(name)?;
        supervisor.stop();
        let grace = self.options.supervisor.exit_timeout + Duration::from_secs(1);
        if !wait_until(grace, || !supervisor.is_running()).await {
            bail!("{} did not stop within {:?}", name, grace);
        }
        supervisor.start();
        Ok(())
    }

    /// Starts every service in registration order, pausing `stagger` between launches.
    ///
    /// Staggering only spreads boot load; it is not a readiness or ordering guarantee.
    pub async fn start_all(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut launched = false;
        for supervisor in &self.supervisors {
            if *shutdown.borrow_and_update() {
                break;
            }
            if supervisor.is_running() {
                continue;
            }
            if launched && !self.options.stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.stagger) => {}
                    _ = shutdown.changed() => break,
                }
            }
            launched |= supervisor.start();
        }
    }

    /// Requests a stop of every service, last registered first. Does not wait.
    pub fn stop_all(&self) {
        for supervisor in self.supervisors.iter().rev() {
            supervisor.stop();
        }
    }

    /// Announces shutdown to every loop, then stops all services.
    pub fn quit(&self) {
        self.shutdown.send_replace(true);
        info!("shutdown requested");
        self.stop_all();
    }

    /// Receiver that flips to `true` once [`quit`](Self::quit) is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn all_stopped(&self) -> bool {
        self.supervisors.iter().all(|supervisor| !supervisor.is_running())
    }

    /// Waits up to `timeout` for every service to report `Off`.
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.all_stopped()).await
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Runs the named one-shot task; errors only when the task is unknown.
    pub async fn run_task(&self, name: &str) -> Result<bool> {
        let task = self
            .tasks
            .iter()
            .find(|task| task.name == name)
            .ok_or_else(|| anyhow!("unknown task: {}", name))?;
        Ok(run_oneshot(task, &self.logs, &self.status).await)
    }
}

async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
