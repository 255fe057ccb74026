//! Lifecycle of the single supervised client process.
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!                         ↓
//!                       Exited → Stopped
//! ```
//!
//! Output lines and the exit code are delivered as [`SupervisorEvent`]s on the
//! channel returned by [`ProcessSupervisor::new`]. Mutating calls serialize on
//! one async mutex, so concurrent `start`/`stop`/`restart` never race on the
//! handle.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, Signal, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// How long to wait for the process to disappear after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// One line of the client's stdout.
    Output(String),
    /// One line of the client's stderr, or a supervisor-side failure.
    Error(String),
    /// The client exited; `-1` when it was terminated by a signal.
    Exited(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Newt executable not found at {0}")]
    MissingExecutable(PathBuf),
    #[error("Failed to start newt: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug)]
struct Status {
    state: ProcessState,
    pid: Option<u32>,
    /// Bumped on every spawn so a stale exit watcher cannot clobber a newer process.
    generation: u64,
}

#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    generation: u64,
    exit: watch::Receiver<Option<i32>>,
    kill: mpsc::UnboundedSender<()>,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    executable: PathBuf,
    working_dir: PathBuf,
    handle: tokio::sync::Mutex<Option<ProcessHandle>>,
    status: Arc<Mutex<Status>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            handle: tokio::sync::Mutex::new(None),
            status: Arc::new(Mutex::new(Status {
                state: ProcessState::Stopped,
                pid: None,
                generation: 0,
            })),
            events,
        };
        (supervisor, receiver)
    }

    pub fn state(&self) -> ProcessState {
        self.status
            .lock()
            .map(|s| s.state)
            .unwrap_or(ProcessState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.status
            .lock()
            .ok()
            .filter(|s| s.state == ProcessState::Running)
            .and_then(|s| s.pid)
    }

    /// Starts the client unless it is already running.
    ///
    /// Returns `false` (after emitting an [`SupervisorEvent::Error`]) when the
    /// executable is missing or the OS refuses to spawn it.
    pub async fn start(&self, args: &[String]) -> bool {
        let mut guard = self.handle.lock().await;

        if self.is_running() {
            return true;
        }
        // An exited process leaves its handle behind until someone clears it
        guard.take();

        match self.spawn(args) {
            Ok(handle) => {
                tracing::info!(pid = handle.pid, "Started {}", self.executable.display());
                *guard = Some(handle);
                true
            }
            Err(e) => {
                self.set_state(ProcessState::Stopped, None);
                tracing::error!("{}", e);
                self.emit(SupervisorEvent::Error(e.to_string()));
                false
            }
        }
    }

    /// Asks the client to exit, escalating to a forced kill of it and its
    /// descendants once `timeout` passes. The handle is cleared either way.
    pub async fn stop(&self, timeout: Duration) {
        let mut guard = self.handle.lock().await;
        let Some(mut handle) = guard.take() else {
            return;
        };

        if handle.exit.borrow().is_some() {
            self.finish_stop(handle.generation);
            return;
        }

        self.update_state(handle.generation, ProcessState::Stopping);
        tracing::info!(pid = handle.pid, "Stopping newt process");

        if !request_terminate(handle.pid) {
            // No graceful path on this platform (or the signal failed)
            let _ = handle.kill.send(());
        }

        if !wait_for_exit(&mut handle.exit, timeout).await {
            tracing::warn!(
                pid = handle.pid,
                "Process did not exit within {:?}, killing it",
                timeout
            );
            let descendants = descendants_of(handle.pid);
            let _ = handle.kill.send(());
            kill_all(&descendants);

            if !wait_for_exit(&mut handle.exit, KILL_WAIT).await {
                let message = format!(
                    "Error stopping process: pid {} still alive after kill",
                    handle.pid
                );
                tracing::error!("{}", message);
                self.emit(SupervisorEvent::Error(message));
            }
        }

        self.finish_stop(handle.generation);
    }

    /// Stop followed by start; observers may briefly see no running client.
    pub async fn restart(&self, args: &[String], timeout: Duration) -> bool {
        self.stop(timeout).await;
        self.start(args).await
    }

    fn spawn(&self, args: &[String]) -> Result<ProcessHandle, SupervisorError> {
        if !self.executable.is_file() {
            return Err(SupervisorError::MissingExecutable(self.executable.clone()));
        }

        let generation = {
            let mut status = self.lock_status();
            status.generation += 1;
            status.state = ProcessState::Starting;
            status.pid = None;
            status.generation
        };

        let mut cmd = Command::new(&self.executable);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, self.events.clone(), SupervisorEvent::Output));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, self.events.clone(), SupervisorEvent::Error));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        // Running must be visible before the watcher can possibly flip it to Exited
        self.update_state(generation, ProcessState::Running);
        if let Ok(mut status) = self.status.lock() {
            if status.generation == generation {
                status.pid = Some(pid);
            }
        }

        tokio::spawn(watch_exit(
            child,
            kill_rx,
            exit_tx,
            Arc::clone(&self.status),
            generation,
            self.events.clone(),
        ));

        Ok(ProcessHandle {
            pid,
            generation,
            exit: exit_rx,
            kill: kill_tx,
        })
    }

    fn finish_stop(&self, generation: u64) {
        if let Ok(mut status) = self.status.lock() {
            if status.generation == generation {
                status.state = ProcessState::Stopped;
                status.pid = None;
            }
        }
    }

    fn update_state(&self, generation: u64, state: ProcessState) {
        if let Ok(mut status) = self.status.lock() {
            if status.generation == generation {
                status.state = state;
            }
        }
    }

    fn set_state(&self, state: ProcessState, pid: Option<u32>) {
        let mut status = self.lock_status();
        status.state = state;
        status.pid = pid;
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }
}

async fn forward_lines<R>(
    reader: R,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    wrap: fn(String) -> SupervisorEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                // Keep draining even with no listener so the child never blocks on a full pipe
                let _ = events.send(wrap(line.to_string()));
            }
            Err(e) => {
                tracing::debug!("Output reader stopped: {}", e);
                break;
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<i32>>,
    status: Arc<Mutex<Status>>,
    generation: u64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let mut kill_open = true;
    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            request = kill_rx.recv(), if kill_open => match request {
                Some(()) => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill newt process: {}", e);
                    }
                }
                None => kill_open = false,
            },
        }
    };

    let code = match result {
        Ok(exit) => exit.code().unwrap_or(-1),
        Err(e) => {
            tracing::warn!("Failed to wait for newt process: {}", e);
            -1
        }
    };

    if let Ok(mut status) = status.lock() {
        if status.generation == generation && status.state != ProcessState::Stopping {
            status.state = ProcessState::Exited;
            status.pid = None;
        }
    }

    let _ = exit_tx.send(Some(code));
    let _ = events.send(SupervisorEvent::Exited(code));
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<i32>>, timeout: Duration) -> bool {
    let waited = tokio::time::timeout(timeout, exit.wait_for(|code| code.is_some())).await;
    // A closed channel means the watcher is gone, which only happens after exit
    !matches!(waited, Err(_))
}

/// Sends a polite termination request. `false` when the platform has no such signal.
fn request_terminate(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

/// Every process below `pid` in the process tree, collected before the parent dies.
fn descendants_of(pid: u32) -> Vec<Pid> {
    let mut system = System::new();
    system.refresh_processes();

    let root = Pid::from_u32(pid);
    let mut found: Vec<Pid> = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (child_pid, process) in system.processes() {
            if process.parent() == Some(parent) && *child_pid != root && !found.contains(child_pid)
            {
                found.push(*child_pid);
                frontier.push(*child_pid);
            }
        }
    }
    found
}

fn kill_all(pids: &[Pid]) {
    if pids.is_empty() {
        return;
    }
    let mut system = System::new();
    for pid in pids {
        if system.refresh_process(*pid) {
            if let Some(process) = system.process(*pid) {
                tracing::debug!("Killing descendant process {}", pid);
                process.kill();
            }
        }
    }
}

/// Renders an argument the way a shell-style command line would need it.
pub fn escape_argument(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if !arg.chars().any(|c| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

pub fn format_command_line(args: &[String]) -> String {
    args.iter()
        .map(|a| escape_argument(a))
        .collect::<Vec<_>>()
        .join(" ")
}
