use crate::events::{Dispatcher, Event};
use crate::identity::ProcessInspector;
use crate::launch::LaunchSpec;
use crate::probe::{self, DEFAULT_PORT};
use crate::sys;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const START_GRACE: Duration = Duration::from_secs(2);
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Starting => write!(f, "starting"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// What reconciliation concluded from the handle and the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Running,
    Idle,
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),
    #[error("failed to spawn server: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("server exited during startup ({0})")]
    ExitedEarly(String),
    #[error("startup interrupted by a stop request")]
    Interrupted,
    #[error("a stop is in progress")]
    StopInProgress,
}

#[derive(Debug, thiserror::Error)]
#[error("pid {pid} survived graceful and forced termination: {cause}")]
pub struct TerminationError {
    pub pid: u32,
    pub cause: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error(transparent)]
    Termination(#[from] TerminationError),
    #[error("port {port} is held by processes that are not the server: {pids:?}")]
    ForeignListener { port: u16, pids: Vec<u32> },
    #[error("server still reachable on port {0}")]
    StillRunning(u16),
    #[error("a stop is already in progress")]
    AlreadyStopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: u32 },
    /// The port was already served; nothing was spawned.
    AlreadyRunning { pids: Vec<u32> },
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Started { pid } => write!(f, "started (pid {pid})"),
            StartOutcome::AlreadyRunning { pids } if pids.is_empty() => {
                write!(f, "already running")
            }
            StartOutcome::AlreadyRunning { pids } => write!(f, "already running (pids {pids:?})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped { pids: Vec<u32> },
    NotRunning,
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::Stopped { pids } => write!(f, "stopped (pids {pids:?})"),
            StopOutcome::NotRunning => write!(f, "not running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToggleOutcome {
    Start(StartOutcome),
    Stop(StopOutcome),
}

impl std::fmt::Display for ToggleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToggleOutcome::Start(o) => o.fmt(f),
            ToggleOutcome::Stop(o) => o.fmt(f),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToggleError {
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Stop(#[from] StopError),
}

// ---------------------------------------------------------------------------
// ManagedProcess
// ---------------------------------------------------------------------------

/// The server instance as the supervisor knows it. Lives for the whole
/// session; only its fields change.
pub struct ManagedProcess {
    pub handle: Option<Child>,
    pub pid: Option<u32>,
    pub launch: Option<LaunchSpec>,
    pub state: RunState,
    pub started_at: Option<tokio::time::Instant>,
}

impl ManagedProcess {
    fn idle() -> Self {
        Self {
            handle: None,
            pid: None,
            launch: None,
            state: RunState::Idle,
            started_at: None,
        }
    }

    fn release(&mut self) {
        self.handle = None;
        self.pid = None;
        self.started_at = None;
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            state: self.state,
            pid: self.pid,
            owned: self.handle.is_some(),
            uptime: self.started_at.map(|t| t.elapsed().as_secs()),
            command: self.launch.as_ref().map(|l| l.to_string()),
        }
    }
}

/// Read-only copy handed to presentation code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSnapshot {
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub owned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub port: u16,
    pub start_grace: Duration,
    pub graceful_timeout: Duration,
    pub forced_timeout: Duration,
    pub reachability_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            start_grace: START_GRACE,
            graceful_timeout: GRACEFUL_STOP_TIMEOUT,
            forced_timeout: FORCED_STOP_TIMEOUT,
            reachability_timeout: probe::REACHABILITY_TIMEOUT,
        }
    }
}

/// Clears the in-flight stop flag however `stop` returns.
struct StopGuard<'a>(&'a AtomicBool);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Supervisor {
    process: Arc<RwLock<ManagedProcess>>,
    stopping: Arc<AtomicBool>,
    options: SupervisorOptions,
    inspector: Arc<dyn ProcessInspector>,
    dispatcher: Dispatcher,
}

impl Supervisor {
    pub fn new(
        options: SupervisorOptions,
        inspector: Arc<dyn ProcessInspector>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            process: Arc::new(RwLock::new(ManagedProcess::idle())),
            stopping: Arc::new(AtomicBool::new(false)),
            options,
            inspector,
            dispatcher,
        }
    }

    pub fn port(&self) -> u16 {
        self.options.port
    }

    pub async fn snapshot(&self) -> ProcessSnapshot {
        self.process.read().await.snapshot()
    }

    fn set_state(&self, managed: &mut ManagedProcess, state: RunState) {
        if managed.state != state {
            debug!(from = %managed.state, to = %state, "run state");
            managed.state = state;
            self.dispatcher.emit(Event::RunState {
                state,
                pid: managed.pid,
            });
        }
    }

    async fn port_reachable(&self) -> bool {
        probe::is_reachable_within(self.options.port, self.options.reachability_timeout).await
    }

    async fn target_pids(&self) -> (Vec<u32>, Vec<u32>) {
        let inspector = Arc::clone(&self.inspector);
        let port = self.options.port;
        tokio::task::spawn_blocking(move || {
            let candidates: Vec<u32> = inspector.candidate_pids(port).into_iter().collect();
            let targets = candidates
                .iter()
                .copied()
                .filter(|&pid| inspector.is_target(pid))
                .collect();
            (candidates, targets)
        })
        .await
        .unwrap_or_default()
    }

    // -- Reconcile --

    /// Compare the tracked handle and the port against the recorded state.
    /// Clears a handle whose process has exited; never installs one.
    pub async fn reconcile(&self) -> ObservedState {
        let tracked_alive = {
            let mut managed = self.process.write().await;
            if matches!(managed.state, RunState::Starting | RunState::Stopping)
                || self.stopping.load(Ordering::SeqCst)
            {
                let busy = managed.state;
                drop(managed);
                debug!(state = %busy, "reconcile skipped: transition in flight");
                return if self.port_reachable().await {
                    ObservedState::Running
                } else {
                    ObservedState::Idle
                };
            }
            match managed.handle.as_mut().map(|child| child.try_wait()) {
                Some(Ok(None)) => true,
                Some(Ok(Some(status))) => {
                    info!(pid = ?managed.pid, %status, "server exited");
                    managed.release();
                    false
                }
                Some(Err(e)) => {
                    warn!(error = %e, "lost track of server process");
                    managed.release();
                    false
                }
                None => false,
            }
        };

        let observed = if tracked_alive || self.port_reachable().await {
            ObservedState::Running
        } else {
            ObservedState::Idle
        };

        let mut managed = self.process.write().await;
        if !self.stopping.load(Ordering::SeqCst)
            && !matches!(managed.state, RunState::Starting | RunState::Stopping)
        {
            let state = match observed {
                ObservedState::Running => RunState::Running,
                ObservedState::Idle => RunState::Idle,
            };
            self.set_state(&mut managed, state);
        }
        observed
    }

    // -- Start --

    pub async fn start(&self, spec: LaunchSpec) -> Result<StartOutcome, StartError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(StartError::StopInProgress);
        }

        if self.reconcile().await == ObservedState::Running {
            let tracked = self.process.read().await.pid;
            let pids = match tracked {
                Some(pid) => vec![pid],
                None => self.target_pids().await.1,
            };
            info!(?pids, port = self.options.port, "server already running");
            return Ok(StartOutcome::AlreadyRunning { pids });
        }

        let pid = {
            let mut managed = self.process.write().await;
            // Another caller may have spawned since the reconcile above.
            if managed.handle.is_some() || managed.state != RunState::Idle {
                return Ok(StartOutcome::AlreadyRunning {
                    pids: managed.pid.into_iter().collect(),
                });
            }
            self.set_state(&mut managed, RunState::Starting);

            info!(command = %spec, cwd = %spec.cwd.display(), "starting server");
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .envs(&spec.env)
                .current_dir(&spec.cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            sys::configure_target_cmd(&mut cmd);

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!(error = %e, program = %spec.program.display(), "spawn failed");
                    self.set_state(&mut managed, RunState::Failed);
                    self.set_state(&mut managed, RunState::Idle);
                    return Err(if e.kind() == std::io::ErrorKind::NotFound {
                        StartError::ExecutableMissing(spec.program.clone())
                    } else {
                        StartError::Spawn(e)
                    });
                }
            };
            let pid = child.id();
            managed.handle = Some(child);
            managed.pid = pid;
            managed.launch = Some(spec);
            managed.started_at = Some(tokio::time::Instant::now());
            pid
        };

        // Sample liveness through the handle; the port may not be bound yet.
        tokio::time::sleep(self.options.start_grace).await;

        let mut managed = self.process.write().await;
        if managed.state != RunState::Starting {
            return Err(StartError::Interrupted);
        }
        let exit = match managed.handle.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => None,
            Some(Ok(Some(status))) => Some(status.to_string()),
            Some(Err(e)) => Some(e.to_string()),
            None => Some("handle lost".to_string()),
        };
        match exit {
            None => {
                self.set_state(&mut managed, RunState::Running);
                let pid = pid.unwrap_or_default();
                info!(pid, "server running");
                Ok(StartOutcome::Started { pid })
            }
            Some(cause) => {
                warn!(%cause, "server exited during grace period");
                managed.release();
                self.set_state(&mut managed, RunState::Failed);
                self.set_state(&mut managed, RunState::Idle);
                Err(StartError::ExitedEarly(cause))
            }
        }
    }

    // -- Stop --

    pub async fn stop(&self) -> Result<StopOutcome, StopError> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Err(StopError::AlreadyStopping);
        }
        let _guard = StopGuard(&self.stopping);

        let (child, pid) = {
            let mut managed = self.process.write().await;
            let child = managed.handle.take();
            let pid = managed.pid;
            self.set_state(&mut managed, RunState::Stopping);
            (child, pid)
        };

        let result = match (child, pid) {
            (Some(child), Some(pid)) => self.stop_tracked(child, pid).await,
            (Some(mut child), None) => {
                // A handle without a pid has already been reaped.
                let _ = child.wait().await;
                Ok(StopOutcome::Stopped { pids: Vec::new() })
            }
            (None, _) => self.stop_untracked().await,
        };

        // Never contradict a live port check.
        let reachable = self.port_reachable().await;
        let mut managed = self.process.write().await;
        let final_state = if reachable || managed.handle.is_some() {
            RunState::Running
        } else {
            managed.release();
            RunState::Idle
        };
        self.set_state(&mut managed, final_state);

        match result {
            Ok(_) if reachable => {
                warn!(port = self.options.port, "port still reachable after stop");
                Err(StopError::StillRunning(self.options.port))
            }
            other => other,
        }
    }

    async fn stop_tracked(&self, mut child: Child, pid: u32) -> Result<StopOutcome, StopError> {
        info!(pid, "stopping server");
        if let Err(e) = sys::terminate_tree(pid) {
            debug!(pid, error = %e, "graceful signal failed");
        }
        if wait_child(&mut child, self.options.graceful_timeout).await {
            info!(pid, "server stopped gracefully");
            return Ok(StopOutcome::Stopped { pids: vec![pid] });
        }

        let mut cause = String::from("did not exit after graceful termination");
        for attempt in 1..=2 {
            warn!(pid, attempt, "forcing server termination");
            if let Err(e) = sys::force_kill_tree(pid) {
                cause = e.to_string();
            }
            let _ = child.start_kill();
            if wait_child(&mut child, self.options.forced_timeout).await {
                return Ok(StopOutcome::Stopped { pids: vec![pid] });
            }
        }

        error!(pid, %cause, "server survived forced termination");
        let mut managed = self.process.write().await;
        managed.handle = Some(child);
        Err(TerminationError { pid, cause }.into())
    }

    async fn stop_untracked(&self) -> Result<StopOutcome, StopError> {
        let (candidates, targets) = self.target_pids().await;
        debug!(?candidates, ?targets, port = self.options.port, "untracked stop");
        if targets.is_empty() {
            if !candidates.is_empty() {
                return Err(StopError::ForeignListener {
                    port: self.options.port,
                    pids: candidates,
                });
            }
            return Ok(StopOutcome::NotRunning);
        }

        for &pid in &targets {
            self.terminate_pid(pid).await?;
        }
        info!(pids = ?targets, "stopped external server");
        Ok(StopOutcome::Stopped { pids: targets })
    }

    async fn terminate_pid(&self, pid: u32) -> Result<(), TerminationError> {
        info!(pid, "terminating external server");
        let _ = sys::terminate_tree(pid);
        if wait_pid(pid, self.options.graceful_timeout).await {
            return Ok(());
        }
        let mut cause = String::from("did not exit after graceful termination");
        for attempt in 1..=2 {
            warn!(pid, attempt, "forcing external server termination");
            if let Err(e) = sys::force_kill_tree(pid) {
                cause = e.to_string();
            }
            if wait_pid(pid, self.options.forced_timeout).await {
                return Ok(());
            }
        }
        Err(TerminationError { pid, cause })
    }

    // -- Toggle --

    /// Stop when running (by handle or port), otherwise start with the launch
    /// command produced by `spec`.
    pub async fn toggle<F>(&self, spec: F) -> Result<ToggleOutcome, ToggleError>
    where
        F: FnOnce() -> Result<LaunchSpec, StartError>,
    {
        let owned_alive = {
            let managed = self.process.read().await;
            managed.handle.is_some() && managed.state == RunState::Running
        };
        if owned_alive || self.reconcile().await == ObservedState::Running {
            return Ok(ToggleOutcome::Stop(self.stop().await?));
        }
        let spec = spec()?;
        Ok(ToggleOutcome::Start(self.start(spec).await?))
    }
}

async fn wait_child(child: &mut Child, timeout: Duration) -> bool {
    matches!(tokio::time::timeout(timeout, child.wait()).await, Ok(Ok(_)))
}

async fn wait_pid(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while sys::is_pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
