//! Locating and invoking the git executable.

use crate::events::{Dispatcher, Event};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const SYSTEM_GIT: &str = "git";
pub const MANAGER_CONFIG: [&str; 4] = ["user", "default", "ComfyUI-Manager", "config.ini"];

#[cfg(windows)]
const PORTABLE_GIT: [&str; 4] = ["tools", "PortableGit", "bin", "git.exe"];
#[cfg(not(windows))]
const PORTABLE_GIT: [&str; 4] = ["tools", "PortableGit", "bin", "git"];

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Configured,
    Bundled,
    System,
    Unavailable,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Configured => write!(f, "configured"),
            Provenance::Bundled => write!(f, "bundled"),
            Provenance::System => write!(f, "system"),
            Provenance::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Resolved git executable. A `System` binding holds the bare program name
/// and relies on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub provenance: Provenance,
}

impl ExecutableBinding {
    pub fn unavailable() -> Self {
        Self {
            path: None,
            provenance: Provenance::Unavailable,
        }
    }

    pub fn program(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A real file path rather than a name looked up on `PATH`.
    pub fn is_concrete(&self) -> bool {
        matches!(
            self.provenance,
            Provenance::Configured | Provenance::Bundled
        )
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git executable unavailable")]
    Unavailable,
    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args} timed out after {secs}s")]
    Timeout { args: String, secs: u64 },
    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// stderr if present, otherwise stdout; git splits diagnostics between both.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Run `program args...` with no terminal prompts and no console window.
/// The child is killed if the timeout elapses.
pub async fn run_program(
    program: &Path,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<GitOutput, GitError> {
    let joined = args.join(" ");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    crate::sys::hide_console(&mut cmd);

    debug!(program = %program.display(), args = %joined, "running git");
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(GitError::Spawn {
                args: joined,
                source,
            });
        }
        Err(_) => {
            warn!(args = %joined, secs = timeout.as_secs(), "git timed out");
            return Err(GitError::Timeout {
                args: joined,
                secs: timeout.as_secs(),
            });
        }
    };

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// A git binding pinned to one working tree.
#[derive(Debug, Clone)]
pub struct Git {
    program: PathBuf,
    root: PathBuf,
}

impl Git {
    pub fn new(binding: &ExecutableBinding, root: impl Into<PathBuf>) -> Result<Self, GitError> {
        let program = binding.program().ok_or(GitError::Unavailable)?;
        Ok(Self {
            program: program.to_path_buf(),
            root: root.into(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn run(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        run_program(&self.program, args, Some(&self.root), timeout).await
    }

    /// Like `run`, but a non-zero exit becomes `GitError::Failed`.
    pub async fn run_checked(&self, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let output = self.run(args, timeout).await?;
        if output.success {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(GitError::Failed {
                args: args.join(" "),
                stderr: output.diagnostic(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

async fn verify(program: &Path) -> bool {
    match run_program(program, &["--version"], None, VERSION_CHECK_TIMEOUT).await {
        Ok(out) => out.success && out.stdout.trim_start().starts_with("git version"),
        Err(_) => false,
    }
}

/// Directories under which a portable git build may live: next to the
/// running executable, one level above it, and the working directory.
pub fn default_anchors() -> Vec<PathBuf> {
    let mut anchors = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        anchors.push(dir.to_path_buf());
        if let Some(parent) = dir.parent() {
            anchors.push(parent.to_path_buf());
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        anchors.push(cwd);
    }
    anchors
}

pub fn bundled_candidate(anchor: &Path) -> PathBuf {
    PORTABLE_GIT.iter().fold(anchor.to_path_buf(), |p, c| p.join(c))
}

/// Writes a bundled git path into ComfyUI-Manager's own config, once.
#[derive(Debug, Clone)]
pub struct ManagerSync {
    pub repo_root: PathBuf,
    pub applied_path: Option<PathBuf>,
    pub dispatcher: Dispatcher,
}

pub fn manager_config_path(repo_root: &Path) -> PathBuf {
    MANAGER_CONFIG.iter().fold(repo_root.to_path_buf(), |p, c| p.join(c))
}

/// Replace or append the `git_exe` line of an ini document.
pub fn set_git_exe_line(content: &str, git_path: &Path) -> String {
    let entry = format!("git_exe = {}", git_path.display());
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.trim().to_lowercase().starts_with("git_exe") {
                replaced = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(entry);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Returns `Ok(true)` when the file was written, `Ok(false)` when skipped.
pub fn apply_manager_git_path(
    repo_root: &Path,
    git_path: &Path,
    applied_path: Option<&Path>,
) -> std::io::Result<bool> {
    if !repo_root.is_dir() {
        warn!(root = %repo_root.display(), "manager git sync skipped: repository root missing");
        return Ok(false);
    }
    let ini = manager_config_path(repo_root);
    if applied_path == Some(git_path) && ini.exists() {
        debug!(path = %git_path.display(), "manager git path already applied");
        return Ok(false);
    }
    if let Some(parent) = ini.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = match std::fs::read(&ini) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    std::fs::write(&ini, set_git_exe_line(&content, git_path))?;
    info!(ini = %ini.display(), "wrote bundled git path into manager config");
    Ok(true)
}

/// Resolves the git executable through the fallback cascade and caches the
/// result until `refresh`.
pub struct GitResolver {
    configured: Option<PathBuf>,
    anchors: Vec<PathBuf>,
    system: PathBuf,
    manager: Option<ManagerSync>,
    cache: RwLock<Option<ExecutableBinding>>,
}

impl GitResolver {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self::with_candidates(configured, default_anchors(), PathBuf::from(SYSTEM_GIT))
    }

    pub fn with_candidates(
        configured: Option<PathBuf>,
        anchors: Vec<PathBuf>,
        system: PathBuf,
    ) -> Self {
        Self {
            configured,
            anchors,
            system,
            manager: None,
            cache: RwLock::new(None),
        }
    }

    pub fn with_manager_sync(mut self, sync: ManagerSync) -> Self {
        self.manager = Some(sync);
        self
    }

    pub async fn resolve(&self) -> ExecutableBinding {
        if let Some(binding) = self.cache.read().await.as_ref() {
            return binding.clone();
        }
        let mut cache = self.cache.write().await;
        if let Some(binding) = cache.as_ref() {
            return binding.clone();
        }
        let binding = self.resolve_uncached().await;
        *cache = Some(binding.clone());
        binding
    }

    /// Drop the cached binding and resolve again.
    pub async fn refresh(&self) -> ExecutableBinding {
        self.cache.write().await.take();
        self.resolve().await
    }

    async fn resolve_uncached(&self) -> ExecutableBinding {
        if let Some(path) = self.configured.clone() {
            if verify(&path).await {
                info!(path = %path.display(), "git resolved from configuration");
                return ExecutableBinding {
                    path: Some(path),
                    provenance: Provenance::Configured,
                };
            }
            warn!(path = %path.display(), "configured git failed verification");
        }

        for anchor in &self.anchors {
            let candidate = bundled_candidate(anchor);
            if candidate.is_file() && verify(&candidate).await {
                info!(path = %candidate.display(), "git resolved to bundled build");
                self.sync_manager(&candidate);
                return ExecutableBinding {
                    path: Some(candidate),
                    provenance: Provenance::Bundled,
                };
            }
        }

        if verify(&self.system).await {
            info!("git resolved to system installation");
            return ExecutableBinding {
                path: Some(self.system.clone()),
                provenance: Provenance::System,
            };
        }

        warn!("git not found");
        ExecutableBinding::unavailable()
    }

    fn sync_manager(&self, git_path: &Path) {
        let Some(sync) = &self.manager else {
            return;
        };
        match apply_manager_git_path(&sync.repo_root, git_path, sync.applied_path.as_deref()) {
            Ok(true) => sync.dispatcher.emit(Event::ManagerGitApplied {
                path: git_path.to_path_buf(),
            }),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to write manager git config"),
        }
    }
}
