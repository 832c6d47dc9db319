//! Fast-forward updates, commit checkout and history for the server's
//! working tree.

use crate::events::{Dispatcher, Event, OperationKind};
use crate::git::{Git, GitError, GitResolver};
use crate::probe;
use crate::repo::{self, RepositoryTarget, RepositoryUnavailable, SafeDirectory};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(120);
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(8);
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HISTORY: usize = 80;
const FALLBACK_BRANCHES: [&str; 2] = ["main", "master"];

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("update not confirmed{}", running_suffix(.instance_running))]
    ConfirmationRequired { instance_running: bool },
    #[error(transparent)]
    Repository(#[from] RepositoryUnavailable),
    #[error("cannot determine the default branch")]
    NoDefaultBranch,
    #[error("switching to {branch} failed: {detail}")]
    SwitchBranch { branch: String, detail: String },
    #[error("fetch failed: {0}")]
    Fetch(#[source] GitError),
    #[error("fast-forward not possible: {detail}")]
    FastForwardRejected { detail: String },
    #[error("pull failed: {0}")]
    Pull(#[source] GitError),
}

fn running_suffix(instance_running: &bool) -> &'static str {
    if *instance_running {
        " (server is running)"
    } else {
        ""
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Repository(#[from] RepositoryUnavailable),
    #[error("commit hash is empty")]
    EmptyHash,
    #[error("local changes would be overwritten: {detail}")]
    Conflict { detail: String },
    #[error(transparent)]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub branch: String,
    /// HEAD was detached and got moved onto `branch` first.
    pub reattached: bool,
    pub before: String,
    pub after: String,
}

impl std::fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.before == self.after {
            write!(f, "{} already at latest ({})", self.branch, self.after)
        } else {
            write!(f, "{} updated {} -> {}", self.branch, self.before, self.after)
        }
    }
}

pub type UpdateResult = Result<UpdateReport, UpdateError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitEntry {
    pub hash: String,
    pub short: String,
    pub date: String,
    pub author: String,
    pub message: String,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadState {
    pub branch: Option<String>,
    pub commit: String,
}

impl HeadState {
    pub fn is_detached(&self) -> bool {
        self.branch.is_none()
    }
}

impl std::fmt::Display for HeadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{branch} {}", self.commit),
            None => write!(f, "(detached HEAD) {}", self.commit),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub const LOG_FORMAT: &str = "--pretty=format:%H|%ad|%an|%s";

/// Parse `git log` output in `LOG_FORMAT`. `head` is the full HEAD hash.
pub fn parse_log(output: &str, head: Option<&str>) -> Vec<CommitEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '|');
            let hash = parts.next()?.trim();
            let date = parts.next()?;
            let author = parts.next()?;
            let message = parts.next()?;
            if hash.is_empty() {
                return None;
            }
            Some(CommitEntry {
                hash: hash.to_string(),
                short: hash.chars().take(8).collect(),
                date: date.to_string(),
                author: author.to_string(),
                message: message.to_string(),
                current: head.is_some_and(|h| h == hash),
            })
        })
        .collect()
}

/// `refs/remotes/origin/main` -> `main`.
pub fn branch_from_symbolic_ref(reference: &str) -> Option<String> {
    let name = reference.trim().strip_prefix("refs/remotes/")?;
    let (_, branch) = name.split_once('/')?;
    (!branch.is_empty()).then(|| branch.to_string())
}

pub fn is_fast_forward_rejection(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not possible to fast-forward")
        || lower.contains("can't be fast-forwarded")
        || lower.contains("diverging branches")
}

pub fn is_checkout_conflict(stderr: &str) -> bool {
    stderr.contains("would be overwritten by checkout")
        || stderr.contains("Please commit your changes or stash them")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs update and checkout against one repository target.
pub struct UpdateEngine {
    resolver: Arc<GitResolver>,
    target: RepositoryTarget,
    safe_directory: Arc<SafeDirectory>,
    port: u16,
    dispatcher: Dispatcher,
}

impl UpdateEngine {
    pub fn new(
        resolver: Arc<GitResolver>,
        target: RepositoryTarget,
        safe_directory: Arc<SafeDirectory>,
        port: u16,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            resolver,
            target,
            safe_directory,
            port,
            dispatcher,
        }
    }

    pub fn target(&self) -> &RepositoryTarget {
        &self.target
    }

    pub async fn open(&self) -> Result<Git, RepositoryUnavailable> {
        let binding = self.resolver.resolve().await;
        repo::open(&binding, &self.target, &self.safe_directory).await
    }

    /// Bring the current branch up to its upstream tip with a fast-forward.
    /// Without `confirm` nothing runs.
    pub async fn update_to_latest(&self, confirm: bool) -> UpdateResult {
        if !confirm {
            let instance_running = probe::is_reachable(self.port).await;
            return Err(UpdateError::ConfirmationRequired { instance_running });
        }
        let result = self.run_update().await;
        match &result {
            Ok(report) => info!(%report, "update finished"),
            Err(e) => warn!(error = %e, "update failed"),
        }
        self.dispatcher
            .emit(Event::operation(OperationKind::Update, &result));
        result
    }

    async fn run_update(&self) -> UpdateResult {
        let git = self.open().await?;
        let before = short_head(&git).await.unwrap_or_default();

        let current = git
            .run_checked(&["branch", "--show-current"], LOCAL_TIMEOUT)
            .await
            .unwrap_or_default();
        let (branch, reattached) = if current.is_empty() {
            let branch = default_branch(&git).await.ok_or(UpdateError::NoDefaultBranch)?;
            info!(%branch, "HEAD detached, switching to default branch");
            git.run_checked(&["checkout", &branch], CHECKOUT_TIMEOUT)
                .await
                .map_err(|e| UpdateError::SwitchBranch {
                    branch: branch.clone(),
                    detail: e.to_string(),
                })?;
            (branch, true)
        } else {
            (current, false)
        };

        let mut target = self.target.clone();
        repo::load_remote(&git, &mut target).await;
        let proxied = match target.proxied_remote() {
            Some(url) => {
                let refspec = "+refs/heads/*:refs/remotes/origin/*";
                match git
                    .run_checked(&["fetch", "--prune", &url, refspec], NETWORK_TIMEOUT)
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "fetch through proxy failed, retrying direct");
                        false
                    }
                }
            }
            None => false,
        };

        if proxied {
            let upstream = format!("refs/remotes/origin/{branch}");
            let out = git
                .run(&["merge", "--ff-only", &upstream], NETWORK_TIMEOUT)
                .await
                .map_err(UpdateError::Pull)?;
            check_fast_forward(&["merge", "--ff-only", &upstream], out)?;
        } else {
            git.run_checked(&["fetch", "--all", "--prune"], NETWORK_TIMEOUT)
                .await
                .map_err(UpdateError::Fetch)?;
            let out = git
                .run(&["pull", "--ff-only"], NETWORK_TIMEOUT)
                .await
                .map_err(UpdateError::Pull)?;
            check_fast_forward(&["pull", "--ff-only"], out)?;
        }

        let after = short_head(&git).await.unwrap_or_default();
        Ok(UpdateReport {
            branch,
            reattached,
            before,
            after,
        })
    }

    /// Check out `hash`, leaving HEAD detached. Callers warn about local
    /// changes before calling this.
    pub async fn checkout_commit(&self, hash: &str) -> Result<HeadState, CheckoutError> {
        let result = self.run_checkout(hash.trim()).await;
        match &result {
            Ok(head) => info!(%head, "checked out commit"),
            Err(e) => warn!(error = %e, hash, "checkout failed"),
        }
        self.dispatcher
            .emit(Event::operation(OperationKind::Checkout, &result));
        result
    }

    async fn run_checkout(&self, hash: &str) -> Result<HeadState, CheckoutError> {
        if hash.is_empty() {
            return Err(CheckoutError::EmptyHash);
        }
        let git = self.open().await?;
        let out = git.run(&["checkout", hash], CHECKOUT_TIMEOUT).await?;
        if !out.success {
            let detail = out.diagnostic();
            if is_checkout_conflict(&detail) {
                return Err(CheckoutError::Conflict { detail });
            }
            return Err(GitError::Failed {
                args: format!("checkout {hash}"),
                stderr: detail,
            }
            .into());
        }
        Ok(head_state_of(&git).await?)
    }

    /// Paths with uncommitted changes, as reported by `status --porcelain`.
    pub async fn pending_changes(&self) -> Result<Vec<String>, CheckoutError> {
        let git = self.open().await?;
        let out = git.run(&["status", "--porcelain"], LOCAL_TIMEOUT).await?;
        if !out.success {
            return Err(GitError::Failed {
                args: "status --porcelain".to_string(),
                stderr: out.diagnostic(),
            }
            .into());
        }
        // Status columns are significant; parse the untrimmed output.
        Ok(out
            .stdout
            .lines()
            .filter_map(|l| l.get(3..))
            .map(str::to_string)
            .collect())
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<CommitEntry>, CheckoutError> {
        let git = self.open().await?;
        let count = format!("-{}", limit.max(1));
        let log = git
            .run_checked(&["log", LOG_FORMAT, "--date=short", &count], LOCAL_TIMEOUT)
            .await?;
        let head = git
            .run_checked(&["rev-parse", "HEAD"], LOCAL_TIMEOUT)
            .await
            .ok();
        Ok(parse_log(&log, head.as_deref()))
    }

    pub async fn head_state(&self) -> Result<HeadState, CheckoutError> {
        let git = self.open().await?;
        Ok(head_state_of(&git).await?)
    }
}

fn check_fast_forward(args: &[&str], out: crate::git::GitOutput) -> Result<(), UpdateError> {
    if out.success {
        return Ok(());
    }
    let detail = out.diagnostic();
    if is_fast_forward_rejection(&detail) {
        return Err(UpdateError::FastForwardRejected { detail });
    }
    Err(UpdateError::Pull(GitError::Failed {
        args: args.join(" "),
        stderr: detail,
    }))
}

async fn short_head(git: &Git) -> Result<String, GitError> {
    git.run_checked(&["rev-parse", "--short", "HEAD"], LOCAL_TIMEOUT)
        .await
}

async fn head_state_of(git: &Git) -> Result<HeadState, GitError> {
    let branch = git
        .run_checked(&["branch", "--show-current"], LOCAL_TIMEOUT)
        .await?;
    let commit = short_head(git).await?;
    Ok(HeadState {
        branch: (!branch.is_empty()).then_some(branch),
        commit,
    })
}

/// The remote's default branch, falling back to a local `main`/`master`.
async fn default_branch(git: &Git) -> Option<String> {
    if let Ok(reference) = git
        .run_checked(&["symbolic-ref", "refs/remotes/origin/HEAD"], LOCAL_TIMEOUT)
        .await
        && let Some(branch) = branch_from_symbolic_ref(&reference)
    {
        return Some(branch);
    }
    for name in FALLBACK_BRANCHES {
        if git
            .run_checked(&["rev-parse", "--verify", "--quiet", name], LOCAL_TIMEOUT)
            .await
            .is_ok()
        {
            return Some(name.to_string());
        }
    }
    None
}
