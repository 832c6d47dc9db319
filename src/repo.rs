use crate::events::{Dispatcher, Event};
use crate::git::{ExecutableBinding, Git, GitError, VERSION_CHECK_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub const FIXED_PROXY_PREFIX: &str = "https://gh-proxy.com/";
pub const UPSTREAM_HOST: &str = "github.com";
pub const UPSTREAM_BASE: &str = "https://github.com";
const DUBIOUS_OWNERSHIP: &str = "dubious ownership";

// ---------------------------------------------------------------------------
// Proxy rewrite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "prefix", rename_all = "snake_case")]
pub enum ProxyRule {
    #[default]
    None,
    Fixed(String),
    Custom(String),
}

impl ProxyRule {
    /// The proxy prefix with a trailing `/`, if a rule is active.
    pub fn prefix(&self) -> Option<String> {
        let raw = match self {
            ProxyRule::None => return None,
            ProxyRule::Fixed(p) | ProxyRule::Custom(p) => p.trim(),
        };
        if raw.is_empty() {
            return None;
        }
        if raw.ends_with('/') {
            Some(raw.to_string())
        } else {
            Some(format!("{raw}/"))
        }
    }

    /// Route an upstream URL through the proxy. Returns `None` when no rule
    /// is active or the URL does not target the upstream host.
    pub fn rewrite(&self, url: &str) -> Option<String> {
        let prefix = self.prefix()?;
        let url = url.trim();
        if url.starts_with(&prefix) || !targets_upstream(url) {
            return None;
        }
        Some(format!("{prefix}{url}"))
    }

    /// Value for `GITHUB_ENDPOINT` in the server's environment.
    pub fn github_endpoint(&self) -> Option<String> {
        self.prefix().map(|p| format!("{p}{UPSTREAM_BASE}"))
    }
}

fn targets_upstream(url: &str) -> bool {
    let Some(rest) = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    else {
        return false;
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    host.eq_ignore_ascii_case(UPSTREAM_HOST) || host.eq_ignore_ascii_case("www.github.com")
}

// ---------------------------------------------------------------------------
// Repository target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryTarget {
    pub root: PathBuf,
    pub remote_url: Option<String>,
    pub proxy: ProxyRule,
}

impl RepositoryTarget {
    pub fn new(root: impl Into<PathBuf>, proxy: ProxyRule) -> Self {
        Self {
            root: root.into(),
            remote_url: None,
            proxy,
        }
    }

    /// The remote URL rewritten through the proxy, if both are present.
    pub fn proxied_remote(&self) -> Option<String> {
        self.remote_url
            .as_deref()
            .and_then(|url| self.proxy.rewrite(url))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepositoryUnavailable {
    #[error("git unavailable")]
    NoExecutable,
    #[error("repository not found: {0}")]
    MissingRoot(PathBuf),
    #[error("not a git repository: {detail}")]
    NotARepository { detail: String },
}

/// One-shot `safe.directory` remediation for the session.
#[derive(Debug)]
pub struct SafeDirectory {
    attempted: AtomicBool,
    dispatcher: Dispatcher,
}

impl SafeDirectory {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            attempted: AtomicBool::new(false),
            dispatcher,
        }
    }

    pub fn is_dubious_ownership(stderr: &str) -> bool {
        stderr.contains(DUBIOUS_OWNERSHIP)
    }

    /// Mark `git.root()` safe. Only the first call per session does anything.
    pub async fn remediate(&self, git: &Git) -> bool {
        if self.attempted.swap(true, Ordering::SeqCst) {
            return false;
        }
        let root = git.root().to_string_lossy().into_owned();
        match git
            .run_checked(
                &["config", "--global", "--add", "safe.directory", &root],
                VERSION_CHECK_TIMEOUT,
            )
            .await
        {
            Ok(_) => {
                info!(root = %root, "marked repository as safe.directory");
                self.dispatcher.emit(Event::SafeDirectoryMarked {
                    root: git.root().to_path_buf(),
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "safe.directory remediation failed");
                false
            }
        }
    }
}

async fn inside_work_tree(git: &Git) -> Result<(), String> {
    match git
        .run(&["rev-parse", "--is-inside-work-tree"], VERSION_CHECK_TIMEOUT)
        .await
    {
        Ok(out) if out.success && out.stdout.trim() == "true" => Ok(()),
        Ok(out) => Err(out.diagnostic()),
        Err(e) => Err(e.to_string()),
    }
}

/// Establish that `target.root` is a usable working tree. A dubious-ownership
/// failure triggers the session's safe-directory remediation and one retry.
pub async fn open(
    binding: &ExecutableBinding,
    target: &RepositoryTarget,
    safe_directory: &SafeDirectory,
) -> Result<Git, RepositoryUnavailable> {
    let git = Git::new(binding, &target.root).map_err(|_| RepositoryUnavailable::NoExecutable)?;
    if !target.root.is_dir() {
        return Err(RepositoryUnavailable::MissingRoot(target.root.clone()));
    }

    match inside_work_tree(&git).await {
        Ok(()) => Ok(git),
        Err(detail) if SafeDirectory::is_dubious_ownership(&detail) => {
            warn!(root = %target.root.display(), "dubious ownership reported by git");
            if safe_directory.remediate(&git).await {
                inside_work_tree(&git)
                    .await
                    .map(|()| git)
                    .map_err(|detail| RepositoryUnavailable::NotARepository { detail })
            } else {
                Err(RepositoryUnavailable::NotARepository { detail })
            }
        }
        Err(detail) => Err(RepositoryUnavailable::NotARepository { detail }),
    }
}

pub async fn remote_url(git: &Git) -> Result<String, GitError> {
    git.run_checked(&["remote", "get-url", "origin"], VERSION_CHECK_TIMEOUT)
        .await
}

/// Fill in `target.remote_url` from `origin`, leaving it unset on failure.
pub async fn load_remote(git: &Git, target: &mut RepositoryTarget) {
    match remote_url(git).await {
        Ok(url) if !url.is_empty() => target.remote_url = Some(url),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "could not read origin url"),
    }
}
