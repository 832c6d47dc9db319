//! Version facts about the managed server and the scheduler that keeps them
//! fresh.
//!
//! A refresh marks every dimension in its scope `Pending`, probes them on a
//! bounded pool and pushes each result through the dispatcher as soon as it
//! lands. A watchdog fails whatever is still pending when it fires, and a
//! per-dimension generation counter drops results that arrive late.

use crate::events::{Dispatcher, Event};
use crate::git::{GitError, GitResolver};
use crate::pip::{self, PipError};
use crate::repo::{self, RepositoryTarget, RepositoryUnavailable, SafeDirectory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_WORKERS: usize = 4;
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);
pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(8);
pub const TAG_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const NOT_INSTALLED: &str = "not installed";

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Kernel,
    Python,
    Torch,
    Frontend,
    Templates,
    Git,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::Kernel,
        Dimension::Python,
        Dimension::Torch,
        Dimension::Frontend,
        Dimension::Templates,
        Dimension::Git,
    ];

    /// The pip distribution backing this dimension, if any.
    pub fn package(self) -> Option<&'static str> {
        match self {
            Dimension::Torch => Some("torch"),
            Dimension::Frontend => Some("comfyui-frontend-package"),
            Dimension::Templates => Some("comfyui-workflow-templates"),
            _ => None,
        }
    }

    /// Dimensions that shell out to git go to the back of a batch.
    pub fn is_source_control(self) -> bool {
        matches!(self, Dimension::Kernel | Dimension::Git)
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::Kernel => write!(f, "kernel"),
            Dimension::Python => write!(f, "python"),
            Dimension::Torch => write!(f, "torch"),
            Dimension::Frontend => write!(f, "frontend"),
            Dimension::Templates => write!(f, "templates"),
            Dimension::Git => write!(f, "git"),
        }
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dimension::ALL
            .into_iter()
            .find(|d| d.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<String> = Dimension::ALL.iter().map(|d| d.to_string()).collect();
                format!("unknown dimension '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Only(Dimension),
    Selected(Vec<Dimension>),
}

impl Scope {
    /// Interpreter-side dimensions, refreshed together after a package install.
    pub fn python_related() -> Self {
        Scope::Selected(vec![
            Dimension::Python,
            Dimension::Torch,
            Dimension::Frontend,
            Dimension::Templates,
        ])
    }

    /// Deduplicated dimensions in scheduling order, source control last.
    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut dims: Vec<Dimension> = match self {
            Scope::All => Dimension::ALL.to_vec(),
            Scope::Only(d) => vec![*d],
            Scope::Selected(ds) => ds.clone(),
        };
        let mut seen = Vec::with_capacity(dims.len());
        dims.retain(|d| {
            if seen.contains(d) {
                false
            } else {
                seen.push(*d);
                true
            }
        });
        dims.sort_by_key(|d| d.is_source_control());
        dims
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactState {
    Pending,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionFact {
    pub dimension: Dimension,
    pub value: String,
    pub fetched_at: DateTime<Utc>,
    pub state: FactState,
}

impl VersionFact {
    fn pending(dimension: Dimension) -> Self {
        Self {
            dimension,
            value: String::new(),
            fetched_at: Utc::now(),
            state: FactState::Pending,
        }
    }

    fn settled(dimension: Dimension, result: Result<String, ProbeError>) -> Self {
        let (value, state) = match result {
            Ok(value) => (value, FactState::Resolved),
            Err(e) => (e.to_string(), FactState::Failed),
        };
        Self {
            dimension,
            value,
            fetched_at: Utc::now(),
            state,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The watchdog gave up waiting on this dimension.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error(transparent)]
    Repository(#[from] RepositoryUnavailable),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Pip(#[from] PipError),
    #[error("no tag or commit found")]
    NotFound,
}

/// Produces the value of one dimension.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn probe(&self, dimension: Dimension) -> Result<String, ProbeError>;
}

/// Probes the real interpreter and repository.
pub struct SystemVersionSource {
    python: PathBuf,
    target: RepositoryTarget,
    resolver: Arc<GitResolver>,
    safe_directory: Arc<SafeDirectory>,
}

impl SystemVersionSource {
    pub fn new(
        python: impl Into<PathBuf>,
        target: RepositoryTarget,
        resolver: Arc<GitResolver>,
        safe_directory: Arc<SafeDirectory>,
    ) -> Self {
        Self {
            python: python.into(),
            target,
            resolver,
            safe_directory,
        }
    }

    async fn git_status(&self) -> Result<String, ProbeError> {
        let binding = self.resolver.resolve().await;
        repo::open(&binding, &self.target, &self.safe_directory).await?;
        Ok(format!("ok ({})", binding.provenance))
    }

    async fn kernel(&self) -> Result<String, ProbeError> {
        let binding = self.resolver.resolve().await;
        let git = repo::open(&binding, &self.target, &self.safe_directory).await?;

        let tag = match describe(&git).await {
            Ok(tag) => Some(tag),
            Err(e) => {
                debug!(error = %e, "no reachable tag, fetching tags");
                let mut target = self.target.clone();
                repo::load_remote(&git, &mut target).await;
                let remote = target.proxied_remote().unwrap_or_else(|| "origin".into());
                match git
                    .run_checked(&["fetch", "--tags", &remote], TAG_FETCH_TIMEOUT)
                    .await
                {
                    Ok(_) => describe(&git).await.ok(),
                    Err(e) => {
                        warn!(error = %e, "tag fetch failed");
                        None
                    }
                }
            }
        };
        let short = git
            .run_checked(&["rev-parse", "--short", "HEAD"], DESCRIBE_TIMEOUT)
            .await
            .ok()
            .filter(|s| !s.is_empty());

        match (tag, short) {
            (Some(tag), Some(short)) => Ok(format!("{tag} ({short})")),
            (Some(tag), None) => Ok(tag),
            (None, Some(short)) => Ok(format!("({short})")),
            (None, None) => Err(ProbeError::NotFound),
        }
    }
}

async fn describe(git: &crate::git::Git) -> Result<String, GitError> {
    let tag = git
        .run_checked(&["describe", "--tags", "--abbrev=0"], DESCRIBE_TIMEOUT)
        .await?;
    if tag.is_empty() {
        return Err(GitError::Failed {
            args: "describe --tags --abbrev=0".into(),
            stderr: "empty output".into(),
        });
    }
    Ok(tag)
}

#[async_trait]
impl VersionSource for SystemVersionSource {
    async fn probe(&self, dimension: Dimension) -> Result<String, ProbeError> {
        match dimension {
            Dimension::Kernel => self.kernel().await,
            Dimension::Git => self.git_status().await,
            Dimension::Python => Ok(pip::python_version(&self.python, pip::QUERY_TIMEOUT).await?),
            Dimension::Torch | Dimension::Frontend | Dimension::Templates => {
                let package = dimension.package().unwrap_or_default();
                let version = pip::package_version(&self.python, package, pip::QUERY_TIMEOUT).await?;
                Ok(version.unwrap_or_else(|| NOT_INSTALLED.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub watchdog: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            watchdog: WATCHDOG_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    facts: BTreeMap<Dimension, VersionFact>,
    generations: BTreeMap<Dimension, u64>,
}

impl Ledger {
    fn generation(&self, dimension: Dimension) -> u64 {
        self.generations.get(&dimension).copied().unwrap_or(0)
    }

    fn is_current_pending(&self, dimension: Dimension, generation: u64) -> bool {
        self.generation(dimension) == generation
            && self
                .facts
                .get(&dimension)
                .is_some_and(|f| f.state == FactState::Pending)
    }
}

#[derive(Clone)]
pub struct VersionScheduler {
    source: Arc<dyn VersionSource>,
    options: SchedulerOptions,
    ledger: Arc<Mutex<Ledger>>,
    pool: Arc<Semaphore>,
    dispatcher: Dispatcher,
}

impl VersionScheduler {
    pub fn new(
        source: Arc<dyn VersionSource>,
        options: SchedulerOptions,
        dispatcher: Dispatcher,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(options.workers.max(1)));
        Self {
            source,
            options,
            ledger: Arc::new(Mutex::new(Ledger::default())),
            pool,
            dispatcher,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every known fact.
    pub fn facts(&self) -> Vec<VersionFact> {
        self.ledger().facts.values().cloned().collect()
    }

    pub fn fact(&self, dimension: Dimension) -> Option<VersionFact> {
        self.ledger().facts.get(&dimension).cloned()
    }

    /// Schedule probes for `scope` and return immediately. The returned
    /// handle completes once every dimension settled or the watchdog fired;
    /// callers may drop it.
    pub fn refresh(&self, scope: Scope) -> JoinHandle<()> {
        let dims = scope.dimensions();
        let batch: Vec<(Dimension, u64)> = {
            let mut ledger = self.ledger();
            dims.iter()
                .map(|&d| {
                    let generation = ledger.generation(d) + 1;
                    ledger.generations.insert(d, generation);
                    let fact = VersionFact::pending(d);
                    ledger.facts.insert(d, fact.clone());
                    self.dispatcher.emit(Event::Version { fact });
                    (d, generation)
                })
                .collect()
        };
        info!(dimensions = ?dims, "refreshing version facts");

        let this = self.clone();
        tokio::spawn(async move {
            let watchdog = this.options.watchdog;
            let feed = this.clone().feed(batch.clone());
            tokio::select! {
                _ = feed => {}
                _ = tokio::time::sleep(watchdog) => this.sweep(&batch),
            }
        })
    }

    /// Hand the batch to the pool in order and wait for every probe.
    async fn feed(self, batch: Vec<(Dimension, u64)>) {
        let mut handles = Vec::with_capacity(batch.len());
        for (dimension, generation) in batch {
            let Ok(permit) = self.pool.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let watchdog = this.options.watchdog;
                let result = tokio::time::timeout(watchdog, this.source.probe(dimension))
                    .await
                    .unwrap_or(Err(ProbeError::Timeout {
                        secs: watchdog.as_secs(),
                    }));
                this.settle(dimension, generation, result);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn settle(&self, dimension: Dimension, generation: u64, result: Result<String, ProbeError>) {
        let mut ledger = self.ledger();
        if !ledger.is_current_pending(dimension, generation) {
            debug!(%dimension, generation, "discarding stale version result");
            return;
        }
        let fact = VersionFact::settled(dimension, result);
        debug!(%dimension, value = %fact.value, state = ?fact.state, "version fact settled");
        ledger.facts.insert(dimension, fact.clone());
        self.dispatcher.emit(Event::Version { fact });
    }

    fn sweep(&self, batch: &[(Dimension, u64)]) {
        let secs = self.options.watchdog.as_secs();
        for &(dimension, generation) in batch {
            let mut ledger = self.ledger();
            if !ledger.is_current_pending(dimension, generation) {
                continue;
            }
            warn!(%dimension, "version probe timed out");
            let fact = VersionFact::settled(dimension, Err(ProbeError::Timeout { secs }));
            ledger.facts.insert(dimension, fact.clone());
            self.dispatcher.emit(Event::Version { fact });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Hang;

    #[async_trait]
    impl VersionSource for Hang {
        async fn probe(&self, _dimension: Dimension) -> Result<String, ProbeError> {
            std::future::pending().await
        }
    }

    struct Fixed;

    #[async_trait]
    impl VersionSource for Fixed {
        async fn probe(&self, dimension: Dimension) -> Result<String, ProbeError> {
            match dimension {
                Dimension::Torch => Ok(NOT_INSTALLED.into()),
                Dimension::Git => Err(RepositoryUnavailable::NoExecutable.into()),
                d => Ok(format!("{d}-1.0")),
            }
        }
    }

    /// First call is slow, every later call is fast.
    struct SlowThenFast {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VersionSource for SlowThenFast {
        async fn probe(&self, _dimension: Dimension) -> Result<String, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok("stale".into())
            } else {
                Ok("fresh".into())
            }
        }
    }

    struct Recording {
        order: Mutex<Vec<Dimension>>,
    }

    #[async_trait]
    impl VersionSource for Recording {
        async fn probe(&self, dimension: Dimension) -> Result<String, ProbeError> {
            self.order.lock().unwrap().push(dimension);
            Ok(String::new())
        }
    }

    fn scheduler(source: Arc<dyn VersionSource>, watchdog: Duration) -> VersionScheduler {
        VersionScheduler::new(
            source,
            SchedulerOptions {
                workers: DEFAULT_WORKERS,
                watchdog,
            },
            Dispatcher::detached(),
        )
    }

    #[test]
    fn test_scope_puts_source_control_last() {
        let dims = Scope::All.dimensions();
        assert_eq!(dims.len(), 6);
        assert!(dims[4].is_source_control());
        assert!(dims[5].is_source_control());
        assert!(!dims[..4].iter().any(|d| d.is_source_control()));
    }

    #[test]
    fn test_scope_dedups() {
        let scope = Scope::Selected(vec![Dimension::Git, Dimension::Torch, Dimension::Git]);
        assert_eq!(scope.dimensions(), vec![Dimension::Torch, Dimension::Git]);
    }

    #[test]
    fn test_dimension_parse() {
        assert_eq!("Torch".parse::<Dimension>().unwrap(), Dimension::Torch);
        assert!("cuda".parse::<Dimension>().is_err());
    }

    #[tokio::test]
    async fn test_hung_sources_fail_within_watchdog() {
        let watchdog = Duration::from_millis(300);
        let (dispatcher, mut rx) = Dispatcher::channel();
        let s = VersionScheduler::new(
            Arc::new(Hang),
            SchedulerOptions {
                workers: DEFAULT_WORKERS,
                watchdog,
            },
            dispatcher,
        );
        let started = Instant::now();
        s.refresh(Scope::All).await.unwrap();
        assert!(started.elapsed() < watchdog + Duration::from_secs(1));

        let facts = s.facts();
        assert_eq!(facts.len(), 6);
        assert!(facts.iter().all(|f| f.state == FactState::Failed));

        // Six pending notices, then six failures.
        let mut failed = 0;
        while let Ok(Event::Version { fact }) = rx.try_recv() {
            if fact.state == FactState::Failed {
                failed += 1;
            }
        }
        assert_eq!(failed, 6);
    }

    #[tokio::test]
    async fn test_results_resolve_and_fail_independently() {
        let s = scheduler(Arc::new(Fixed), Duration::from_secs(5));
        s.refresh(Scope::All).await.unwrap();
        assert_eq!(s.fact(Dimension::Python).unwrap().value, "python-1.0");
        assert_eq!(s.fact(Dimension::Torch).unwrap().value, NOT_INSTALLED);
        let git = s.fact(Dimension::Git).unwrap();
        assert_eq!(git.state, FactState::Failed);
        assert_eq!(git.value, "git unavailable");
    }

    #[tokio::test]
    async fn test_single_dimension_refresh_leaves_others() {
        let s = scheduler(Arc::new(Fixed), Duration::from_secs(5));
        s.refresh(Scope::Only(Dimension::Frontend)).await.unwrap();
        assert_eq!(s.facts().len(), 1);
        assert_eq!(s.fact(Dimension::Frontend).unwrap().state, FactState::Resolved);
    }

    #[tokio::test]
    async fn test_late_result_does_not_override_newer_refresh() {
        let s = scheduler(
            Arc::new(SlowThenFast {
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(5),
        );
        let first = s.refresh(Scope::Only(Dimension::Python));
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.refresh(Scope::Only(Dimension::Python)).await.unwrap();
        first.await.unwrap();
        assert_eq!(s.fact(Dimension::Python).unwrap().value, "fresh");
    }

    #[tokio::test]
    async fn test_result_after_watchdog_is_discarded() {
        let s = scheduler(
            Arc::new(SlowThenFast {
                calls: AtomicUsize::new(0),
            }),
            Duration::from_millis(100),
        );
        s.refresh(Scope::Only(Dimension::Python)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let fact = s.fact(Dimension::Python).unwrap();
        assert_eq!(fact.state, FactState::Failed);
        assert_ne!(fact.value, "stale");
    }

    #[tokio::test]
    async fn test_single_worker_probes_in_schedule_order() {
        let source = Arc::new(Recording {
            order: Mutex::new(Vec::new()),
        });
        let s = VersionScheduler::new(
            source.clone(),
            SchedulerOptions {
                workers: 1,
                watchdog: Duration::from_secs(5),
            },
            Dispatcher::detached(),
        );
        s.refresh(Scope::All).await.unwrap();
        let order = source.order.lock().unwrap().clone();
        assert_eq!(order, Scope::All.dimensions());
    }
}
