//! The launcher's components wired together once per process.

use crate::config::LauncherConfig;
use crate::events::{Dispatcher, Event, EventReceiver, OperationKind};
use crate::git::{ExecutableBinding, GitResolver, ManagerSync};
use crate::identity::SystemInspector;
use crate::launch::{self, LaunchSpec};
use crate::paths::Paths;
use crate::pip::{self, InstallResult};
use crate::process::{StartError, Supervisor, SupervisorOptions};
use crate::repo::{RepositoryTarget, SafeDirectory};
use crate::update::{UpdateEngine, UpdateReport};
use crate::versions::{Dimension, SchedulerOptions, Scope, SystemVersionSource, VersionScheduler};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Session {
    pub paths: Paths,
    pub config: LauncherConfig,
    pub dispatcher: Dispatcher,
    pub resolver: Arc<GitResolver>,
    pub supervisor: Supervisor,
    pub versions: VersionScheduler,
    pub updates: Arc<UpdateEngine>,
}

impl Session {
    pub fn new(paths: Paths, config: LauncherConfig) -> (Self, EventReceiver) {
        let (dispatcher, events) = Dispatcher::channel();
        let repo_root = config.repo_root();
        let port = config.launch.port;

        let resolver = Arc::new(
            GitResolver::new(config.paths.git.clone()).with_manager_sync(ManagerSync {
                repo_root: repo_root.clone(),
                applied_path: config.state.manager_git_path.clone(),
                dispatcher: dispatcher.clone(),
            }),
        );
        let safe_directory = Arc::new(SafeDirectory::new(dispatcher.clone()));
        let target = RepositoryTarget::new(&repo_root, config.proxy_rule());

        let supervisor = Supervisor::new(
            SupervisorOptions {
                port,
                ..SupervisorOptions::default()
            },
            Arc::new(SystemInspector::new(&repo_root)),
            dispatcher.clone(),
        );
        let source = SystemVersionSource::new(
            python_for_queries(&config),
            target.clone(),
            Arc::clone(&resolver),
            Arc::clone(&safe_directory),
        );
        let versions = VersionScheduler::new(
            Arc::new(source),
            SchedulerOptions::default(),
            dispatcher.clone(),
        );
        let updates = Arc::new(UpdateEngine::new(
            Arc::clone(&resolver),
            target,
            safe_directory,
            port,
            dispatcher.clone(),
        ));

        (
            Self {
                paths,
                config,
                dispatcher,
                resolver,
                supervisor,
                versions,
                updates,
            },
            events,
        )
    }

    pub async fn git_binding(&self) -> ExecutableBinding {
        self.resolver.resolve().await
    }

    /// Build the launch command against the current git binding.
    pub async fn launch_spec(&self) -> Result<LaunchSpec, StartError> {
        let binding = self.git_binding().await;
        launch::build(&self.config, &binding)
    }

    pub fn python(&self) -> PathBuf {
        python_for_queries(&self.config)
    }

    /// Update the checkout, then each package behind `packages`.
    pub async fn update_all(&self, packages: &[Dimension]) -> BatchUpdate {
        update_all(
            &self.updates,
            &self.python(),
            self.config.mirrors.pip_index.as_deref(),
            packages,
            &self.dispatcher,
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageUpdate {
    pub dimension: Dimension,
    pub package: String,
    pub result: InstallResult,
}

/// Combined outcome of a core update and the package installs after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchUpdate {
    pub core: Option<UpdateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_error: Option<String>,
    pub packages: Vec<PackageUpdate>,
}

impl BatchUpdate {
    pub fn success(&self) -> bool {
        self.core.is_some() && self.packages.iter().all(|p| p.result.success)
    }

    /// The kernel plus every package that was touched.
    pub fn refresh_scope(&self) -> Scope {
        let mut dims = vec![Dimension::Kernel];
        dims.extend(self.packages.iter().map(|p| p.dimension));
        Scope::Selected(dims)
    }
}

/// Fast-forward the checkout, then install or upgrade each package. A failed
/// core update does not stop the installs; every step is reported.
pub async fn update_all(
    updates: &UpdateEngine,
    python: &Path,
    index_url: Option<&str>,
    packages: &[Dimension],
    dispatcher: &Dispatcher,
) -> BatchUpdate {
    let (core, core_error) = match updates.update_to_latest(true).await {
        Ok(report) => (Some(report), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let mut installed = Vec::new();
    for dimension in packages {
        let Some(package) = dimension.package() else {
            continue;
        };
        let result = pip::install_or_update(python, package, index_url, true).await;
        dispatcher.emit(Event::Operation {
            kind: OperationKind::Install,
            success: result.success,
            message: format!("{package}: {result}"),
        });
        installed.push(PackageUpdate {
            dimension: *dimension,
            package: package.to_string(),
            result,
        });
    }

    BatchUpdate {
        core,
        core_error,
        packages: installed,
    }
}

/// Interpreter used for version queries and installs. Falls back to the
/// configured path itself so the failure surfaces in the probe result.
fn python_for_queries(config: &LauncherConfig) -> PathBuf {
    launch::resolve_python(config).unwrap_or_else(|_| {
        config
            .paths
            .python
            .clone()
            .unwrap_or_else(|| PathBuf::from("python3"))
    })
}

/// Fold a persisted-state event into `config`. Returns true when the config
/// changed and should be saved.
pub fn record_state(config: &mut LauncherConfig, event: &Event) -> bool {
    match event {
        Event::SafeDirectoryMarked { .. } if !config.state.safe_directory_marked => {
            config.state.safe_directory_marked = true;
            true
        }
        Event::ManagerGitApplied { path }
            if config.state.manager_git_path.as_ref() != Some(path) =>
        {
            config.state.manager_git_path = Some(path.clone());
            true
        }
        _ => false,
    }
}

/// Drain whatever is queued and fold it into `config`.
pub fn drain_state(config: &mut LauncherConfig, events: &mut EventReceiver) -> bool {
    let mut changed = false;
    while let Ok(event) = events.try_recv() {
        changed |= record_state(config, &event);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RunState;

    #[test]
    fn test_record_state_flags() {
        let mut config = LauncherConfig::default();
        assert!(record_state(
            &mut config,
            &Event::SafeDirectoryMarked {
                root: PathBuf::from("/srv/ComfyUI")
            }
        ));
        assert!(config.state.safe_directory_marked);
        assert!(!record_state(
            &mut config,
            &Event::SafeDirectoryMarked {
                root: PathBuf::from("/srv/ComfyUI")
            }
        ));

        let path = PathBuf::from("/app/tools/PortableGit/bin/git");
        assert!(record_state(
            &mut config,
            &Event::ManagerGitApplied { path: path.clone() }
        ));
        assert_eq!(config.state.manager_git_path, Some(path.clone()));
        assert!(!record_state(&mut config, &Event::ManagerGitApplied { path }));
    }

    #[test]
    fn test_other_events_leave_config() {
        let mut config = LauncherConfig::default();
        assert!(!record_state(
            &mut config,
            &Event::RunState {
                state: RunState::Running,
                pid: None
            }
        ));
        assert_eq!(config, LauncherConfig::default());
    }

    #[test]
    fn test_batch_success_needs_every_step() {
        let report = UpdateReport {
            branch: "master".into(),
            reattached: false,
            before: "abc1234".into(),
            after: "def5678".into(),
        };
        let package = |ok: bool| PackageUpdate {
            dimension: Dimension::Frontend,
            package: "comfyui-frontend-package".into(),
            result: InstallResult {
                success: ok,
                ..InstallResult::default()
            },
        };
        let mut batch = BatchUpdate {
            core: Some(report),
            core_error: None,
            packages: vec![package(true)],
        };
        assert!(batch.success());
        assert_eq!(
            batch.refresh_scope(),
            Scope::Selected(vec![Dimension::Kernel, Dimension::Frontend])
        );

        batch.packages.push(package(false));
        assert!(!batch.success());

        batch.packages.clear();
        batch.core = None;
        batch.core_error = Some("repository not found".into());
        assert!(!batch.success());
        assert_eq!(batch.refresh_scope(), Scope::Selected(vec![Dimension::Kernel]));
    }

    #[tokio::test]
    async fn test_update_all_continues_after_core_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut events) = Dispatcher::channel();
        let updates = UpdateEngine::new(
            Arc::new(GitResolver::with_candidates(None, Vec::new(), PathBuf::from("git"))),
            RepositoryTarget::new(dir.path().join("ComfyUI"), Default::default()),
            Arc::new(SafeDirectory::new(dispatcher.clone())),
            1,
            dispatcher.clone(),
        );
        let python = dir.path().join("venv").join("bin").join("python");

        let batch = update_all(
            &updates,
            &python,
            None,
            &[Dimension::Frontend, Dimension::Python, Dimension::Templates],
            &dispatcher,
        )
        .await;
        assert!(batch.core.is_none());
        assert!(batch.core_error.is_some());
        let touched: Vec<_> = batch.packages.iter().map(|p| p.dimension).collect();
        assert_eq!(touched, vec![Dimension::Frontend, Dimension::Templates]);
        assert!(batch.packages.iter().all(|p| !p.result.success));
        assert!(!batch.success());

        let mut installs = 0;
        while let Ok(event) = events.try_recv() {
            if let Event::Operation {
                kind: OperationKind::Install,
                success,
                ..
            } = event
            {
                assert!(!success);
                installs += 1;
            }
        }
        assert_eq!(installs, 2);
    }

    #[tokio::test]
    async fn test_session_wires_configured_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LauncherConfig::default();
        config.launch.port = 8190;
        config.paths.repo_root = Some(dir.path().join("ComfyUI"));
        let (session, _events) = Session::new(Paths::with_base(dir.path().to_path_buf()), config);
        assert_eq!(session.supervisor.port(), 8190);
        assert_eq!(session.updates.target().root, dir.path().join("ComfyUI"));
        assert!(session.versions.facts().is_empty());
    }
}
