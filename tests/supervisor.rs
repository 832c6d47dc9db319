#![cfg(unix)]

use comfy_launcher::events::{Dispatcher, Event};
use comfy_launcher::identity::ProcessInspector;
use comfy_launcher::launch::LaunchSpec;
use comfy_launcher::monitor;
use comfy_launcher::process::{
    ObservedState, RunState, StartOutcome, StopError, StopOutcome, Supervisor, SupervisorOptions,
};
use comfy_launcher::sys;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct FixedInspector {
    candidates: BTreeSet<u32>,
    targets: BTreeSet<u32>,
}

impl ProcessInspector for FixedInspector {
    fn candidate_pids(&self, _port: u16) -> BTreeSet<u32> {
        self.candidates.clone()
    }
    fn is_target(&self, pid: u32) -> bool {
        self.targets.contains(&pid)
    }
}

fn no_inspector() -> Arc<FixedInspector> {
    Arc::new(FixedInspector {
        candidates: BTreeSet::new(),
        targets: BTreeSet::new(),
    })
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn options(port: u16) -> SupervisorOptions {
    SupervisorOptions {
        port,
        start_grace: Duration::from_millis(300),
        graceful_timeout: Duration::from_secs(2),
        forced_timeout: Duration::from_secs(1),
        reachability_timeout: Duration::from_millis(200),
    }
}

fn sh(script: &str) -> LaunchSpec {
    LaunchSpec {
        program: PathBuf::from("sh"),
        args: vec!["-c".into(), script.into()],
        env: Default::default(),
        cwd: std::env::temp_dir(),
    }
}

fn spawn_sleeper() -> std::process::Child {
    std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_start_reports_already_running() {
    let sup = Supervisor::new(options(unused_port()), no_inspector(), Dispatcher::detached());
    let StartOutcome::Started { pid } = sup.start(sh("sleep 30")).await.unwrap() else {
        panic!("expected Started");
    };

    let again = sup.start(sh("sleep 30")).await.unwrap();
    assert_eq!(again, StartOutcome::AlreadyRunning { pids: vec![pid] });
    assert_eq!(sup.snapshot().await.pid, Some(pid));

    sup.stop().await.unwrap();
    assert!(!sys::is_pid_alive(pid));
}

#[tokio::test]
async fn test_start_with_port_served_elsewhere_spawns_nothing() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let sup = Supervisor::new(options(port), no_inspector(), Dispatcher::detached());

    let spec = LaunchSpec {
        program: PathBuf::from("/definitely/not/a/python"),
        args: vec![],
        env: Default::default(),
        cwd: std::env::temp_dir(),
    };
    let outcome = sup.start(spec).await.unwrap();
    assert_eq!(outcome, StartOutcome::AlreadyRunning { pids: vec![] });
    let snap = sup.snapshot().await;
    assert_eq!(snap.state, RunState::Running);
    assert!(!snap.owned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconciler_notices_exit() {
    let (dispatcher, mut events) = Dispatcher::channel();
    let sup = Supervisor::new(options(unused_port()), no_inspector(), dispatcher);
    sup.start(sh("sleep 1")).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = monitor::spawn_reconciler(sup.clone(), Duration::from_millis(100), shutdown_rx);

    let idle = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let Event::RunState {
                state: RunState::Idle,
                ..
            } = event
            {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(idle, "reconciler never reported idle");

    shutdown_tx.send(true).unwrap();
    reconciler.await.unwrap();
    assert_eq!(sup.reconcile().await, ObservedState::Idle);
    assert!(sup.snapshot().await.pid.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_untracked_stop_only_kills_targets() {
    let mut target = spawn_sleeper();
    let mut bystander = spawn_sleeper();
    let inspector = Arc::new(FixedInspector {
        candidates: [target.id(), bystander.id()].into_iter().collect(),
        targets: [target.id()].into_iter().collect(),
    });
    let sup = Supervisor::new(options(unused_port()), inspector, Dispatcher::detached());

    let outcome = sup.stop().await.unwrap();
    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            pids: vec![target.id()]
        }
    );
    assert!(!sys::is_pid_alive(target.id()));
    assert!(sys::is_pid_alive(bystander.id()));

    let _ = target.wait();
    bystander.kill().unwrap();
    let _ = bystander.wait();
}

#[tokio::test]
async fn test_untracked_stop_refuses_foreign_listener() {
    let mut bystander = spawn_sleeper();
    let inspector = Arc::new(FixedInspector {
        candidates: [bystander.id()].into_iter().collect(),
        targets: BTreeSet::new(),
    });
    let port = unused_port();
    let sup = Supervisor::new(options(port), inspector, Dispatcher::detached());

    let err = sup.stop().await.unwrap_err();
    assert!(matches!(err, StopError::ForeignListener { port: p, .. } if p == port));
    assert!(sys::is_pid_alive(bystander.id()));

    bystander.kill().unwrap();
    let _ = bystander.wait();
}
