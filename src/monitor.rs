use crate::process::{ObservedState, Supervisor};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Run `Supervisor::reconcile` every `interval` until `shutdown` flips to true.
pub fn spawn_reconciler(
    supervisor: Supervisor,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<ObservedState> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let observed = supervisor.reconcile().await;
            if last != Some(observed) {
                debug!(?observed, "reconciled");
                last = Some(observed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Dispatcher, Event};
    use crate::identity::ProcessInspector;
    use crate::process::{RunState, SupervisorOptions};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    struct NoSockets;

    impl ProcessInspector for NoSockets {
        fn candidate_pids(&self, _port: u16) -> BTreeSet<u32> {
            BTreeSet::new()
        }
        fn is_target(&self, _pid: u32) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_reconciler_picks_up_listener_and_stops_on_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dispatcher, mut rx) = Dispatcher::channel();
        let supervisor = Supervisor::new(
            SupervisorOptions {
                port,
                ..SupervisorOptions::default()
            },
            Arc::new(NoSockets),
            dispatcher,
        );
        let (tx, shutdown) = watch::channel(false);
        let handle = spawn_reconciler(supervisor.clone(), Duration::from_millis(50), shutdown);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::RunState {
                state: RunState::Running,
                pid: None
            }
        );

        drop(listener);
        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::RunState {
                state: RunState::Idle,
                pid: None
            }
        );

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
