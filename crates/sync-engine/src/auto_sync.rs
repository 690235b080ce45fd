//! Automatic queue draining
//!
//! [`AutoSync`] drains the sync queue whenever the connectivity monitor
//! observes a return to online, and optionally on a fixed interval while
//! online.

use networking::ConnectivityMonitor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::orchestrator::SyncOrchestrator;

/// Background driver for [`SyncOrchestrator::process_sync_queue`]
///
/// Stops on [`AutoSync::shutdown`] or when dropped.
pub struct AutoSync {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSync {
    /// Start draining for `user_id`
    pub fn spawn(
        orchestrator: Arc<SyncOrchestrator>,
        monitor: &ConnectivityMonitor,
        user_id: impl Into<String>,
        interval: Option<Duration>,
    ) -> Self {
        let mut status = monitor.subscribe();
        // Every transition to online stamps a new sync time.
        let mut last_online = status.borrow_and_update().last_synced_at;
        let user_id = user_id.into();

        let task = tokio::spawn(async move {
            let mut ticker = interval.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let trigger = tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = status.borrow_and_update().clone();
                        let reconnected = !current.offline && current.last_synced_at != last_online;
                        last_online = current.last_synced_at;
                        if !reconnected {
                            continue;
                        }
                        "reconnect"
                    }
                    _ = next_tick(&mut ticker) => {
                        if status.borrow().offline {
                            continue;
                        }
                        "interval"
                    }
                };

                tracing::debug!(trigger, user_id = %user_id, "Auto-sync draining queue");
                let result = orchestrator.process_sync_queue(&user_id).await;
                if result.processed > 0 || result.failed > 0 {
                    tracing::info!(
                        trigger,
                        processed = result.processed,
                        failed = result.failed,
                        dropped = result.dropped.len(),
                        "Auto-sync finished"
                    );
                }
            }

            tracing::debug!("Auto-sync stopped");
        });

        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Whether the driver is still running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the driver and wait for it to finish
    pub async fn shutdown(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::orchestrator::SyncEvent;
    use crate::test_utils::{FakeApp, MockRemote};
    use networking::{ConnectivityProbe, ManualSignal};
    use serde_json::json;
    use storage::{LocalStore, OperationType};
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct Harness {
        signal: Arc<ManualSignal>,
        monitor: Arc<ConnectivityMonitor>,
        orchestrator: Arc<SyncOrchestrator>,
    }

    async fn harness(online: bool, remote: MockRemote) -> Harness {
        let signal = Arc::new(ManualSignal::new(online));
        let monitor = Arc::new(ConnectivityMonitor::new(signal.clone()));
        let store = LocalStore::in_memory().await.unwrap();
        let probe: Arc<dyn ConnectivityProbe> = monitor.clone();

        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                Arc::new(store),
                probe,
                Arc::new(FakeApp::default()),
                SyncConfig::default(),
            )
            .with_remote(Arc::new(remote)),
        );

        Harness {
            signal,
            monitor,
            orchestrator,
        }
    }

    async fn next_drain(events: &mut broadcast::Receiver<SyncEvent>) -> (usize, usize) {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("no drain within timeout")
                .unwrap();
            if let SyncEvent::QueueDrained { processed, failed } = event {
                return (processed, failed);
            }
        }
    }

    #[tokio::test]
    async fn test_drains_on_reconnect() {
        let mut remote = MockRemote::new();
        remote.expect_apply_mutation().times(1).returning(|_, _| Ok(()));

        let h = harness(false, remote).await;
        h.orchestrator
            .queue_mutation("transactions", OperationType::Create, json!({ "amount": 10 }))
            .await
            .unwrap();

        let mut events = h.orchestrator.subscribe();
        let auto_sync = AutoSync::spawn(h.orchestrator.clone(), &h.monitor, "user-1", None);
        assert!(auto_sync.is_running());

        h.signal.set_online(true);

        assert_eq!(next_drain(&mut events).await, (1, 0));
        assert_eq!(h.orchestrator.pending_operations().await.unwrap(), 0);

        auto_sync.shutdown().await;
        assert!(!auto_sync.is_running());
    }

    #[tokio::test]
    async fn test_drains_on_interval_while_online() {
        let mut remote = MockRemote::new();
        remote.expect_apply_mutation().times(1).returning(|_, _| Ok(()));

        let h = harness(true, remote).await;
        h.orchestrator
            .queue_mutation("transactions", OperationType::Update, json!({ "amount": 3 }))
            .await
            .unwrap();

        let mut events = h.orchestrator.subscribe();
        let _auto_sync = AutoSync::spawn(
            h.orchestrator.clone(),
            &h.monitor,
            "user-1",
            Some(Duration::from_millis(50)),
        );

        assert_eq!(next_drain(&mut events).await, (1, 0));
    }

    #[tokio::test]
    async fn test_going_offline_does_not_drain() {
        // Any remote call would panic
        let h = harness(true, MockRemote::new()).await;
        h.orchestrator
            .queue_mutation("transactions", OperationType::Delete, json!({ "id": 1 }))
            .await
            .unwrap();

        let mut status = h.monitor.subscribe();
        let _auto_sync = AutoSync::spawn(h.orchestrator.clone(), &h.monitor, "user-1", None);

        h.signal.set_online(false);
        timeout(Duration::from_secs(1), status.changed()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.orchestrator.pending_operations().await.unwrap(), 1);
    }
}
