//! Realtime invalidation
//!
//! Out-of-band remote changes (another device, a server job) arrive as
//! notifications on a per-user channel. They are treated purely as a signal
//! to re-read state through [`SyncOrchestrator::restore`]; payloads are
//! ignored.

use networking::{ChangeEvent, RealtimeChannel, SubscriptionHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::orchestrator::SyncOrchestrator;

/// Name of the change channel for `user_id`
pub fn sync_channel_name(user_id: &str) -> String {
    format!("sync-{}", user_id)
}

/// Cleanup handle for a realtime subscription
///
/// [`RealtimeSubscription::cleanup`] may be called any number of times and
/// also runs on drop.
pub struct RealtimeSubscription {
    active: Mutex<Option<(Arc<dyn RealtimeChannel>, SubscriptionHandle)>>,
}

impl RealtimeSubscription {
    /// A handle with nothing to clean up
    pub fn noop() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    /// Whether the subscription is still live
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Unsubscribe; later calls do nothing
    pub fn cleanup(&self) {
        let active = self.active.lock().take();
        let Some((channels, handle)) = active else {
            return;
        };

        match channels.unsubscribe(&handle) {
            Ok(()) => tracing::debug!(channel = %handle.channel, "Realtime sync stopped"),
            Err(e) => {
                tracing::warn!(channel = %handle.channel, error = %e, "Realtime unsubscribe failed")
            }
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Invoke `on_state_change` for every change on the user's sync channel
///
/// Without a realtime backend, or without a user, nothing is subscribed and a
/// no-op handle is returned.
pub fn setup_realtime_sync(
    channels: Option<Arc<dyn RealtimeChannel>>,
    user_id: &str,
    on_state_change: impl Fn(ChangeEvent) + Send + Sync + 'static,
) -> RealtimeSubscription {
    let Some(channels) = channels else {
        tracing::debug!("No realtime backend, skipping realtime sync");
        return RealtimeSubscription::noop();
    };

    if user_id.trim().is_empty() {
        tracing::debug!("No user, skipping realtime sync");
        return RealtimeSubscription::noop();
    }

    let channel = sync_channel_name(user_id);
    match channels.subscribe(&channel, Arc::new(on_state_change)) {
        Ok(handle) => {
            tracing::info!(channel = %channel, "Realtime sync started");
            RealtimeSubscription {
                active: Mutex::new(Some((channels, handle))),
            }
        }
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "Realtime subscribe failed");
            RealtimeSubscription::noop()
        }
    }
}

/// Restores the user's state whenever the sync channel reports a change
///
/// Changes are funnelled through a bounded queue; a burst that arrives while
/// a restore is running collapses into a single follow-up restore.
pub struct RealtimeRefresher {
    subscription: RealtimeSubscription,
    task: JoinHandle<()>,
}

impl RealtimeRefresher {
    /// Subscribe and start the refresh task
    pub fn spawn(
        orchestrator: Arc<SyncOrchestrator>,
        channels: Option<Arc<dyn RealtimeChannel>>,
        user_id: &str,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(16);

        let subscription = setup_realtime_sync(channels, user_id, move |event| {
            // A full queue already has a refresh pending
            let _ = tx.try_send(event);
        });

        let user_id = user_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut coalesced = 0usize;
                while rx.try_recv().is_ok() {
                    coalesced += 1;
                }

                tracing::debug!(
                    channel = %event.channel,
                    event = %event.event,
                    coalesced,
                    "Remote change, refreshing state"
                );

                let result = orchestrator.restore(&user_id).await;
                if !result.success {
                    tracing::warn!(
                        user_id = %user_id,
                        error = ?result.error,
                        "Realtime refresh failed"
                    );
                }
            }
        });

        Self { subscription, task }
    }

    /// Whether the channel subscription is live
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Unsubscribe and stop refreshing
    pub fn stop(&self) {
        self.subscription.cleanup();
        self.task.abort();
    }
}

impl Drop for RealtimeRefresher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::orchestrator::{RestoreSource, SyncEvent};
    use crate::test_utils::{FakeApp, MockRemote, Probe};
    use networking::{LocalRealtimeHub, RemoteState};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use storage::LocalStore;
    use tokio::time::timeout;

    fn hub() -> (Arc<LocalRealtimeHub>, Option<Arc<dyn RealtimeChannel>>) {
        let hub = Arc::new(LocalRealtimeHub::new());
        let channels: Arc<dyn RealtimeChannel> = hub.clone();
        (hub, Some(channels))
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(sync_channel_name("user-1"), "sync-user-1");
    }

    #[test]
    fn test_change_invokes_callback() {
        let (hub, channels) = hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let subscription = setup_realtime_sync(channels, "user-1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(subscription.is_active());

        hub.publish(ChangeEvent::new("sync-user-1", "UPDATE"));
        hub.publish(ChangeEvent::new("sync-user-2", "UPDATE"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let (hub, channels) = hub();
        let subscription = setup_realtime_sync(channels, "user-1", |_| {});
        assert_eq!(hub.subscriber_count("sync-user-1"), 1);

        subscription.cleanup();
        subscription.cleanup();
        drop(subscription);

        assert_eq!(hub.subscriber_count("sync-user-1"), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let (hub, channels) = hub();
        {
            let _subscription = setup_realtime_sync(channels, "user-1", |_| {});
            assert_eq!(hub.subscriber_count("sync-user-1"), 1);
        }
        assert_eq!(hub.subscriber_count("sync-user-1"), 0);
    }

    #[test]
    fn test_noop_without_backend_or_user() {
        let subscription = setup_realtime_sync(None, "user-1", |_| {});
        assert!(!subscription.is_active());
        subscription.cleanup();

        let (hub, channels) = hub();
        let subscription = setup_realtime_sync(channels, "", |_| {});
        assert!(!subscription.is_active());
        subscription.cleanup();
        assert_eq!(hub.subscriber_count("sync-"), 0);
    }

    #[tokio::test]
    async fn test_refresher_restores_on_change() {
        let store = LocalStore::in_memory().await.unwrap();
        let mut remote = MockRemote::new();
        remote
            .expect_fetch_remote_state()
            .returning(|_| Ok(Some(RemoteState { state: json!({ "coins": 42 }), version: 8 })));

        let app = Arc::new(FakeApp::default());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                Arc::new(store),
                Probe::new(false),
                app.clone(),
                SyncConfig::default(),
            )
            .with_remote(Arc::new(remote)),
        );
        let mut events = orchestrator.subscribe();

        let (hub, channels) = hub();
        let refresher = RealtimeRefresher::spawn(orchestrator, channels, "user-1");
        assert!(refresher.is_active());

        hub.publish(
            ChangeEvent::new("sync-user-1", "UPDATE").with_payload(json!({ "ignored": true })),
        );

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no refresh within timeout")
            .unwrap();
        assert_eq!(
            event,
            SyncEvent::Restored { user_id: "user-1".to_string(), source: RestoreSource::Remote }
        );
        assert_eq!(*app.restored.lock(), vec![json!({ "coins": 42 })]);

        drop(refresher);
        assert_eq!(hub.subscriber_count("sync-user-1"), 0);
    }
}
