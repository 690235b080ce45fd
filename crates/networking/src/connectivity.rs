//! Connectivity monitoring
//!
//! [`ConnectivityMonitor`] is the single source of truth for "are we online".
//! It mirrors a platform [`ConnectivitySignal`] into a watchable
//! [`ConnectivityStatus`] and never touches storage or the remote store.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Event raised by the platform's connectivity capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// The platform reports the network as reachable
    Online,
    /// The platform reports the network as unreachable
    Offline,
    /// Link-type metadata changed (e.g., "4g" to "3g")
    ConnectionChanged(Option<String>),
}

/// Platform connectivity capability
pub trait ConnectivitySignal: Send + Sync {
    /// Current connectivity as reported by the platform
    fn is_online(&self) -> bool;

    /// Link-type metadata, when the platform exposes it
    fn connection_type(&self) -> Option<String>;

    /// Subscribe to connectivity events
    fn events(&self) -> broadcast::Receiver<PlatformEvent>;
}

/// Read-only connectivity check consumed by the sync orchestrator
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the network is currently unreachable
    fn is_offline(&self) -> bool;
}

/// Snapshot of the monitor's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityStatus {
    /// Whether the network is unreachable
    pub offline: bool,
    /// Last time a transition to online was observed
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Link-type metadata, when known
    pub connection_type: Option<String>,
}

/// In-process connectivity signal driven by the host
///
/// Host shells forward their platform's online/offline notifications here;
/// tests drive it directly.
pub struct ManualSignal {
    online: AtomicBool,
    connection_type: RwLock<Option<String>>,
    tx: broadcast::Sender<PlatformEvent>,
}

impl ManualSignal {
    /// Create a signal with the given initial connectivity
    pub fn new(online: bool) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            online: AtomicBool::new(online),
            connection_type: RwLock::new(None),
            tx,
        }
    }

    /// Report connectivity; only an actual change emits an event
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let event = if online {
            PlatformEvent::Online
        } else {
            PlatformEvent::Offline
        };
        let _ = self.tx.send(event);
    }

    /// Report new link-type metadata
    pub fn set_connection_type(&self, connection_type: Option<String>) {
        *self.connection_type.write() = connection_type.clone();
        let _ = self.tx.send(PlatformEvent::ConnectionChanged(connection_type));
    }

    /// Number of live event subscribers
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ConnectivitySignal for ManualSignal {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn connection_type(&self) -> Option<String> {
        self.connection_type.read().clone()
    }

    fn events(&self) -> broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
    }
}

/// Observes a [`ConnectivitySignal`] and exposes the current status
///
/// Must be created inside a tokio runtime: construction subscribes to the
/// signal and spawns the listener task. The subscription ends on
/// [`ConnectivityMonitor::shutdown`] or when the monitor is dropped.
pub struct ConnectivityMonitor {
    status: Arc<watch::Sender<ConnectivityStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Start monitoring `signal`
    pub fn new(signal: Arc<dyn ConnectivitySignal>) -> Self {
        // Subscribe before reading the initial state so no transition is missed.
        let mut events = signal.events();
        let online = signal.is_online();

        let initial = ConnectivityStatus {
            offline: !online,
            last_synced_at: online.then(Utc::now),
            connection_type: signal.connection_type(),
        };

        let (tx, _) = watch::channel(initial);
        let status = Arc::new(tx);
        let task_status = Arc::clone(&status);

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => apply_event(&task_status, event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Connectivity events lagged, resyncing");
                        let event = if signal.is_online() {
                            PlatformEvent::Online
                        } else {
                            PlatformEvent::Offline
                        };
                        apply_event(&task_status, event);
                        apply_event(
                            &task_status,
                            PlatformEvent::ConnectionChanged(signal.connection_type()),
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Connectivity listener stopped");
        });

        Self {
            status,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current status
    pub fn status(&self) -> ConnectivityStatus {
        self.status.borrow().clone()
    }

    /// Whether the network is reachable
    pub fn is_online(&self) -> bool {
        !self.status.borrow().offline
    }

    /// Last observed transition to online
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.status.borrow().last_synced_at
    }

    /// Link-type metadata, when known
    pub fn connection_type(&self) -> Option<String> {
        self.status.borrow().connection_type.clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    /// Stop listening to the platform signal
    pub async fn shutdown(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl ConnectivityProbe for ConnectivityMonitor {
    fn is_offline(&self) -> bool {
        self.status.borrow().offline
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

fn apply_event(status: &watch::Sender<ConnectivityStatus>, event: PlatformEvent) {
    match event {
        PlatformEvent::Online => {
            tracing::info!("Network online");
            status.send_modify(|s| {
                s.offline = false;
                s.last_synced_at = Some(Utc::now());
            });
        }
        PlatformEvent::Offline => {
            tracing::warn!("Network offline");
            status.send_modify(|s| s.offline = true);
        }
        PlatformEvent::ConnectionChanged(connection_type) => {
            tracing::debug!(connection_type = ?connection_type, "Connection type changed");
            status.send_modify(|s| s.connection_type = connection_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_change(rx: &mut watch::Receiver<ConnectivityStatus>) -> ConnectivityStatus {
        timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("status change timed out")
            .unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn test_starts_offline_without_sync_time() {
        let signal = Arc::new(ManualSignal::new(false));
        let monitor = ConnectivityMonitor::new(signal);

        assert!(monitor.is_offline());
        assert!(!monitor.is_online());
        assert!(monitor.last_synced_at().is_none());
        assert!(monitor.connection_type().is_none());
    }

    #[tokio::test]
    async fn test_starts_online_with_sync_time() {
        let signal = Arc::new(ManualSignal::new(true));
        let monitor = ConnectivityMonitor::new(signal);

        assert!(!monitor.is_offline());
        assert!(monitor.last_synced_at().is_some());
    }

    #[tokio::test]
    async fn test_transition_to_online_sets_sync_time() {
        let signal = Arc::new(ManualSignal::new(false));
        let monitor = ConnectivityMonitor::new(signal.clone());
        let mut rx = monitor.subscribe();

        signal.set_online(true);
        let status = next_change(&mut rx).await;

        assert!(!status.offline);
        assert!(status.last_synced_at.is_some());
        assert!(!monitor.is_offline());
    }

    #[tokio::test]
    async fn test_going_offline_keeps_last_sync_time() {
        let signal = Arc::new(ManualSignal::new(true));
        let monitor = ConnectivityMonitor::new(signal.clone());
        let synced_at = monitor.last_synced_at();
        let mut rx = monitor.subscribe();

        signal.set_online(false);
        let status = next_change(&mut rx).await;

        assert!(status.offline);
        assert_eq!(status.last_synced_at, synced_at);
    }

    #[tokio::test]
    async fn test_connection_type_updates() {
        let signal = Arc::new(ManualSignal::new(true));
        signal.set_connection_type(Some("4g".to_string()));

        let monitor = ConnectivityMonitor::new(signal.clone());
        assert_eq!(monitor.connection_type().as_deref(), Some("4g"));

        let mut rx = monitor.subscribe();
        signal.set_connection_type(Some("3g".to_string()));
        let status = next_change(&mut rx).await;
        assert_eq!(status.connection_type.as_deref(), Some("3g"));
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes() {
        let signal = Arc::new(ManualSignal::new(true));
        let monitor = ConnectivityMonitor::new(signal.clone());
        assert_eq!(signal.listener_count(), 1);

        monitor.shutdown().await;
        assert_eq!(signal.listener_count(), 0);

        // A second shutdown is harmless
        monitor.shutdown().await;
    }

    #[test]
    fn test_manual_signal_ignores_repeated_state() {
        let signal = ManualSignal::new(true);
        let mut events = signal.events();

        signal.set_online(true);
        assert!(events.try_recv().is_err());

        signal.set_online(false);
        assert_eq!(events.try_recv().unwrap(), PlatformEvent::Offline);
        assert!(!signal.is_online());
    }
}
