//! Realtime change-channel port
//!
//! A [`RealtimeChannel`] delivers "something changed" notifications for a
//! named channel. Payloads are advisory: subscribers are expected to re-read
//! authoritative state rather than trust the event body.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Realtime errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    /// Subscribing to a channel failed
    #[error("Failed to subscribe to {channel}: {message}")]
    Subscribe {
        /// Channel name
        channel: String,
        /// Failure reason
        message: String,
    },

    /// The handle does not belong to a live subscription
    #[error("Unknown subscription {0}")]
    UnknownSubscription(u64),
}

/// A change notification
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Channel the event was published on
    pub channel: String,
    /// Event name (e.g., "UPDATE")
    pub event: String,
    /// Optional payload, never authoritative
    pub payload: Option<Value>,
}

impl ChangeEvent {
    /// Create an event without payload
    pub fn new(channel: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            payload: None,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Callback invoked for each change on a subscribed channel
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Identifies one live subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Subscription id, unique per channel implementation
    pub id: u64,
    /// Channel name
    pub channel: String,
}

/// Port to the backend's realtime change notifications
pub trait RealtimeChannel: Send + Sync {
    /// Subscribe `on_change` to `channel`
    fn subscribe(
        &self,
        channel: &str,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, RealtimeError>;

    /// Cancel a subscription
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), RealtimeError>;
}

/// In-process realtime channel
///
/// Hosts bridge their backend's websocket feed into [`LocalRealtimeHub::publish`];
/// tests publish directly.
#[derive(Default)]
pub struct LocalRealtimeHub {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(u64, ChangeCallback)>>>,
}

impl LocalRealtimeHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every subscriber of its channel, returning how many were notified
    pub fn publish(&self, event: ChangeEvent) -> usize {
        // Callbacks run outside the lock so they may (un)subscribe.
        let callbacks: Vec<ChangeCallback> = self
            .channels
            .lock()
            .get(&event.channel)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        tracing::trace!(
            channel = %event.channel,
            event = %event.event,
            subscribers = callbacks.len(),
            "Publishing change"
        );

        for callback in &callbacks {
            callback(event.clone());
        }
        callbacks.len()
    }

    /// Number of live subscriptions on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }
}

impl RealtimeChannel for LocalRealtimeHub {
    fn subscribe(
        &self,
        channel: &str,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((id, on_change));

        tracing::debug!(channel, id, "Realtime subscription added");
        Ok(SubscriptionHandle {
            id,
            channel: channel.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), RealtimeError> {
        let mut channels = self.channels.lock();
        let subs = channels
            .get_mut(&handle.channel)
            .ok_or(RealtimeError::UnknownSubscription(handle.id))?;

        let before = subs.len();
        subs.retain(|(id, _)| *id != handle.id);
        if subs.len() == before {
            return Err(RealtimeError::UnknownSubscription(handle.id));
        }
        if subs.is_empty() {
            channels.remove(&handle.channel);
        }

        tracing::debug!(channel = %handle.channel, id = handle.id, "Realtime subscription removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback = Arc::new(move |event| sink.lock().push(event));
        (callback, seen)
    }

    #[test]
    fn test_publish_reaches_channel_subscribers() {
        let hub = LocalRealtimeHub::new();
        let (cb, seen) = recorder();
        hub.subscribe("sync-user-1", cb).unwrap();

        let event = ChangeEvent::new("sync-user-1", "UPDATE").with_payload(json!({ "version": 2 }));
        assert_eq!(hub.publish(event.clone()), 1);
        assert_eq!(*seen.lock(), vec![event]);
    }

    #[test]
    fn test_publish_ignores_other_channels() {
        let hub = LocalRealtimeHub::new();
        let (cb, seen) = recorder();
        hub.subscribe("sync-user-1", cb).unwrap();

        assert_eq!(hub.publish(ChangeEvent::new("sync-user-2", "UPDATE")), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = LocalRealtimeHub::new();
        let (cb, seen) = recorder();
        let handle = hub.subscribe("sync-user-1", cb).unwrap();
        assert_eq!(hub.subscriber_count("sync-user-1"), 1);

        hub.unsubscribe(&handle).unwrap();
        assert_eq!(hub.subscriber_count("sync-user-1"), 0);

        hub.publish(ChangeEvent::new("sync-user-1", "UPDATE"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_double_unsubscribe_is_error() {
        let hub = LocalRealtimeHub::new();
        let (cb, _) = recorder();
        let handle = hub.subscribe("sync-user-1", cb).unwrap();

        hub.unsubscribe(&handle).unwrap();
        assert_eq!(
            hub.unsubscribe(&handle),
            Err(RealtimeError::UnknownSubscription(handle.id))
        );
    }

    #[test]
    fn test_handles_are_unique() {
        let hub = LocalRealtimeHub::new();
        let (a, _) = recorder();
        let (b, _) = recorder();

        let first = hub.subscribe("sync-user-1", a).unwrap();
        let second = hub.subscribe("sync-user-1", b).unwrap();
        assert_ne!(first, second);
        assert_eq!(hub.subscriber_count("sync-user-1"), 2);
    }
}
