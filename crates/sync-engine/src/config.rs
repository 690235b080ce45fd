//! Sync engine configuration

use networking::{BackoffSchedule, RetryPolicy};
use std::time::Duration;

/// Configuration for the sync orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Failed drain attempts after which a queued operation is dropped
    pub max_retries: u32,

    /// Inline retries of a failed push during `save`
    pub push_retries: usize,

    /// Delay schedule between inline push retries
    pub retry_backoff: BackoffSchedule,

    /// Queue table name used for state-document operations
    pub state_table: String,

    /// Capacity of the sync event channel
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            push_retries: 1,
            retry_backoff: BackoffSchedule::Fixed(Duration::from_millis(500)),
            state_table: "user_state".to_string(),
            event_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the drain retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the number of inline push retries
    pub fn with_push_retries(mut self, retries: usize) -> Self {
        self.push_retries = retries;
        self
    }

    /// Set the delay schedule between push retries
    pub fn with_retry_backoff(mut self, schedule: BackoffSchedule) -> Self {
        self.retry_backoff = schedule;
        self
    }

    /// Set the state table name
    pub fn with_state_table(mut self, table: impl Into<String>) -> Self {
        self.state_table = table.into();
        self
    }

    /// Set the event channel capacity
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Retry policy applied to inline pushes
    pub fn push_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.push_retries).with_schedule(self.retry_backoff.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.push_retries, 1);
        assert_eq!(config.state_table, "user_state");
        assert_eq!(config.push_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::new()
            .with_max_retries(5)
            .with_push_retries(2)
            .with_retry_backoff(BackoffSchedule::None)
            .with_state_table("pets")
            .with_event_buffer(8);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.state_table, "pets");
        assert_eq!(config.event_buffer, 8);
        assert_eq!(config.push_policy(), RetryPolicy::immediate(2));
    }
}
