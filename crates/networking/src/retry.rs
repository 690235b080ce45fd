//! Retry policy with configurable backoff
//!
//! The schedule between attempts is a [`BackoffSchedule`]; delays are produced
//! by the `backoff` crate so fixed and exponential schedules share one code path.

use backoff::backoff::{Backoff, Constant, Zero};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Delay schedule between retry attempts
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffSchedule {
    /// Retry immediately
    None,
    /// Wait the same interval before every retry
    Fixed(Duration),
    /// Grow the interval geometrically, capped at `max`
    Exponential {
        /// Delay before the first retry
        initial: Duration,
        /// Upper bound on any single delay
        max: Duration,
        /// Growth factor per retry (e.g., 2.0)
        multiplier: f64,
    },
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Delay schedule between attempts
    pub schedule: BackoffSchedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            schedule: BackoffSchedule::Fixed(Duration::from_millis(500)),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default schedule
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a policy that retries without waiting
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            schedule: BackoffSchedule::None,
        }
    }

    /// Set the delay schedule
    pub fn with_schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Build a fresh delay generator for one retry sequence
    pub fn backoff(&self) -> Box<dyn Backoff + Send> {
        match &self.schedule {
            BackoffSchedule::None => Box::new(Zero {}),
            BackoffSchedule::Fixed(interval) => Box::new(Constant::new(*interval)),
            BackoffSchedule::Exponential {
                initial,
                max,
                multiplier,
            } => Box::new(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(*initial)
                    .with_max_interval(*max)
                    .with_multiplier(*multiplier)
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        }
    }

    /// The delays this policy waits before each retry, in order
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (0..self.max_retries)
            .map(|_| backoff.next_backoff().unwrap_or_default())
            .collect()
    }
}

/// Retry an async operation according to `policy`
///
/// `should_retry` decides whether an error is worth another attempt; the last
/// error is returned once retries are exhausted or a non-retryable error occurs.
///
/// # Examples
/// ```
/// use networking::retry::{retry, RetryPolicy};
///
/// async fn example() -> Result<&'static str, String> {
///     retry(&RetryPolicy::immediate(2), |_: &String| true, || async {
///         Ok("pushed")
///     })
///     .await
/// }
/// ```
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.backoff();
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !should_retry(&err) || retries >= policy.max_retries {
                    return Err(err);
                }

                retries += 1;
                let delay = backoff.next_backoff().unwrap_or_default();
                tracing::debug!(retry = retries, delay_ms = delay.as_millis() as u64, "Retrying");

                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.delays(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn test_fixed_delays() {
        let policy =
            RetryPolicy::new(3).with_schedule(BackoffSchedule::Fixed(Duration::from_secs(2)));
        assert_eq!(policy.delays(), vec![Duration::from_secs(2); 3]);
    }

    #[test]
    fn test_exponential_delays_capped() {
        let policy = RetryPolicy::new(4).with_schedule(BackoffSchedule::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
            multiplier: 2.0,
        });

        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_immediate_delays() {
        assert_eq!(RetryPolicy::immediate(2).delays(), vec![Duration::ZERO; 2]);
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = retry(&RetryPolicy::immediate(3), |_: &String| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("ok")
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = retry(&RetryPolicy::immediate(1), |_: &String| true, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("connection reset".to_string())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = retry(&RetryPolicy::immediate(3), |e: &String| !e.contains("permanent"), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("permanent".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_waits_between_attempts() {
        let policy =
            RetryPolicy::new(2).with_schedule(BackoffSchedule::Fixed(Duration::from_secs(1)));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let started = tokio::time::Instant::now();

        let result = retry(&policy, |_: &String| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("always fails".to_string())
            }
        })
        .await;

        assert_eq!(result, Err("always fails".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }
}
