//! # Retry Executor
//!
//! Bounded retry with a constant delay between attempts. No jitter and no
//! growth: an operation is tried at most `max_attempts` times and the total
//! wait before giving up is `(max_attempts - 1) * delay`.

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently to retry store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "RetryConfig")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(1000);

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempts actually made; zero is read as one.
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

/// On-disk shape of [`RetryPolicy`] (`[retry]` table).
#[derive(Deserialize)]
struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    RetryPolicy::DEFAULT_MAX_ATTEMPTS
}
fn default_delay_ms() -> u64 {
    RetryPolicy::DEFAULT_DELAY.as_millis() as u64
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self::new(cfg.max_attempts, Duration::from_millis(cfg.delay_ms))
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// The last error is returned as-is. Between attempts the task sleeps on the
/// tokio timer, so other requests keep running.
pub async fn execute<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Attempt failed, retrying in {:?}",
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    operation,
                    attempt,
                    error = %e,
                    "Giving up after {} attempts",
                    attempt
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;
    use tracing::subscriber::DefaultGuard;
    use tracing::Level;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts warn and error events emitted while installed.
    #[derive(Clone, Default)]
    struct LevelCounter {
        warn: Arc<AtomicUsize>,
        error: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> Layer<S> for LevelCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            match *event.metadata().level() {
                Level::WARN => self.warn.fetch_add(1, Ordering::SeqCst),
                Level::ERROR => self.error.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }
    }

    fn capture_levels() -> (LevelCounter, DefaultGuard) {
        let counter = LevelCounter::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        (counter, tracing::subscriber::set_default(subscriber))
    }

    /// Fails the first `failures` calls, then returns the call number.
    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(format!("failure #{}", n))
        } else {
            Ok(n)
        }
    }

    /// Virtual time only moves through the timer wheel, which rounds to ms.
    fn assert_waited(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "waited {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_two_failures() {
        let (counter, _guard) = capture_levels();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let start = Instant::now();

        let result = execute(&policy, "flaky", || flaky(&calls, 2)).await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two failed attempts, two waits.
        assert_waited(start, policy.delay * 2);
        assert_eq!(counter.warn.load(Ordering::SeqCst), 2);
        assert_eq!(counter.error.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_unchanged() {
        let (counter, _guard) = capture_levels();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let start = Instant::now();

        let down = || flaky(&calls, u32::MAX);
        let result = execute(&policy, "always-down", down).await;

        assert_eq!(result, Err("failure #3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No sleep after the final failure.
        assert_waited(start, Duration::from_millis(500));
        assert_eq!(counter.warn.load(Ordering::SeqCst), 2);
        assert_eq!(counter.error.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_try_success_does_not_wait() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let policy = RetryPolicy::default();
        let result = execute(&policy, "ok", || flaky(&calls, 0)).await;
        assert_eq!(result, Ok(1));
        assert_waited(start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        let result = execute(&policy, "zero", || flaky(&calls, 5)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_from_config_table() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"delay_ms": 50}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(50));
    }
}
