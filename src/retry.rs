//! Retry and timeout utilities.
//!
//! Used by the websocket transport when establishing a connection. The DDP
//! session itself never retries; reconnect policy above the connect step is
//! left to the caller.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

const CONNECT_MIN_BACKOFF: Duration = Duration::from_millis(100);
const CONNECT_MAX_BACKOFF: Duration = Duration::from_secs(2);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry with exponential backoff.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap for the doubled delay.
    pub max_backoff: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
    /// Deadline applied to every single attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Policy used for websocket connects.
    pub fn websocket_connect() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: CONNECT_MIN_BACKOFF,
            max_backoff: CONNECT_MAX_BACKOFF,
            jitter: Duration::from_millis(50),
            attempt_timeout: CONNECT_ATTEMPT_TIMEOUT,
        }
    }

    /// A single attempt, no backoff.
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
            attempt_timeout,
        }
    }

    /// Delay applied after the failed `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = (1..attempt).fold(self.initial_backoff, |delay, _| {
            std::cmp::min(delay.saturating_mul(2), self.max_backoff)
        });
        base + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::websocket_connect()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies a deadline to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit == 0 {
        return Duration::ZERO;
    }

    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = clock ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % (limit + 1))
}
