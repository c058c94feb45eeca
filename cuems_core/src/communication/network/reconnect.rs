/// Dial retry with exponential backoff
///
/// Used where a peer is expected to appear later, e.g. a replier dialing a
/// requester that only listens while a request is in flight. The bus hub itself
/// never reconnects: a failed dial there is a startup error.
use crate::error::CuemsResult;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Backoff policy for repeated dial attempts
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// 0 = retry forever
    pub max_retries: usize,
    /// Spread retries of many peers by ±20%
    pub jitter: bool,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            multiplier: BACKOFF_MULTIPLIER,
            max_retries: 0,
            jitter: true,
        }
    }
}

impl ReconnectStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short, bounded retries for tests
    pub fn testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 1.5,
            max_retries: 3,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (attempt 0 is the first try, no delay)
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi((attempt - 1).min(i32::MAX as usize) as i32);
        let capped =
            Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64).min(self.max_backoff);

        if self.jitter {
            use std::collections::hash_map::RandomState;
            use std::hash::BuildHasher;

            let hash_value = RandomState::new().hash_one(attempt);
            let jitter_factor = 0.8 + (hash_value % 40) as f64 / 100.0;
            Duration::from_millis((capped.as_millis() as f64 * jitter_factor) as u64)
        } else {
            capped
        }
    }

    pub fn should_retry(&self, attempt: usize) -> bool {
        self.max_retries == 0 || attempt < self.max_retries
    }

    /// Run `connect` until it succeeds or retries are exhausted; the last error is returned
    pub async fn retry<T, F, Fut>(&self, what: &str, mut connect: F) -> CuemsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CuemsResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match connect().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !self.should_retry(attempt) {
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        "{} failed (attempt {}): {}, retrying in {:?}",
                        what, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
