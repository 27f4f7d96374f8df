use crate::ChatError;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff used by the realtime channel client to reconnect.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RecoveryManager {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`
    /// plus up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = std::cmp::min(self.base_delay * 2u32.pow(exponent), self.max_delay);

        if !self.jitter {
            return delay;
        }
        let spread = (delay.as_millis() as u64) / 5;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Runs `operation` until it succeeds, fails permanently, or runs out of
    /// attempts.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, ChatError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, ChatError>> + Send,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempts >= self.max_attempts {
                        return Err(ChatError::RecoveryFailed {
                            attempts,
                            message: e.to_string(),
                        });
                    }

                    let delay = self.delay_for(attempts);
                    warn!(
                        "Operation failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempts, self.max_attempts, e, delay
                    );

                    sleep(delay).await;
                }
            }
        }
    }
}
