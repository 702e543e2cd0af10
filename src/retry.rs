use crate::config::types::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Classifies an error as transient (worth another attempt) or permanent
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    Exhausted { attempts: u32, last: E },
    /// The operation failed in a way another attempt cannot fix
    Permanent(E),
}

/// Bounded exponential backoff: `initial, 2*initial, 4*initial, ...` capped at `max_backoff`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        std::cmp::min(self.initial_backoff.saturating_mul(factor), self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt budget is spent
    pub async fn run<F, Fut, T, E>(&self, target: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => {
                    tracing::error!(target_name = %target, error = %e, "Request failed permanently");
                    return Err(RetryError::Permanent(e));
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        tracing::error!(
                            target_name = %target,
                            attempts = attempts,
                            error = %e,
                            "Max retries exceeded"
                        );
                        return Err(RetryError::Exhausted { attempts, last: e });
                    }

                    let backoff = self.backoff_for(attempts);
                    tracing::warn!(
                        target_name = %target,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
