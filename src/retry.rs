use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Errors that may be worth retrying. Network failures qualify; HTTP status
/// errors and other definitive failures do not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Runs fallible operations with exponential backoff. Only errors reporting
/// themselves as retryable are attempted again; everything else propagates
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut action: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        let mut backoff = self.initial_backoff;

        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        error!(
                            "Operation '{operation}' failed after {} retries: {e}",
                            self.max_retries
                        );
                        return Err(e);
                    }
                    warn!(
                        "Operation '{operation}' failed (attempt {attempt}/{}), retrying in {:?}: {e}",
                        self.max_retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
