use std::future::Future;
use std::time::Duration;

use tracing::warn;

use common::{Config, Error, Result};

/// Bounded timeout plus capped exponential backoff for exchange calls.
///
/// Only errors with [`Error::is_transient`] are retried; a timeout counts as
/// transient. Everything else is returned on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.exchange_timeout_secs),
            max_attempts: cfg.exchange_max_retries.max(1),
            ..Self::default()
        }
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.base_delay;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(Error::ExchangeTransient(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                ))),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(op, attempt, error = %e, backoff = ?backoff, "Transient exchange error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
