use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{CapabilitiesConfig, ChannelConfig};
use crate::error::{CapabilityRole, PilotError, Result};

/// Bounded retry with exponential backoff and an optional per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CapabilitiesConfig::default())
    }
}

impl From<&CapabilitiesConfig> for RetryPolicy {
    fn from(config: &CapabilitiesConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            attempt_timeout: Some(config.timeout()),
        }
    }
}

impl From<&ChannelConfig> for RetryPolicy {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts.max(1),
            initial_backoff: config.reconnect_backoff(),
            max_backoff: config.reconnect_backoff() * 8,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no timeout. Used by tests and when retries are handled elsewhere.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            attempt_timeout: None,
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run a capability call under this policy.
    ///
    /// Timeouts become [`PilotError::CapabilityTimeout`]. Only errors for which
    /// [`PilotError::is_transient`] holds are retried.
    pub async fn run<T, F, Fut>(&self, role: CapabilityRole, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(PilotError::CapabilityTimeout { role, after: limit }),
                },
                None => call().await,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(%role, attempt, error = %e, "Capability call failed, retrying");
                    debug!(delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
