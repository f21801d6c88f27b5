use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::{ChannelConnector, CommandOutput, RemoteChannel};
use crate::capability::RetryPolicy;
use crate::config::TargetDescriptor;
use crate::error::{ChannelError, PilotError, Result};

/// Channel that re-establishes its session after transient failures.
///
/// Authentication and host key failures are permanent and surface
/// immediately. A command interrupted by a transient failure is run again on
/// the new session, at most `policy.max_attempts` times in total.
pub struct ReconnectingChannel {
    connector: Arc<dyn ChannelConnector>,
    target: TargetDescriptor,
    policy: RetryPolicy,
    inner: Mutex<Option<Arc<dyn RemoteChannel>>>,
    closed: AtomicBool,
}

impl ReconnectingChannel {
    /// Connect with retries. Fails only after the policy is exhausted or on a
    /// permanent error.
    pub async fn establish(
        connector: Arc<dyn ChannelConnector>,
        target: TargetDescriptor,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let channel = Self {
            connector,
            target,
            policy,
            inner: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        let session = channel.connect_with_retry().await?;
        *channel.inner.lock() = Some(Arc::from(session));
        Ok(channel)
    }

    async fn connect_with_retry(&self) -> Result<Box<dyn RemoteChannel>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(&self.target).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(target = %self.target, attempt, error = %e, "Connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl RemoteChannel for ReconnectingChannel {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut attempt = 0;
        loop {
            if self.is_closed() {
                return Err(ChannelError::Closed.into());
            }
            attempt += 1;

            let current = self.inner.lock().clone();
            let session = match current {
                Some(session) => session,
                None => {
                    let session: Arc<dyn RemoteChannel> =
                        Arc::from(self.connect_with_retry().await?);
                    info!(target = %self.target, "Session re-established");
                    *self.inner.lock() = Some(session.clone());
                    if self.is_closed() {
                        session.close().await;
                        return Err(ChannelError::Closed.into());
                    }
                    session
                }
            };

            match session.run(command, timeout).await {
                Ok(mut output) => {
                    output.reruns = attempt - 1;
                    if output.reruns > 0 {
                        warn!(target = %self.target, reruns = output.reruns, command, "Command ran again after reconnect");
                    }
                    return Ok(output);
                }
                Err(e @ PilotError::Channel(_))
                    if e.is_transient()
                        && attempt < self.policy.max_attempts
                        && !self.is_closed() =>
                {
                    warn!(target = %self.target, attempt, error = %e, "Channel failed, reconnecting");
                    self.inner.lock().take();
                    session.close().await;
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.inner.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
