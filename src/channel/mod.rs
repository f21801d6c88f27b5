//! Remote command channel.
//!
//! One authenticated session per attack session, running one command at a
//! time. [`SshConnector`] is the production implementation;
//! [`ReconnectingChannel`] adds bounded reconnection on transient failures.

mod reconnect;
mod ssh;

pub use reconnect::ReconnectingChannel;
pub use ssh::{SshChannel, SshConnector};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TargetDescriptor;
use crate::error::Result;

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command timed out before reporting a status.
    pub exit_status: Option<i32>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub timed_out: bool,
    /// Output exceeded the capture limit and was cut.
    #[serde(default)]
    pub truncated: bool,
    /// Times the command was started again on a new session after the
    /// previous one dropped. Earlier runs may have partially executed.
    #[serde(default)]
    pub reruns: u32,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_status == Some(0)
    }
}

#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run one command under `timeout`. A timeout is a result, not an error.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Close the session and abort any in-flight command. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteChannel>>;
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
