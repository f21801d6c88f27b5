//! Dual content-safety boundary around the remote channel.
//!
//! - outbound: [`CommandPolicy`] screens every command before execution
//! - inbound: [`InjectionDetector`] neutralizes injection markers in output
//!   before it is shown to a reasoning capability
//!
//! Nothing a capability returns can loosen either check; the only switch is
//! the session's declared `allow_out_of_scope` acknowledgement.

mod inbound;
mod outbound;

pub use inbound::{
    InjectionDetector, InjectionMatch, InjectionPattern, InjectionSeverity, NeutralizeMode,
    Sanitized,
};
pub use outbound::{CommandPolicy, DenyRule, RuleKind, Verdict};

use crate::config::{EffectiveScope, GuardrailConfig};
use crate::error::Result;

/// Both checks, configured for one session.
#[derive(Debug, Clone, Default)]
pub struct Guardrail {
    policy: CommandPolicy,
    detector: InjectionDetector,
}

impl Guardrail {
    pub fn new(policy: CommandPolicy, detector: InjectionDetector) -> Self {
        Self { policy, detector }
    }

    pub fn from_config(config: &GuardrailConfig, scope: &EffectiveScope) -> Result<Self> {
        Ok(Self {
            policy: CommandPolicy::new(&config.deny_patterns, scope)?,
            detector: InjectionDetector::with_extra_patterns(
                config.neutralize,
                &config.injection_patterns,
            )?,
        })
    }

    pub fn check_command(&self, command: &str) -> Verdict {
        self.policy.check(command)
    }

    pub fn sanitize_output(&self, raw: &str) -> Sanitized {
        self.detector.sanitize(raw)
    }
}
