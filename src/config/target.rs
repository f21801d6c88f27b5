//! Target descriptors and credential references.
//!
//! A descriptor never holds credential material, only a reference to where it
//! lives (an environment variable, a key file, the SSH agent). The material is
//! resolved into a [`Credential`] right before connecting, and stays in a
//! [`SecretString`] until it is handed to the SSH library.

use std::fmt;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};

/// Where the credential for a target comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Password read from the named environment variable.
    Password { env: String },
    /// Private key file, with an optional passphrase environment variable.
    KeyFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase_env: Option<String>,
    },
    /// Keys offered by a running SSH agent.
    Agent,
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { env } => write!(f, "password from ${}", env),
            Self::KeyFile { path, .. } => write!(f, "key file {}", path.display()),
            Self::Agent => write!(f, "ssh-agent"),
        }
    }
}

/// Resolved credential material.
pub enum Credential {
    Password(SecretString),
    KeyFile {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    Agent,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Credential::Password([REDACTED])"),
            Self::KeyFile { path, .. } => write!(f, "Credential::KeyFile({})", path.display()),
            Self::Agent => write!(f, "Credential::Agent"),
        }
    }
}

/// Resolves a [`CredentialRef`] into credential material.
///
/// Credential storage lives outside the engine; implement this to plug in a
/// vault or keychain.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, reference: &CredentialRef) -> Result<Credential>;
}

/// Reads passwords and passphrases from process environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialResolver;

impl CredentialResolver for EnvCredentialResolver {
    fn resolve(&self, reference: &CredentialRef) -> Result<Credential> {
        match reference {
            CredentialRef::Password { env } => std::env::var(env)
                .map(|value| Credential::Password(SecretString::from(value)))
                .map_err(|_| {
                    PilotError::Credential(format!("environment variable {} is not set", env))
                }),
            CredentialRef::KeyFile {
                path,
                passphrase_env,
            } => {
                let passphrase = match passphrase_env {
                    Some(env) => Some(std::env::var(env).map(SecretString::from).map_err(
                        |_| PilotError::Credential(format!("environment variable {} is not set", env)),
                    )?),
                    None => None,
                };
                Ok(Credential::KeyFile {
                    path: path.clone(),
                    passphrase,
                })
            }
            CredentialRef::Agent => Ok(Credential::Agent),
        }
    }
}

/// Fully specified connection target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: CredentialRef,
    /// Expected SHA-256 host key fingerprint (hex). When set, a mismatch aborts the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl TargetDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Partially specified target, one per configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "user")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl TargetSpec {
    /// Field-by-field overlay: values set on `self` win over `lower`.
    pub fn over(&self, lower: &TargetSpec) -> TargetSpec {
        TargetSpec {
            host: self.host.clone().or_else(|| lower.host.clone()),
            port: self.port.or(lower.port),
            username: self.username.clone().or_else(|| lower.username.clone()),
            credential: self.credential.clone().or_else(|| lower.credential.clone()),
            host_key_fingerprint: self
                .host_key_fingerprint
                .clone()
                .or_else(|| lower.host_key_fingerprint.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TargetSpec::default()
    }

    /// Parse `host`, `host:port` or `[v6addr]:port` given on the command line.
    pub fn from_address(address: &str) -> Result<Self> {
        let invalid = || {
            PilotError::invalid_config(vec![format!("invalid target address {:?}", address)])
        };
        let address = address.trim();
        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match address.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host, Some(port)),
                // bare IPv6 address
                Some(_) => (address, None),
                None => (address, None),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self {
            host: Some(host.to_string()),
            port,
            ..Default::default()
        })
    }
}
