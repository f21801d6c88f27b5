//! SSH channel on top of libssh2.
//!
//! libssh2 is blocking, so every session operation runs on the blocking pool.
//! Reads are non-blocking polls so that timeouts and aborts are honored
//! between chunks.

use std::fmt::Write as _;
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use ssh2::{HashType, Session};
use tracing::{debug, info, warn};

use super::{ChannelConnector, CommandOutput, RemoteChannel};
use crate::config::{ChannelConfig, Credential, CredentialResolver, TargetDescriptor};
use crate::error::{ChannelError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 8192;

/// Opens SSH sessions, resolving credentials right before authentication.
pub struct SshConnector {
    config: ChannelConfig,
    credentials: Arc<dyn CredentialResolver>,
}

impl SshConnector {
    pub fn new(config: ChannelConfig, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            config,
            credentials,
        }
    }
}

#[async_trait]
impl ChannelConnector for SshConnector {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn RemoteChannel>> {
        let credential = self.credentials.resolve(&target.credential)?;
        let target = target.clone();
        let config = self.config.clone();
        let address = target.address();

        info!(target = %target, "Opening SSH session");
        let session = tokio::task::spawn_blocking(move || {
            connect_session(&target, &credential, &config)
        })
        .await
        .map_err(|e| ChannelError::Connect {
            address: address.clone(),
            message: format!("connect worker failed: {}", e),
        })??;

        Ok(Box::new(SshChannel {
            session: Arc::new(Mutex::new(Some(session))),
            abort: Arc::new(AtomicBool::new(false)),
            max_output_bytes: self.config.max_output_bytes,
            address,
        }))
    }
}

fn connect_session(
    target: &TargetDescriptor,
    credential: &Credential,
    config: &ChannelConfig,
) -> std::result::Result<Session, ChannelError> {
    let address = target.address();
    let connect_err = |message: String| ChannelError::Connect {
        address: address.clone(),
        message,
    };

    let socket = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("cannot resolve host: {}", e)))?
        .next()
        .ok_or_else(|| connect_err("host resolved to no addresses".into()))?;
    let tcp = TcpStream::connect_timeout(&socket, config.connect_timeout())
        .map_err(|e| connect_err(e.to_string()))?;

    let mut session = Session::new().map_err(|e| connect_err(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.connect_timeout().as_millis() as u32);
    session
        .handshake()
        .map_err(|e| connect_err(format!("handshake failed: {}", e)))?;

    if let Some(expected) = &target.host_key_fingerprint {
        let observed = host_key_sha256(&session).unwrap_or_else(|| "unknown".to_string());
        if !observed.eq_ignore_ascii_case(expected) {
            return Err(ChannelError::HostKeyMismatch {
                address,
                expected: expected.clone(),
                observed,
            });
        }
    }

    let username = target.username.as_str();
    let auth = match credential {
        Credential::Password(password) => {
            session.userauth_password(username, password.expose_secret())
        }
        Credential::KeyFile { path, passphrase } => session.userauth_pubkey_file(
            username,
            None,
            path,
            passphrase.as_ref().map(|p| p.expose_secret()),
        ),
        Credential::Agent => session.userauth_agent(username),
    };
    if let Err(e) = auth {
        debug!(error = %e, "SSH authentication rejected");
    }
    if !session.authenticated() {
        return Err(ChannelError::Authentication {
            address,
            username: target.username.clone(),
        });
    }

    if config.keepalive_secs > 0 {
        session.set_keepalive(true, config.keepalive_secs);
    }
    session.set_timeout(0);
    Ok(session)
}

fn host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(HashType::Sha256)?;
    let mut hex = String::with_capacity(hash.len() * 2);
    for byte in hash {
        let _ = write!(hex, "{:02x}", byte);
    }
    Some(hex)
}

/// One authenticated SSH session.
pub struct SshChannel {
    session: Arc<Mutex<Option<Session>>>,
    abort: Arc<AtomicBool>,
    max_output_bytes: usize,
    address: String,
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        if self.is_closed() {
            return Err(ChannelError::Closed.into());
        }
        let session = self.session.clone();
        let abort = self.abort.clone();
        let command = command.to_string();
        let max_output = self.max_output_bytes;

        let output = tokio::task::spawn_blocking(move || {
            let guard = session.lock();
            let session = guard.as_ref().ok_or(ChannelError::Closed)?;
            exec_blocking(session, &command, timeout, max_output, &abort)
        })
        .await
        .map_err(|e| ChannelError::Exec(format!("exec worker failed: {}", e)))??;

        debug!(
            address = %self.address,
            exit_status = ?output.exit_status,
            timed_out = output.timed_out,
            duration_ms = output.duration.as_millis() as u64,
            "Command finished"
        );
        Ok(output)
    }

    async fn close(&self) {
        if self.abort.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.clone();
        let address = self.address.clone();
        // Waits for an in-flight exec to observe the abort flag and release the lock.
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(session) = session.lock().take() {
                session.set_blocking(true);
                if let Err(e) = session.disconnect(None, "session finished", None) {
                    warn!(address = %address, error = %e, "SSH disconnect failed");
                }
            }
        })
        .await;
        info!(address = %self.address, "SSH session closed");
    }

    fn is_closed(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Capture buffer that keeps at most `limit` bytes and counts the rest.
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    fn finish(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.dropped > 0 {
            let _ = write!(text, "...[truncated {} bytes]", self.dropped);
        }
        (text, self.dropped > 0)
    }
}

fn exec_blocking(
    session: &Session,
    command: &str,
    timeout: Duration,
    max_output: usize,
    abort: &AtomicBool,
) -> std::result::Result<CommandOutput, ChannelError> {
    session.set_blocking(true);
    let mut channel = session
        .channel_session()
        .map_err(|e| ChannelError::Exec(e.to_string()))?;
    channel
        .exec(command)
        .map_err(|e| ChannelError::Exec(e.to_string()))?;
    session.set_blocking(false);

    let started = Instant::now();
    let mut stdout = Capture::new(max_output);
    let mut stderr = Capture::new(max_output);
    let mut timed_out = false;
    let mut aborted = false;
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                stdout.push(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                session.set_blocking(true);
                return Err(ChannelError::Exec(e.to_string()));
            }
        }
        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                stderr.push(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                session.set_blocking(true);
                return Err(ChannelError::Exec(e.to_string()));
            }
        }

        if channel.eof() && !progressed {
            break;
        }
        if abort.load(Ordering::SeqCst) {
            aborted = true;
            break;
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            break;
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    session.set_blocking(true);
    let duration = started.elapsed();
    if aborted || timed_out {
        let _ = channel.close();
    } else {
        let _ = channel.wait_close();
    }
    if aborted {
        return Err(ChannelError::Closed);
    }

    let exit_status = if timed_out {
        None
    } else {
        channel.exit_status().ok()
    };
    let (stdout, out_cut) = stdout.finish();
    let (stderr, err_cut) = stderr.finish();

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_status,
        duration,
        timed_out,
        truncated: out_cut || err_cut,
        reruns: 0,
    })
}
