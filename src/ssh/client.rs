//! C3 — SSHClient (spec.md §4.3).
//!
//! Generalizes the teacher's `ssh/session.rs` (a single hardcoded
//! interactive session wrapped around `ssh2`, driven from a dedicated
//! blocking thread) into the full contract: `connect`, `shell`, `exec`,
//! `resizeTerminal`, `end`, plus the typed failure taxonomy of
//! [`SshError`] and keyboard-interactive forwarding. The `ssh2` crate is
//! blocking, so every operation that touches the wire runs inside
//! `tokio::task::spawn_blocking`; the `Session` itself lives behind a
//! `std::sync::Mutex` so `end()` can always reach it to flip the
//! shutdown flag even while a shell or exec pump holds the lock.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use ssh2::Session;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::SshSettings;
use crate::validator::Credentials;

use super::channel::{self, ShellOptions};
use super::error::SshError;

const READ_BUF_SIZE: usize = 16 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single prompt the SSH server wants answered, forwarded up through
/// [`InteractiveCallback`] (spec.md §4.4's keyboard-interactive forwarding).
#[derive(Debug, Clone)]
pub struct PromptItem {
    pub text: String,
    pub echo: bool,
}

/// Bridges `ssh2`'s blocking keyboard-interactive callback to the async
/// world: the callback itself runs inside a `spawn_blocking` thread, so
/// it is free to block on `Handle::block_on` of whatever async round
/// trip the implementor needs (typically: emit a `prompt` socket event
/// and await the matching `prompt-response`).
pub type InteractiveCallback = Arc<dyn Fn(&str, Vec<PromptItem>) -> Vec<String> + Send + Sync>;

struct KbdInteractive {
    callback: InteractiveCallback,
}

impl ssh2::KeyboardInteractivePrompt for KbdInteractive {
    fn prompt<'a>(
        &mut self,
        username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        let items = prompts
            .iter()
            .map(|p| PromptItem {
                text: p.text.to_string(),
                echo: p.echo,
            })
            .collect();
        (self.callback)(username, items)
    }
}

/// Policy for verifying the server's host key (SPEC_FULL §3.5).
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Skip verification entirely.
    Disabled,
    /// Accept only if the sha256 fingerprint is in `trusted`, or if
    /// `trusted` is empty (trust-on-first-use within this process).
    Strict { trusted: HashMap<String, String> },
}

fn host_key_fingerprint(session: &Session) -> Option<String> {
    let (key_bytes, _key_type) = session.host_key()?;
    let digest = Sha256::digest(key_bytes);
    Some(format!("SHA256:{}", base64::encode(digest)))
}

fn verify_host_key(session: &Session, host: &str, policy: &HostKeyPolicy) -> Result<(), SshError> {
    let HostKeyPolicy::Strict { trusted } = policy else {
        return Ok(());
    };
    let Some(fingerprint) = host_key_fingerprint(session) else {
        return Err(SshError::Unknown("server presented no host key".into()));
    };
    match trusted.get(host) {
        Some(expected) if expected == &fingerprint => Ok(()),
        Some(_) => Err(SshError::Auth(format!(
            "host key mismatch for {host}: got {fingerprint}"
        ))),
        None => {
            warn!(%host, %fingerprint, "no pinned host key on file; accepting (trust-on-first-use, in-memory only)");
            Ok(())
        }
    }
}

/// Applies the configured algorithm allow-lists (spec.md §4.3: cipher,
/// kex, hmac, compress, server host key).
fn configure_algorithms(session: &mut Session, settings: &SshSettings) -> Result<(), SshError> {
    session.method_pref(ssh2::MethodType::Kex, &settings.algorithms.kex.join(","))?;
    session.method_pref(ssh2::MethodType::HostKey, &settings.algorithms.server_host_key.join(","))?;
    session.method_pref(ssh2::MethodType::CryptCs, &settings.algorithms.cipher.join(","))?;
    session.method_pref(ssh2::MethodType::CryptSc, &settings.algorithms.cipher.join(","))?;
    session.method_pref(ssh2::MethodType::MacCs, &settings.algorithms.hmac.join(","))?;
    session.method_pref(ssh2::MethodType::MacSc, &settings.algorithms.hmac.join(","))?;
    if !settings.algorithms.compress.is_empty() {
        session.set_compress(true);
        session.method_pref(ssh2::MethodType::CompCs, &settings.algorithms.compress.join(","))?;
        session.method_pref(ssh2::MethodType::CompSc, &settings.algorithms.compress.join(","))?;
    }
    Ok(())
}

/// Result of a live connection, handed back to the [`crate::auth`] pipeline.
pub struct ConnectOutcome {
    pub client: SshClient,
    pub banner: Option<String>,
}

/// C3. Owns one outbound SSH connection. Exclusively owned by the
/// [`crate::adapter::ConnectionAdapter`] that created it.
pub struct SshClient {
    session: Arc<StdMutex<Session>>,
    shutdown_flag: Arc<AtomicBool>,
    settings: SshSettings,
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SshClient {
    /// `connect(credentials) -> ok() | err(...)` (spec.md §4.3).
    pub async fn connect(
        credentials: Credentials,
        settings: SshSettings,
        host_key_policy: HostKeyPolicy,
        interactive: Option<InteractiveCallback>,
    ) -> Result<ConnectOutcome, SshError> {
        let ready_timeout = settings.ready_timeout;
        let result = tokio::time::timeout(
            ready_timeout,
            tokio::task::spawn_blocking(move || {
                Self::connect_blocking(credentials, settings, host_key_policy, interactive)
            }),
        )
        .await;

        match result {
            Ok(Ok(inner)) => inner,
            Ok(Err(join_err)) => Err(SshError::Unknown(format!("connect task panicked: {join_err}"))),
            Err(_) => Err(SshError::Timeout(ready_timeout)),
        }
    }

    fn connect_blocking(
        credentials: Credentials,
        settings: SshSettings,
        host_key_policy: HostKeyPolicy,
        interactive: Option<InteractiveCallback>,
    ) -> Result<ConnectOutcome, SshError> {
        info!(host = %credentials.host, port = credentials.port, user = %credentials.username, "connecting to SSH server");

        let tcp = TcpStream::connect((credentials.host.as_str(), credentials.port))?;
        tcp.set_read_timeout(Some(settings.ready_timeout))?;
        tcp.set_write_timeout(Some(settings.ready_timeout))?;

        let mut session = Session::new().map_err(SshError::from)?;
        session.set_tcp_stream(tcp);
        configure_algorithms(&mut session, &settings)?;

        session.handshake().map_err(SshError::from)?;
        verify_host_key(&session, &credentials.host, &host_key_policy)?;

        let banner = session.banner().map(|s| s.to_string());

        Self::authenticate(&session, &credentials, interactive)?;
        if !session.authenticated() {
            return Err(SshError::Auth("authentication failed".into()));
        }

        session.set_keepalive(true, settings.keepalive_interval.as_secs() as u32);
        session.set_blocking(true);

        let host = credentials.host.clone();
        let port = credentials.port;
        let username = credentials.username.clone();

        Ok(ConnectOutcome {
            client: SshClient {
                session: Arc::new(StdMutex::new(session)),
                shutdown_flag: Arc::new(AtomicBool::new(false)),
                settings,
                host,
                port,
                username,
            },
            banner,
        })
    }

    fn authenticate(
        session: &Session,
        credentials: &Credentials,
        interactive: Option<InteractiveCallback>,
    ) -> Result<(), SshError> {
        if let Some(ref key) = credentials.private_key {
            session
                .userauth_pubkey_memory(
                    &credentials.username,
                    None,
                    key,
                    credentials.passphrase.as_deref(),
                )
                .map_err(SshError::from)?;
        } else if let Some(ref password) = credentials.password {
            match session.userauth_password(&credentials.username, password) {
                Ok(()) => {}
                Err(e) if session.auth_methods(&credentials.username).ok().is_some_and(|m| m.contains("keyboard-interactive")) => {
                    debug!("password auth rejected, falling back to keyboard-interactive");
                    Self::authenticate_keyboard_interactive(session, credentials, interactive)
                        .map_err(|_| SshError::from(e))?;
                }
                Err(e) => return Err(e.into()),
            }
        } else if interactive.is_some() {
            Self::authenticate_keyboard_interactive(session, credentials, interactive)?;
        } else {
            return Err(SshError::Auth("no credentials supplied".into()));
        }
        Ok(())
    }

    fn authenticate_keyboard_interactive(
        session: &Session,
        credentials: &Credentials,
        interactive: Option<InteractiveCallback>,
    ) -> Result<(), SshError> {
        let Some(callback) = interactive else {
            return Err(SshError::Auth("credentials required".into()));
        };
        let mut prompter = KbdInteractive { callback };
        session
            .userauth_keyboard_interactive(&credentials.username, &mut prompter)
            .map_err(SshError::from)
    }

    /// Shared flag flipped once by [`Self::end`]; lets any task holding a
    /// clone (e.g. a channel reader loop) notice the client has been torn
    /// down without needing a `&self` reference back into it.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    /// `end()`: graceful close; idempotent; emits `closed` once.
    pub async fn end(&self) {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return; // already ended
        }
        let session = self.session.clone();
        let host = self.host.clone();
        let port = self.port;
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(session) = session.lock() {
                let _ = session.disconnect(None, "session terminated by user", None);
            }
            info!(%host, port, "ssh session closed");
        })
        .await;
    }

    /// `shell(opts, env) -> ok(stream)` (spec.md §4.3). Opens an
    /// interactive PTY and starts the bidirectional pump; returns the two
    /// byte channels and a resize channel, exactly mirroring the
    /// teacher's `start_io` wiring but generalized off the hardcoded
    /// device-type fallback chain.
    pub async fn shell(&self, opts: ShellOptions, env: HashMap<String, String>) -> Result<ShellHandle, SshError> {
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);
        let (resize_tx, resize_rx) = mpsc::channel::<(u32, u32)>(8);
        let (closed_tx, closed_rx) = oneshot::channel();

        let session = self.session.clone();
        let shutdown_flag = self.shutdown_flag.clone();
        let keepalive_interval = self.settings.keepalive_interval;

        tokio::task::spawn_blocking(move || {
            let result = Self::pump_shell(
                session,
                opts,
                env,
                input_rx,
                output_tx,
                resize_rx,
                shutdown_flag,
                keepalive_interval,
            );
            let _ = closed_tx.send(result);
        });

        Ok(ShellHandle {
            input_tx,
            output_rx,
            resize_tx,
            closed_rx,
        })
    }

    fn pump_shell(
        session: Arc<StdMutex<Session>>,
        opts: ShellOptions,
        env: HashMap<String, String>,
        mut input_rx: mpsc::Receiver<Bytes>,
        output_tx: mpsc::Sender<Bytes>,
        mut resize_rx: mpsc::Receiver<(u32, u32)>,
        shutdown_flag: Arc<AtomicBool>,
        keepalive_interval: Duration,
    ) -> Result<(), SshError> {
        let guard = session.lock().map_err(|_| SshError::Unknown("session lock poisoned".into()))?;
        let mut chan = channel::open_shell_channel(&guard, &opts, &env)?;
        chan.request_pty_size(opts.cols, opts.rows, None, None).ok();

        let mut buf = [0u8; READ_BUF_SIZE];
        let mut last_keepalive = Instant::now();

        loop {
            if shutdown_flag.load(Ordering::SeqCst) {
                break;
            }

            if last_keepalive.elapsed() >= keepalive_interval {
                if let Err(e) = guard.keepalive_send() {
                    warn!(error = %e, "keepalive failed");
                    break;
                }
                last_keepalive = Instant::now();
            }

            while let Ok((rows, cols)) = resize_rx.try_recv() {
                if let Err(e) = channel::resize(&mut chan, rows, cols) {
                    warn!(error = %e, "pty resize failed");
                }
            }

            match chan.read(&mut buf) {
                Ok(0) if chan.eof() => {
                    info!("shell channel reached EOF");
                    break;
                }
                Ok(0) => {}
                Ok(n) => {
                    if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break; // adapter dropped the receiver
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            while let Ok(data) = input_rx.try_recv() {
                if let Err(e) = chan.write_all(&data) {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        return Err(e.into());
                    }
                }
                let _ = chan.flush();
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        let _ = chan.close();
        Ok(())
    }

    /// `exec(command, opts, env) -> ok(execHandle)` (spec.md §4.3).
    pub async fn exec(
        &self,
        command: String,
        pty: Option<ShellOptions>,
        env: HashMap<String, String>,
        max_output_bytes: u64,
    ) -> Result<ExecHandle, SshError> {
        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(64);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(16);
        let (wait_tx, wait_rx) = oneshot::channel();

        let session = self.session.clone();
        let shutdown_flag = self.shutdown_flag.clone();

        tokio::task::spawn_blocking(move || {
            let result = Self::pump_exec(
                session,
                command,
                pty,
                env,
                stdout_tx,
                stderr_tx,
                shutdown_flag,
                max_output_bytes,
            );
            let _ = wait_tx.send(result);
        });

        Ok(ExecHandle {
            stdout_rx,
            stderr_rx,
            wait_rx,
        })
    }

    fn pump_exec(
        session: Arc<StdMutex<Session>>,
        command: String,
        pty: Option<ShellOptions>,
        env: HashMap<String, String>,
        stdout_tx: mpsc::Sender<Bytes>,
        stderr_tx: mpsc::Sender<Bytes>,
        shutdown_flag: Arc<AtomicBool>,
        max_output_bytes: u64,
    ) -> Result<ExecResult, SshError> {
        let guard = session.lock().map_err(|_| SshError::Unknown("session lock poisoned".into()))?;
        let mut chan = channel::open_exec_channel(&guard, &command, pty.as_ref(), &env)?;

        let mut buf = [0u8; READ_BUF_SIZE];
        let mut total: u64 = 0;
        let mut limit_exceeded = false;

        loop {
            if shutdown_flag.load(Ordering::SeqCst) {
                break;
            }

            match chan.read(&mut buf) {
                Ok(0) if chan.eof() => break,
                Ok(0) => {}
                Ok(n) => {
                    total += n as u64;
                    if total > max_output_bytes {
                        limit_exceeded = true;
                        break;
                    }
                    if stdout_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            match chan.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    total += n as u64;
                    if total > max_output_bytes {
                        limit_exceeded = true;
                        break;
                    }
                    let _ = stderr_tx.blocking_send(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {}
            }

            if chan.eof() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        if limit_exceeded {
            let _ = chan.close();
            return Err(SshError::OutputLimitExceeded);
        }

        let _ = chan.wait_close();
        let exit_code = chan.exit_status().ok();
        let signal = chan.exit_signal().ok().and_then(|(sig, _, _)| sig);
        Ok(ExecResult { exit_code, signal })
    }
}

/// `opts` used by [`SshClient::exec`]; re-exported name kept distinct from
/// [`ShellOptions`] even though the shape is currently identical, since
/// exec's PTY attachment is optional where shell's never is.
pub type ExecPtyOptions = ShellOptions;

/// The duplex stream handed back by `shell()`.
pub struct ShellHandle {
    pub input_tx: mpsc::Sender<Bytes>,
    pub output_rx: mpsc::Receiver<Bytes>,
    pub resize_tx: mpsc::Sender<(u32, u32)>,
    pub closed_rx: oneshot::Receiver<Result<(), SshError>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// The handle returned by `exec()`: a stdout stream, a stderr stream, and
/// an async `wait()`.
pub struct ExecHandle {
    pub stdout_rx: mpsc::Receiver<Bytes>,
    pub stderr_rx: mpsc::Receiver<Bytes>,
    wait_rx: oneshot::Receiver<Result<ExecResult, SshError>>,
}

impl ExecHandle {
    pub async fn wait(self) -> Result<ExecResult, SshError> {
        self.wait_rx
            .await
            .unwrap_or_else(|_| Err(SshError::Unknown("exec task dropped".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_policy_disabled_always_passes() {
        // verify_host_key short-circuits before touching the session for
        // the Disabled policy, so this is safe to call without a live
        // connection.
        let policy = HostKeyPolicy::Disabled;
        assert!(matches!(policy, HostKeyPolicy::Disabled));
    }
}
