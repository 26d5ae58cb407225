//! Channel setup helpers: opening a PTY shell channel or a non-interactive
//! exec channel, applying the allow-listed environment along the way.
//! Generalizes the teacher's single hardcoded "standard/linux/cisco"
//! fallback chain (`ssh/session.rs`) into one path parameterized by
//! `ShellOptions`, since this gateway targets arbitrary hosts rather than
//! a fixed set of network-device shells.

use std::collections::HashMap;

use ssh2::{Channel, Session};
use tracing::{debug, warn};

use super::error::SshError;

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub term: String,
    pub rows: u32,
    pub cols: u32,
}

fn apply_environment(channel: &mut Channel, env: &HashMap<String, String>) {
    for (k, v) in env {
        // Most sshd configurations reject all but an `AcceptEnv`-listed
        // subset; a failure here is expected and not fatal to the
        // session, so it's logged at debug rather than surfaced.
        if let Err(e) = channel.setenv(k, v) {
            debug!(key = %k, error = %e, "server rejected environment variable");
        }
    }
}

/// Opens an interactive PTY shell channel with the given terminal
/// geometry and allow-listed environment (spec.md §4.3 `shell()`).
pub fn open_shell_channel(
    session: &Session,
    opts: &ShellOptions,
    env: &HashMap<String, String>,
) -> Result<Channel, SshError> {
    let mut channel = session.channel_session()?;
    apply_environment(&mut channel, env);
    channel.request_pty(&opts.term, None, Some((opts.cols, opts.rows, 0, 0)))?;
    channel.shell()?;
    Ok(channel)
}

/// Opens a non-interactive exec channel, optionally with a PTY attached
/// (spec.md §4.5 `exec{pty?}`).
pub fn open_exec_channel(
    session: &Session,
    command: &str,
    pty: Option<&ShellOptions>,
    env: &HashMap<String, String>,
) -> Result<Channel, SshError> {
    let mut channel = session.channel_session()?;
    apply_environment(&mut channel, env);
    if let Some(opts) = pty {
        channel.request_pty(&opts.term, None, Some((opts.cols, opts.rows, 0, 0)))?;
    }
    channel.exec(command)?;
    Ok(channel)
}

/// Sends a window-change request for an already-open PTY channel.
/// No-op (per spec.md §4.3 `resizeTerminal`) is the caller's job to
/// enforce when no shell is open; this function assumes one is.
pub fn resize(channel: &mut Channel, rows: u32, cols: u32) -> Result<(), SshError> {
    channel
        .request_pty_size(cols, rows, None, None)
        .map_err(SshError::from)
        .inspect_err(|e| warn!(error = %e, "pty resize failed"))
}
