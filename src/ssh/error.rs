//! SSH-layer failure taxonomy (spec.md §4.3): classified from whatever
//! the underlying `ssh2`/`std::io` error actually was, so nothing above
//! this module ever has to match on `ssh2::ErrorCode` itself.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("output limit exceeded")]
    OutputLimitExceeded,
    #[error("{0}")]
    Unknown(String),
}

impl From<std::io::Error> for SshError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | AddrNotAvailable | BrokenPipe => SshError::Network(e.to_string()),
            TimedOut => SshError::Timeout(Duration::from_secs(0)),
            _ => SshError::Unknown(e.to_string()),
        }
    }
}

impl From<ssh2::Error> for SshError {
    fn from(e: ssh2::Error) -> Self {
        use ssh2::ErrorCode;
        let msg = e.message().to_string();
        match e.code() {
            ErrorCode::Session(-18) /* AUTHENTICATION_FAILED */
            | ErrorCode::Session(-16) /* PUBLICKEY_UNVERIFIED */
            | ErrorCode::Session(-29) /* AUTH_METHOD_UNAVAILABLE */ => SshError::Auth(msg),
            ErrorCode::Session(-1) /* SOCKET_NONE */
            | ErrorCode::Session(-7) /* SOCKET_DISCONNECT */
            | ErrorCode::Session(-43) /* BANNER_RECV */ => SshError::Network(msg),
            _ if msg.to_lowercase().contains("authentication")
                || msg.to_lowercase().contains("passphrase") =>
            {
                SshError::Auth(msg)
            }
            _ if msg.to_lowercase().contains("timed out") => SshError::Timeout(Duration::from_secs(0)),
            _ => SshError::Unknown(msg),
        }
    }
}
