//! Crate-wide error taxonomy (SPEC_FULL §2, spec.md §7).
//!
//! Every boundary in the gateway converts whatever it catches into one of
//! these variants before it crosses a task/component boundary. Nothing
//! downstream of a component boundary should see a raw `ssh2::Error`,
//! `std::io::Error`, etc.

use std::fmt;

/// The seven error kinds named in spec.md §7. Each carries enough context
/// to log usefully once, and to pick the right HTTP status / socket event
/// at the boundary that produced it.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed input from HTTP or socket. Never logged at error level;
    /// reported straight back to the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// SSH rejected credentials, or a keyboard-interactive round was
    /// rejected by the server.
    #[error("auth error: {0}")]
    Auth(String),

    /// Transport-level failure: refused, unreachable, reset, DNS.
    #[error("network error: {0}")]
    Network(String),

    /// A bounded wait (readyTimeout, prompt timeout, exec timeout) expired.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Unusable configuration. Only produced at startup; the process exits
    /// with code 1 when this reaches `main`.
    #[error("config error: {0}")]
    Config(String),

    /// A valid-looking request blocked by policy (quota, cap, allowlist).
    #[error("policy error: {0}")]
    Policy(String),

    /// Everything else. Context is logged with sensitive fields masked;
    /// callers get a generic message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// True for the two transport-level kinds that spec.md §7 says are
    /// "never retried by the core".
    pub fn is_non_retryable_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Maps an error to the HTTP status the router's pre-flight check
    /// should respond with (spec.md §4.6).
    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Policy(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<crate::ssh::SshError> for GatewayError {
    fn from(e: crate::ssh::SshError) -> Self {
        use crate::ssh::SshError as S;
        match e {
            S::Auth(m) => GatewayError::Auth(m),
            S::Network(m) => GatewayError::Network(m),
            S::Timeout(d) => GatewayError::Timeout(d),
            S::OutputLimitExceeded => GatewayError::Policy("output limit exceeded".into()),
            S::Unknown(m) => GatewayError::Internal(m),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Network(e.to_string())
    }
}
