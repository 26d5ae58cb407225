//! C4 — AuthPipeline (spec.md §4.4).
//!
//! No teacher equivalent exists: `ssh/session.rs` made one inline auth
//! call per connect. This generalizes that call's bounded-retry idiom
//! into the full 3-source priority list, keyboard-interactive
//! forwarding, and retry-cap rules spec.md §4.4 describes.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Config, FileUser};
use crate::error::GatewayError;
use crate::session_store::AuthMethod;
use crate::ssh::client::{ConnectOutcome, HostKeyPolicy, InteractiveCallback, PromptItem};
use crate::ssh::{SshClient, SshError};
use crate::validator::{validate_credential_format, CredentialInput, Credentials};

const DEFAULT_RETRY_CAP: u32 = 3;
/// spec.md §4.4's interactive-prompt timeout; also the window
/// `ConnectionAdapter` registers auth prompts under in its
/// `PromptTracker`, so the two stay in lockstep.
pub(crate) const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPipelineState {
    Idle,
    Gathering,
    Attempting,
    AwaitingInteractive,
    Authenticated,
    Failed,
}

/// One labeled field in an interactive prompt form (a plain password
/// prompt has exactly one; keyboard-interactive may have several).
#[derive(Debug, Clone)]
pub struct PromptField {
    pub label: String,
    pub echo: bool,
}

/// Sent to whatever owns the client socket (the adapter) so it can emit
/// the typed `prompt` event and wait for `prompt-response`.
pub struct PromptRequest {
    pub prompt_type: &'static str, // "password" | "keyboard-interactive"
    pub title: String,
    pub fields: Vec<PromptField>,
    pub respond_to: oneshot::Sender<PromptReply>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptReply {
    pub dismissed: bool,
    pub inputs: Vec<String>,
}

pub type PromptSender = mpsc::Sender<PromptRequest>;

#[derive(Debug, Clone)]
pub struct AuthResult {
    pub username: String,
    pub method: AuthMethod,
    /// Retained only when `options.allowReplay` is set; otherwise always
    /// `None` by the time this leaves the pipeline (spec.md §4.4).
    pub replayable_password: Option<String>,
}

/// Where session-attached credentials (source 2 of spec.md §4.4) came
/// from, so [`AuthResult::method`] can be set correctly.
#[derive(Debug, Clone)]
pub struct SessionAttached {
    pub credentials: CredentialInput,
    pub method: AuthMethod,
}

pub struct AuthPipeline<'a> {
    config: &'a Config,
    retry_cap: u32,
}

impl<'a> AuthPipeline<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            retry_cap: DEFAULT_RETRY_CAP,
        }
    }

    /// Drives `SSHClient.connect` until success or terminal failure,
    /// probing sources in priority order: config default user, then
    /// session-attached credentials, then interactive prompting (unless
    /// `disableInteractiveAuth`).
    pub async fn authenticate(
        &self,
        host: String,
        port: u16,
        session_attached: Option<SessionAttached>,
        prompt_tx: Option<PromptSender>,
    ) -> Result<(AuthResult, ConnectOutcome), GatewayError> {
        let mut attempts = 0u32;
        let mut last_error: Option<GatewayError> = None;

        loop {
            let (credentials, method) = match self
                .gather(&session_attached, host.clone(), port, prompt_tx.as_ref(), attempts)
                .await
            {
                Ok(pair) => pair,
                Err(e) => return Err(e),
            };

            let interactive_cb = self.make_interactive_callback(prompt_tx.clone());

            let allow_replay = self.config.options.allow_replay;
            let replayable_password = if allow_replay { credentials.password.clone() } else { None };
            let username = credentials.username.clone();

            let ssh_settings = self.config.ssh.clone();
            let host_key_policy = self.host_key_policy();

            match SshClient::connect(credentials, ssh_settings, host_key_policy, interactive_cb).await {
                Ok(outcome) => {
                    info!(%username, ?method, "authentication succeeded");
                    return Ok((
                        AuthResult {
                            username,
                            method,
                            replayable_password,
                        },
                        outcome,
                    ));
                }
                Err(SshError::Auth(msg)) => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %msg, "auth attempt rejected");
                    last_error = Some(GatewayError::Auth(msg));
                    if attempts >= self.retry_cap || prompt_tx.is_none() || self.config.ssh.disable_interactive_auth {
                        break;
                    }
                    // loop again: next gather() call re-prompts interactively.
                }
                Err(e @ (SshError::Network(_) | SshError::Timeout(_))) => {
                    // spec.md §4.4: network/timeout errors are never retried.
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Auth("authentication failed".into())))
    }

    /// Source priority: (1) config default user, (2) session-attached,
    /// (3) interactive prompt. Sources 1 and 2 only apply on the first
    /// attempt — once the server has rejected a set of credentials,
    /// retrying with the same unchanged config/session credentials would
    /// just fail the same way, so later attempts always fall through to
    /// an interactive re-prompt.
    async fn gather(
        &self,
        session_attached: &Option<SessionAttached>,
        host: String,
        port: u16,
        prompt_tx: Option<&PromptSender>,
        attempts: u32,
    ) -> Result<(Credentials, AuthMethod), GatewayError> {
        if attempts == 0 {
            if let Some(creds) = self.config_default_credentials(host.clone(), port) {
                debug!("using config-provided default user credentials");
                return Ok((creds, AuthMethod::Basic));
            }

            if let Some(attached) = session_attached {
                let mut input = attached.credentials.clone();
                input.host.get_or_insert(host.clone());
                input.port.get_or_insert(port.to_string());
                if let Ok(creds) = validate_credential_format(input) {
                    debug!(method = ?attached.method, "using session-attached credentials");
                    return Ok((creds, attached.method));
                }
            }
        }

        if self.config.ssh.disable_interactive_auth {
            return Err(GatewayError::Auth("credentials required".into()));
        }

        let Some(tx) = prompt_tx else {
            return Err(GatewayError::Auth("credentials required".into()));
        };

        self.prompt_for_password(tx, host, port).await
    }

    fn config_default_credentials(&self, host: String, port: u16) -> Option<Credentials> {
        let user: &FileUser = &self.config.default_user;
        let username = user.name.clone()?;
        if user.password.is_none() && user.private_key.is_none() {
            return None;
        }
        Some(Credentials {
            username,
            host,
            port,
            password: user.password.clone(),
            private_key: user.private_key.clone(),
            passphrase: user.passphrase.clone(),
        })
    }

    async fn prompt_for_password(
        &self,
        tx: &PromptSender,
        host: String,
        port: u16,
    ) -> Result<(Credentials, AuthMethod), GatewayError> {
        let (respond_to, reply_rx) = oneshot::channel();
        let request = PromptRequest {
            prompt_type: "password",
            title: format!("Password for {host}"),
            fields: vec![
                PromptField { label: "username".into(), echo: true },
                PromptField { label: "password".into(), echo: false },
            ],
            respond_to,
        };
        tx.send(request)
            .await
            .map_err(|_| GatewayError::internal("prompt channel closed"))?;

        let reply = tokio::time::timeout(DEFAULT_PROMPT_TIMEOUT, reply_rx)
            .await
            .map_err(|_| GatewayError::Timeout(DEFAULT_PROMPT_TIMEOUT))?
            .map_err(|_| GatewayError::internal("prompt responder dropped"))?;

        if reply.dismissed || reply.inputs.len() < 2 {
            return Err(GatewayError::Auth("credentials required".into()));
        }

        let input = CredentialInput {
            username: Some(reply.inputs[0].clone()),
            host: Some(host),
            port: Some(port.to_string()),
            password: Some(reply.inputs[1].clone()),
            private_key: None,
            passphrase: None,
        };
        let creds = validate_credential_format(input).map_err(|errors| GatewayError::validation(errors.join("; ")))?;
        Ok((creds, AuthMethod::Interactive))
    }

    /// Builds the callback `SSHClient::connect` invokes when the server
    /// itself requests keyboard-interactive auth (distinct from the
    /// password-prompt path above: this round-trip happens *inside* the
    /// blocking connect call, mid-handshake).
    fn make_interactive_callback(&self, prompt_tx: Option<PromptSender>) -> Option<InteractiveCallback> {
        if self.config.ssh.disable_interactive_auth {
            return None;
        }
        let tx = prompt_tx?;
        let handle = tokio::runtime::Handle::current();
        Some(std::sync::Arc::new(move |_username: &str, prompts: Vec<PromptItem>| -> Vec<String> {
            let tx = tx.clone();
            let fields = prompts
                .iter()
                .map(|p| PromptField { label: p.text.clone(), echo: p.echo })
                .collect();
            handle.block_on(async move {
                let (respond_to, reply_rx) = oneshot::channel();
                let request = PromptRequest {
                    prompt_type: "keyboard-interactive",
                    title: "Authentication".to_string(),
                    fields,
                    respond_to,
                };
                if tx.send(request).await.is_err() {
                    return vec![String::new(); prompts.len()];
                }
                match tokio::time::timeout(DEFAULT_PROMPT_TIMEOUT, reply_rx).await {
                    Ok(Ok(reply)) if !reply.dismissed => reply.inputs,
                    _ => vec![String::new(); prompts.len()],
                }
            })
        }))
    }

    fn host_key_policy(&self) -> HostKeyPolicy {
        let hkv = &self.config.ssh.host_key_verification;
        if hkv.enabled {
            HostKeyPolicy::Strict {
                trusted: hkv.trusted_fingerprints.clone(),
            }
        } else {
            HostKeyPolicy::Disabled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, Config as GatewayConfig};

    fn test_config() -> GatewayConfig {
        GatewayConfig::load(&Cli::default()).expect("defaults validate")
    }

    #[test]
    fn retry_cap_defaults_to_three() {
        let config = test_config();
        let pipeline = AuthPipeline::new(&config);
        assert_eq!(pipeline.retry_cap, DEFAULT_RETRY_CAP);
    }

    #[test]
    fn config_default_credentials_require_a_secret() {
        let mut config = test_config();
        config.default_user.name = Some("root".into());
        let pipeline = AuthPipeline::new(&config);
        assert!(pipeline.config_default_credentials("host".into(), 22).is_none());

        config.default_user.password = Some("hunter2".into());
        let pipeline = AuthPipeline::new(&config);
        assert!(pipeline.config_default_credentials("host".into(), 22).is_some());
    }

    #[tokio::test]
    async fn retry_does_not_reuse_config_default_credentials() {
        let mut config = test_config();
        config.default_user.name = Some("root".into());
        config.default_user.password = Some("hunter2".into());
        let pipeline = AuthPipeline::new(&config);

        let (creds, method) = pipeline.gather(&None, "host".into(), 22, None, 0).await.unwrap();
        assert_eq!(creds.username, "root");
        assert_eq!(method, AuthMethod::Basic);

        // Once a prior attempt has failed, source 1 must not be retried
        // verbatim: with no prompt channel to fall back on, gather() has to
        // fail rather than hand back the same rejected credentials again.
        let err = pipeline.gather(&None, "host".into(), 22, None, 1).await;
        assert!(err.is_err());
    }

    #[test]
    fn disable_interactive_auth_suppresses_callback() {
        let mut config = test_config();
        config.ssh.disable_interactive_auth = true;
        let pipeline = AuthPipeline::new(&config);
        assert!(pipeline.make_interactive_callback(None).is_none());
    }
}
