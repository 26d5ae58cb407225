//! C5 — ConnectionAdapter (spec.md §4.5). The hardest subsystem: per
//! client socket, a state machine `Init -> Authenticating -> Shell |
//! Exec -> Closed` that validates inbound events, drives the
//! AuthPipeline and SSHClient, and forwards SSH output back out with
//! backpressure.
//!
//! Replaces the teacher's `websocket.rs::WebSocketHandler` and the ad
//! hoc per-connection glue in `main.rs::handle_socket`, keeping its
//! three-task shape (receiver / sender / SSH-output pump) and `mpsc`
//! byte-channel wiring, generalized to the full event surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::auth::{AuthPipeline, PromptReply, PromptRequest, SessionAttached, DEFAULT_PROMPT_TIMEOUT};
use crate::backpressure::{compute_backpressure_action, BackpressureAction};
use crate::config::Config;
use crate::error::GatewayError;
use crate::prompt::{PromptResponseInput, PromptTracker};
use crate::protocol::{
    AuthResultPayload, ClientEvent, ControlAction, DisconnectPayload, ExecDataPayload, ExecExitPayload,
    ExecPayload, ExecStreamKind, PromptPayload, ResizePayload, ServerEvent, TerminalPayload,
};
use crate::session_store::{Action, SessionId, SessionStore};
use crate::ssh::client::ExecPtyOptions;
use crate::ssh::{ExecHandle, ShellHandle, SshClient, SshError};
use crate::validator::{self, CredentialInput};

const RESUME_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared byte counter standing in for the client transport's
/// `bufferedAmount`: the adapter increments it when it hands a frame to
/// the outbound channel, and the transport (gateway.rs) decrements it
/// once the frame has actually left the process.
#[derive(Debug, Clone, Default)]
pub struct OutboundMeter(Arc<AtomicUsize>);

impl OutboundMeter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::SeqCst);
    }
    pub fn sub(&self, n: usize) {
        let current = self.0.load(Ordering::SeqCst);
        self.0.fetch_sub(n.min(current), Ordering::SeqCst);
    }
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Init,
    Authenticating,
    Shell,
    Exec,
    Closed,
}

struct TokenBucket {
    rate_per_sec: u64,
    tokens: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64) -> Self {
        Self { rate_per_sec, tokens: rate_per_sec as f64, last_refill: std::time::Instant::now() }
    }

    /// `0` means unlimited; always permits immediately. A single chunk
    /// larger than the bucket's capacity (`rate_per_sec`) would otherwise
    /// never be admitted, so its cost is capped at capacity: once the
    /// bucket is full it drains and the chunk goes through.
    fn try_take(&mut self, n: usize) -> bool {
        if self.rate_per_sec == 0 {
            return true;
        }
        let capacity = self.rate_per_sec as f64;
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * capacity).min(capacity);
        self.last_refill = std::time::Instant::now();
        let cost = (n as f64).min(capacity);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// C5. Owns exactly one client socket's session worth of SSH plumbing.
pub struct ConnectionAdapter {
    session_id: SessionId,
    config: Arc<Config>,
    store: Arc<SessionStore>,
    outbound_tx: mpsc::Sender<ServerEvent>,
    meter: OutboundMeter,
    state: AdapterState,
    ssh_client: Option<Arc<SshClient>>,
    shell_input_tx: Option<mpsc::Sender<bytes::Bytes>>,
    shell_resize_tx: Option<mpsc::Sender<(u32, u32)>>,
    paused: Arc<AtomicBool>,
    prompt_tracker: Arc<Mutex<PromptTracker>>,
    prompt_waiters: Arc<Mutex<HashMap<String, oneshot::Sender<PromptReply>>>>,
    pending_resize: Option<(u32, u32)>,
    host: Option<String>,
    port: Option<u16>,
    allow_replay_password: Option<String>,
    env_overrides: HashMap<String, String>,
    exec_done_tx: mpsc::Sender<()>,
    exec_done_rx: mpsc::Receiver<()>,
    pre_exec_state: Option<AdapterState>,
}

impl ConnectionAdapter {
    pub fn new(
        session_id: SessionId,
        config: Arc<Config>,
        store: Arc<SessionStore>,
        outbound_tx: mpsc::Sender<ServerEvent>,
        meter: OutboundMeter,
    ) -> Self {
        let (exec_done_tx, exec_done_rx) = mpsc::channel(1);
        Self {
            session_id,
            config,
            store,
            outbound_tx,
            meter,
            state: AdapterState::Init,
            ssh_client: None,
            shell_input_tx: None,
            shell_resize_tx: None,
            paused: Arc::new(AtomicBool::new(false)),
            prompt_tracker: Arc::new(Mutex::new(PromptTracker::new())),
            prompt_waiters: Arc::new(Mutex::new(HashMap::new())),
            pending_resize: None,
            host: None,
            port: None,
            allow_replay_password: None,
            env_overrides: HashMap::new(),
            exec_done_tx,
            exec_done_rx,
            pre_exec_state: None,
        }
    }

    /// Top-level dispatch; one inbound frame at a time.
    pub async fn handle_event(&mut self, event: ClientEvent) {
        self.drain_exec_completion();
        match event {
            ClientEvent::Authenticate(payload) => {
                let input = CredentialInput {
                    username: Some(payload.username),
                    host: payload.host,
                    port: payload.port,
                    password: payload.password,
                    private_key: payload.private_key,
                    passphrase: payload.passphrase,
                };
                self.on_authenticate(input).await;
            }
            ClientEvent::Terminal(payload) => self.on_terminal(payload).await,
            ClientEvent::Resize(payload) => self.on_resize(payload).await,
            ClientEvent::Data(bytes) => self.on_data(bytes).await,
            ClientEvent::Exec(payload) => self.on_exec(payload).await,
            ClientEvent::Control(action) => self.on_control(action).await,
            ClientEvent::PromptResponse(payload) => self.on_prompt_response(payload).await,
        }
    }

    async fn emit(&self, event: ServerEvent) {
        if let Ok(bytes) = event.to_binary() {
            self.meter.add(bytes.len());
        }
        let _ = self.outbound_tx.send(event).await;
    }

    async fn on_authenticate(&mut self, input: CredentialInput) {
        if self.state != AdapterState::Init && self.state != AdapterState::Authenticating {
            self.emit(ServerEvent::error("authenticate", "already connected")).await;
            return;
        }
        self.state = AdapterState::Authenticating;

        let host = input
            .host
            .clone()
            .or_else(|| self.config.ssh_host.clone())
            .unwrap_or_default();
        let default_port = self.config.ssh_port.to_string();
        let port = validator::validate_port(input.port.as_deref().or(Some(default_port.as_str())));
        self.host = Some(host.clone());
        self.port = Some(port);

        self.store
            .dispatch(&self.session_id, Action::ConnectionConnecting { host: host.clone(), port })
            .await;

        let (prompt_tx, mut prompt_rx) = mpsc::channel::<PromptRequest>(4);
        let waiters = self.prompt_waiters.clone();
        let tracker = self.prompt_tracker.clone();
        let outbound = self.outbound_tx.clone();
        let meter = self.meter.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(req) = prompt_rx.recv().await {
                let input_keys: Vec<String> = req.fields.iter().map(|f| f.label.clone()).collect();
                let buttons = vec!["ok".to_string(), "cancel".to_string()];
                let id = match tracker.lock().await.register(buttons.clone(), input_keys.clone(), DEFAULT_PROMPT_TIMEOUT) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, "dropping auth prompt: tracker rejected registration");
                        // Dropping `req.respond_to` here fails the pending
                        // auth attempt immediately rather than stalling it
                        // until its own 60s timeout.
                        continue;
                    }
                };
                waiters.lock().await.insert(id.clone(), req.respond_to);
                let event = ServerEvent::Prompt(PromptPayload {
                    id,
                    prompt_type: req.prompt_type.to_string(),
                    title: req.title,
                    buttons,
                    inputs: Some(input_keys),
                    timeout: Some(DEFAULT_PROMPT_TIMEOUT.as_secs()),
                });
                if let Ok(bytes) = event.to_binary() {
                    meter.add(bytes.len());
                }
                let _ = outbound.send(event).await;
            }
        });

        let pipeline = AuthPipeline::new(&self.config);
        let session_attached = Some(SessionAttached {
            credentials: input,
            method: crate::session_store::AuthMethod::Post,
        });
        let result = pipeline.authenticate(host, port, session_attached, Some(prompt_tx)).await;
        forward_task.abort();

        match result {
            Ok((auth_result, outcome)) => {
                self.allow_replay_password = auth_result.replayable_password.clone();
                self.store
                    .dispatch(&self.session_id, Action::AuthSuccess { username: auth_result.username })
                    .await;
                self.ssh_client = Some(Arc::new(outcome.client));
                self.emit(ServerEvent::AuthResult(AuthResultPayload { success: true, message: None }))
                    .await;
                if let Some(ref banner) = outcome.banner {
                    self.emit(ServerEvent::Title(banner.clone())).await;
                }
                self.open_shell().await;
            }
            Err(e) => {
                self.store
                    .dispatch(&self.session_id, Action::AuthFailure { error_message: e.to_string() })
                    .await;
                self.emit(ServerEvent::AuthResult(AuthResultPayload {
                    success: false,
                    message: Some(e.to_string()),
                }))
                .await;
                self.state = AdapterState::Init;
            }
        }
    }

    async fn open_shell(&mut self) {
        let Some(client) = self.ssh_client.clone() else { return };
        let (rows, cols) = self.pending_resize.unwrap_or((24, 80));
        let opts = crate::ssh::channel::ShellOptions {
            term: self.config.ssh_term.clone(),
            rows,
            cols,
        };
        match client.shell(opts, self.env_overrides.clone()).await {
            Ok(handle) => {
                self.state = AdapterState::Shell;
                self.shell_input_tx = Some(handle.input_tx.clone());
                self.shell_resize_tx = Some(handle.resize_tx.clone());
                self.store
                    .dispatch(&self.session_id, Action::ConnectionConnected { connection_id: self.session_id.clone() })
                    .await;
                self.spawn_shell_forwarder(handle);
            }
            Err(e) => {
                warn!(error = %e, "failed to open shell");
                self.emit(ServerEvent::error("shell", e.to_string())).await;
            }
        }
    }

    fn spawn_shell_forwarder(&self, mut handle: ShellHandle) {
        let outbound = self.outbound_tx.clone();
        let meter = self.meter.clone();
        let paused = self.paused.clone();
        let high_water = self.config.ssh.socket_high_water_mark;

        tokio::spawn(async move {
            loop {
                if paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(RESUME_POLL_INTERVAL).await;
                    let action = compute_backpressure_action(Some(meter.get()), high_water, true);
                    if action == BackpressureAction::Resume {
                        paused.store(false, Ordering::SeqCst);
                    }
                    continue;
                }

                match handle.output_rx.recv().await {
                    Some(data) => {
                        let event = ServerEvent::ssh_data(data);
                        if let Ok(bytes) = event.to_binary() {
                            meter.add(bytes.len());
                        }
                        if outbound.send(event).await.is_err() {
                            break;
                        }
                        let action = compute_backpressure_action(Some(meter.get()), high_water, false);
                        if action == BackpressureAction::Pause {
                            paused.store(true, Ordering::SeqCst);
                        }
                    }
                    None => break,
                }
            }
            debug!("shell output forwarder ended");
        });
    }

    async fn on_terminal(&mut self, payload: TerminalPayload) {
        let term = payload.term.clone();
        let rows = payload.rows;
        let cols = payload.cols;
        let env = payload.env.as_deref().and_then(validator::parse_env_vars);

        if let Some(ref env_map) = env {
            self.env_overrides = validator::filter_environment_variables(env_map.clone(), None);
        }

        self.store
            .dispatch(
                &self.session_id,
                Action::SetTerminal { term, rows, cols, environment: env },
            )
            .await;

        if let (Some(rows), Some(cols)) = (rows, cols) {
            self.apply_resize(rows, cols).await;
        }
    }

    async fn on_resize(&mut self, payload: ResizePayload) {
        self.apply_resize(payload.rows, payload.cols).await;
    }

    async fn apply_resize(&mut self, rows: u32, cols: u32) {
        let rows = validator::validate_dimension(rows);
        let cols = validator::validate_dimension(cols);
        self.store.dispatch(&self.session_id, Action::Resize { rows, cols }).await;

        if let Some(ref tx) = self.shell_resize_tx {
            let _ = tx.send((rows, cols)).await;
        } else {
            // spec.md §4.5 "resize ordering": stash until the shell opens.
            self.pending_resize = Some((rows, cols));
        }
    }

    async fn on_data(&mut self, data: Vec<u8>) {
        if let Some(ref tx) = self.shell_input_tx {
            let _ = tx.send(bytes::Bytes::from(data)).await;
        }
    }

    /// Applies any exec completions the detached forwarder task has
    /// signaled since the last event, restoring whatever state preceded
    /// the exec (normally `Shell`). Without this, `self.state` would stay
    /// pinned at `Exec` forever after the first exec, since the forwarder
    /// has no handle back into the adapter to reset it directly.
    fn drain_exec_completion(&mut self) {
        while self.exec_done_rx.try_recv().is_ok() {
            if self.state == AdapterState::Exec {
                self.state = self.pre_exec_state.take().unwrap_or(AdapterState::Shell);
            }
        }
    }

    async fn on_exec(&mut self, payload: ExecPayload) {
        let Some(client) = self.ssh_client.clone() else {
            self.emit(ServerEvent::error("exec", "not authenticated")).await;
            return;
        };
        if self.state == AdapterState::Exec {
            self.emit(ServerEvent::error("exec", "an exec is already in progress")).await;
            return;
        }

        let pty: Option<ExecPtyOptions> = if payload.pty.unwrap_or(false) {
            Some(ExecPtyOptions {
                term: payload.term.unwrap_or_else(|| self.config.ssh_term.clone()),
                rows: payload.rows.unwrap_or(24),
                cols: payload.cols.unwrap_or(80),
            })
        } else {
            None
        };
        let env = payload
            .env
            .as_deref()
            .and_then(validator::parse_env_vars)
            .map(|m| validator::filter_environment_variables(m, None))
            .unwrap_or_default();
        let max_output = self.config.ssh.max_exec_output_bytes;
        let rate_limit = self.config.ssh.output_rate_limit_bytes_per_sec;

        match client.exec(payload.command, pty, env, max_output).await {
            Ok(handle) => {
                self.pre_exec_state = Some(self.state);
                self.state = AdapterState::Exec;
                self.spawn_exec_forwarder(handle, rate_limit, self.exec_done_tx.clone());
            }
            Err(e) => {
                self.emit(ServerEvent::error("exec", e.to_string())).await;
            }
        }
    }

    fn spawn_exec_forwarder(&self, mut handle: ExecHandle, rate_limit: u64, exec_done_tx: mpsc::Sender<()>) {
        let outbound = self.outbound_tx.clone();
        let meter = self.meter.clone();

        tokio::spawn(async move {
            let mut bucket = TokenBucket::new(rate_limit);
            loop {
                tokio::select! {
                    Some(data) = handle.stdout_rx.recv() => {
                        forward_exec_chunk(&outbound, &meter, &mut bucket, ExecStreamKind::Stdout, data).await;
                    }
                    Some(data) = handle.stderr_rx.recv() => {
                        forward_exec_chunk(&outbound, &meter, &mut bucket, ExecStreamKind::Stderr, data).await;
                    }
                    else => break,
                }
            }

            let exit = handle.wait().await;
            let event = match exit {
                Ok(result) => ServerEvent::ExecExit(ExecExitPayload { code: result.exit_code, signal: result.signal }),
                Err(SshError::OutputLimitExceeded) => {
                    let stderr = ServerEvent::ExecData(ExecDataPayload {
                        kind: ExecStreamKind::Stderr,
                        data: b"output limit exceeded".to_vec(),
                    });
                    let _ = outbound.send(stderr).await;
                    ServerEvent::ExecExit(ExecExitPayload { code: None, signal: Some("OUTPUT_LIMIT_EXCEEDED".to_string()) })
                }
                Err(e) => ServerEvent::ExecExit(ExecExitPayload { code: None, signal: Some(e.to_string()) }),
            };
            let _ = outbound.send(event).await;
            let _ = exec_done_tx.send(()).await;
        });
    }

    async fn on_control(&mut self, action: ControlAction) {
        match action {
            ControlAction::Reauth => {
                if let Some(client) = self.ssh_client.take() {
                    client.end().await;
                }
                self.shell_input_tx = None;
                self.shell_resize_tx = None;
                self.store.dispatch(&self.session_id, Action::AuthLogout).await;
                self.state = AdapterState::Authenticating;
            }
            ControlAction::ClearCredentials => {
                self.allow_replay_password = None;
                self.store.dispatch(&self.session_id, Action::ClearCredentials).await;
            }
            ControlAction::ReplayCredentials => {
                if !self.config.options.allow_replay {
                    self.emit(ServerEvent::error("control", "credential replay is disabled")).await;
                    return;
                }
                if let (Some(ref password), Some(ref tx)) = (self.allow_replay_password.clone(), &self.shell_input_tx) {
                    let suffix = if self.config.options.replay_crlf { "\r\n" } else { "\n" };
                    let payload = format!("{password}{suffix}");
                    let _ = tx.send(bytes::Bytes::from(payload)).await;
                }
            }
            ControlAction::Disconnect => {
                self.close("client requested disconnect".to_string()).await;
            }
        }
    }

    /// Routes a `prompt-response` back to whichever auth-pipeline prompt is
    /// waiting on it. Every prompt the adapter emits — today that means
    /// only the keyboard-interactive auth prompts from `on_authenticate` —
    /// is registered in `self.prompt_tracker` when it's sent, so the
    /// response is run through `PromptTracker::resolve` first: that
    /// enforces spec.md §4.5's id ownership/expiry, declared-button, and
    /// input-key/length/HTML checks. Only a response that survives
    /// validation is allowed to wake the waiting auth attempt.
    async fn on_prompt_response(&mut self, payload: crate::protocol::PromptResponsePayload) {
        let values = payload.inputs.clone().unwrap_or_default();
        let declared_keys = {
            let tracker = self.prompt_tracker.lock().await;
            tracker.input_keys_for(&payload.id)
        };
        let inputs: HashMap<String, String> = match declared_keys {
            Some(keys) => keys.into_iter().zip(values.iter().cloned()).collect(),
            None => HashMap::new(),
        };
        let response = PromptResponseInput { id: payload.id.clone(), action: payload.action.clone(), inputs };

        if let Err(e) = self.prompt_tracker.lock().await.resolve(&response) {
            self.emit(ServerEvent::error("prompt-response", e.to_string())).await;
            return;
        }

        let mut waiters = self.prompt_waiters.lock().await;
        if let Some(respond_to) = waiters.remove(&payload.id) {
            let reply = PromptReply {
                dismissed: payload.action == "dismissed" || payload.action == "timeout",
                inputs: values,
            };
            let _ = respond_to.send(reply);
        } else {
            debug!(id = %payload.id, "prompt-response for unknown or already-resolved prompt");
        }
    }

    /// Lets the transport layer (gateway.rs) report a frame it could not
    /// decode without reaching into the adapter's private `emit`.
    pub async fn reject_malformed(&self, event: &str, reason: String) {
        self.emit(ServerEvent::error(event, reason)).await;
    }

    /// Idempotent teardown: releases the SSH client and marks the state
    /// `Closed`. Safe to call more than once.
    pub async fn close(&mut self, reason: String) {
        if self.state == AdapterState::Closed {
            return;
        }
        self.state = AdapterState::Closed;
        if let Some(client) = self.ssh_client.take() {
            client.end().await;
        }
        self.shell_input_tx = None;
        self.shell_resize_tx = None;
        self.store.dispatch(&self.session_id, Action::ConnectionClosed).await;
        self.emit(ServerEvent::Disconnect(DisconnectPayload { reason })).await;
    }
}

async fn forward_exec_chunk(
    outbound: &mpsc::Sender<ServerEvent>,
    meter: &OutboundMeter,
    bucket: &mut TokenBucket,
    kind: ExecStreamKind,
    data: bytes::Bytes,
) {
    while !bucket.try_take(data.len()) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let event = ServerEvent::ExecData(ExecDataPayload { kind, data: data.to_vec() });
    if let Ok(bytes) = event.to_binary() {
        meter.add(bytes.len());
    }
    let _ = outbound.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_unlimited_always_allows() {
        let mut bucket = TokenBucket::new(0);
        assert!(bucket.try_take(10_000_000));
    }

    #[test]
    fn token_bucket_limits_burst() {
        let mut bucket = TokenBucket::new(100);
        assert!(bucket.try_take(100));
        assert!(!bucket.try_take(100));
    }

    #[test]
    fn token_bucket_admits_chunk_larger_than_capacity_once_full() {
        let mut bucket = TokenBucket::new(100);
        // First call refills to capacity (elapsed ~0) then spends the
        // capped cost; a chunk bigger than capacity must still go through
        // rather than block forever waiting for tokens it can never reach.
        assert!(bucket.try_take(10_000));
    }

    #[test]
    fn outbound_meter_tracks_add_and_sub() {
        let meter = OutboundMeter::new();
        meter.add(100);
        meter.sub(40);
        assert_eq!(meter.get(), 60);
    }

    #[test]
    fn outbound_meter_sub_never_underflows() {
        let meter = OutboundMeter::new();
        meter.add(10);
        meter.sub(100);
        assert_eq!(meter.get(), 0);
    }

    fn test_adapter() -> ConnectionAdapter {
        let config = Arc::new(Config::load(&crate::config::Cli::default()).unwrap());
        let store = Arc::new(SessionStore::new());
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        ConnectionAdapter::new("test-session".to_string(), config, store, outbound_tx, OutboundMeter::new())
    }

    #[tokio::test]
    async fn exec_completion_restores_prior_state() {
        let mut adapter = test_adapter();
        adapter.pre_exec_state = Some(AdapterState::Shell);
        adapter.state = AdapterState::Exec;
        adapter.exec_done_tx.send(()).await.unwrap();

        adapter.drain_exec_completion();

        assert_eq!(adapter.state, AdapterState::Shell);
        assert!(adapter.pre_exec_state.is_none());
    }

    #[tokio::test]
    async fn second_exec_is_accepted_once_the_first_has_signaled_completion() {
        let mut adapter = test_adapter();
        adapter.state = AdapterState::Exec;
        adapter.exec_done_tx.send(()).await.unwrap();

        // handle_event always drains completions before dispatching, so the
        // next exec's guard check sees a fresh state rather than the stale
        // `Exec` left behind by a forwarder task with no way to reset it.
        adapter.drain_exec_completion();

        assert_ne!(adapter.state, AdapterState::Exec);
    }

    #[tokio::test]
    async fn prompt_response_with_html_like_input_is_rejected() {
        let mut adapter = test_adapter();
        let (respond_to, mut reply_rx) = oneshot::channel::<PromptReply>();
        let id = adapter
            .prompt_tracker
            .lock()
            .await
            .register(vec!["ok".into(), "cancel".into()], vec!["note".into()], DEFAULT_PROMPT_TIMEOUT)
            .unwrap();
        adapter.prompt_waiters.lock().await.insert(id.clone(), respond_to);

        adapter
            .on_prompt_response(crate::protocol::PromptResponsePayload {
                id,
                action: "ok".to_string(),
                inputs: Some(vec!["<script>alert(1)</script>".to_string()]),
            })
            .await;

        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn prompt_response_with_valid_input_wakes_waiter() {
        let mut adapter = test_adapter();
        let (respond_to, reply_rx) = oneshot::channel::<PromptReply>();
        let id = adapter
            .prompt_tracker
            .lock()
            .await
            .register(vec!["ok".into(), "cancel".into()], vec!["password".into()], DEFAULT_PROMPT_TIMEOUT)
            .unwrap();
        adapter.prompt_waiters.lock().await.insert(id.clone(), respond_to);

        adapter
            .on_prompt_response(crate::protocol::PromptResponsePayload {
                id,
                action: "ok".to_string(),
                inputs: Some(vec!["hunter2".to_string()]),
            })
            .await;

        let reply = reply_rx.await.unwrap();
        assert!(!reply.dismissed);
        assert_eq!(reply.inputs, vec!["hunter2".to_string()]);
    }

    #[tokio::test]
    async fn prompt_response_with_unregistered_id_does_not_panic() {
        let mut adapter = test_adapter();
        adapter
            .on_prompt_response(crate::protocol::PromptResponsePayload {
                id: "never-registered".to_string(),
                action: "ok".to_string(),
                inputs: None,
            })
            .await;
    }
}
