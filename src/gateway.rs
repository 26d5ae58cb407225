//! C7 — SocketGateway (spec.md §4.5, §4.6 transport row). Binds one
//! [`crate::adapter::ConnectionAdapter`] per client, over either a
//! websocket or the long-poll fallback, and is the one place that
//! implements the abstract `bufferedAmount` the adapter's backpressure
//! policy consumes: it decrements `OutboundMeter` once a frame has
//! actually left the process, not merely been handed to the adapter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::cookie::PrivateCookieJar;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use crate::adapter::{ConnectionAdapter, OutboundMeter};
use crate::config::Config;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::router::AppState;
use crate::session_store::{SessionId, SessionStore};

const PING_INTERVAL: Duration = Duration::from_secs(25);
const PING_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_WAIT: Duration = Duration::from_secs(25);
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ssh/socket.io", get(ws_handler))
        .route("/ssh/poll/:session_id", get(poll_read_handler).post(poll_write_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, jar: PrivateCookieJar) -> Response {
    let (session_id, jar) = crate::router::session_id_from_jar(jar, &state).await;
    state.store.create_session(session_id.clone()).await;
    let config = state.config.clone();
    let store = state.store.clone();
    let upgrade = ws.on_upgrade(move |socket| handle_socket(socket, session_id, config, store));
    (jar, upgrade).into_response()
}

/// Owns the socket for its whole lifetime: a writer task drains the
/// adapter's outbound channel and sends ping frames on an interval, the
/// main loop feeds inbound frames to the adapter one at a time (spec.md
/// §4.5: one event in flight per connection keeps state-machine
/// transitions unambiguous).
async fn handle_socket(socket: WebSocket, session_id: SessionId, config: Arc<Config>, store: Arc<SessionStore>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CHANNEL_CAPACITY);
    let meter = OutboundMeter::new();
    let adapter = Arc::new(Mutex::new(ConnectionAdapter::new(
        session_id.clone(),
        config,
        store,
        outbound_tx,
        meter.clone(),
    )));
    let last_pong = Arc::new(Mutex::new(tokio::time::Instant::now()));

    let writer_last_pong = last_pong.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately; discard it
        loop {
            tokio::select! {
                event = outbound_rx.recv() => {
                    let Some(event) = event else { break };
                    match event.to_binary() {
                        Ok(bytes) => {
                            let len = bytes.len();
                            if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                            meter.sub(len);
                        }
                        Err(e) => warn!(error = %e, "failed to encode outbound event"),
                    }
                }
                _ = ping_interval.tick() => {
                    // ping-timeout (spec.md §4.7): a client that hasn't
                    // answered a ping within PING_TIMEOUT is presumed dead.
                    if writer_last_pong.lock().await.elapsed() > PING_TIMEOUT {
                        debug!("no pong within ping-timeout, closing");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Binary(data) => match ClientEvent::from_binary(&data) {
                Ok(event) => adapter.lock().await.handle_event(event).await,
                Err(e) => adapter.lock().await.reject_malformed("data", e.to_string()).await,
            },
            Message::Close(_) => break,
            Message::Pong(_) => {
                *last_pong.lock().await = tokio::time::Instant::now();
            }
            Message::Ping(_) | Message::Text(_) => {}
        }
    }

    adapter.lock().await.close("connection closed".to_string()).await;
    writer.abort();
    debug!(%session_id, "websocket connection ended");
}

/// One long-poll session's plumbing: the adapter plus a buffer of
/// already-encoded outbound frames a `GET` drains, and a [`Notify`] so a
/// waiting `GET` wakes as soon as new data arrives instead of only at
/// its timeout.
struct PollState {
    adapter: Mutex<ConnectionAdapter>,
    outbound_buffer: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    meter: OutboundMeter,
}

#[derive(Default)]
pub struct PollRegistry {
    sessions: DashMap<SessionId, Arc<PollState>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create(&self, session_id: SessionId, config: Arc<Config>, store: Arc<SessionStore>) -> Arc<PollState> {
        if let Some(existing) = self.sessions.get(&session_id) {
            return existing.clone();
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CHANNEL_CAPACITY);
        let meter = OutboundMeter::new();
        let adapter = ConnectionAdapter::new(session_id.clone(), config, store, outbound_tx, meter.clone());
        let state = Arc::new(PollState {
            adapter: Mutex::new(adapter),
            outbound_buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            meter,
        });

        let drain_state = state.clone();
        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                if let Ok(bytes) = event.to_binary() {
                    // `meter` tracks bytes the adapter believes are still
                    // in flight (spec.md's `bufferedAmount`); it must stay
                    // charged until a poll actually hands the frame to the
                    // client (see `poll_read_handler`'s `meter.sub`), not
                    // merely once it lands in this in-memory buffer.
                    drain_state.outbound_buffer.lock().await.push_back(bytes);
                    drain_state.notify.notify_waiters();
                }
            }
        });

        self.sessions.entry(session_id).or_insert(state).clone()
    }

    async fn remove(&self, session_id: &str) {
        if let Some((_, state)) = self.sessions.remove(session_id) {
            state.adapter.lock().await.close("long-poll session ended".to_string()).await;
        }
    }
}

/// `GET /ssh/poll/:session_id`: blocks up to `POLL_WAIT` for at least one
/// outbound frame, then drains and returns whatever has accumulated as a
/// JSON array of base64-encoded frames (empty array on timeout — this is
/// a normal "nothing happened yet" response, not an error).
async fn poll_read_handler(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    let poll_state = state
        .poll_registry
        .get_or_create(session_id.clone(), state.config.clone(), state.store.clone())
        .await;

    {
        // Register interest before checking the buffer: if a frame lands
        // and `notify_one` fires between the check and the await below,
        // this stored future still observes it. Checking first and only
        // then building the `notified()` future would risk missing that
        // notification and sleeping the full `POLL_WAIT` for nothing.
        let notified = poll_state.notify.notified();
        let buffer = poll_state.outbound_buffer.lock().await;
        let is_empty = buffer.is_empty();
        drop(buffer);
        if is_empty {
            let _ = tokio::time::timeout(POLL_WAIT, notified).await;
        }
    }

    let mut buffer = poll_state.outbound_buffer.lock().await;
    let frames: Vec<String> = buffer
        .drain(..)
        .map(|f| {
            poll_state.meter.sub(f.len());
            base64::encode(f)
        })
        .collect();
    axum::Json(frames).into_response()
}

/// `POST /ssh/poll/:session_id`: the request body is exactly one encoded
/// `ClientEvent` frame.
async fn poll_write_handler(State(state): State<AppState>, Path(session_id): Path<String>, body: bytes::Bytes) -> Response {
    let poll_state = state
        .poll_registry
        .get_or_create(session_id.clone(), state.config.clone(), state.store.clone())
        .await;

    match ClientEvent::from_binary(&body) {
        Ok(event) => {
            let is_disconnect = matches!(event, ClientEvent::Control(crate::protocol::ControlAction::Disconnect));
            poll_state.adapter.lock().await.handle_event(event).await;
            if is_disconnect {
                state.poll_registry.remove(&session_id).await;
            }
            axum::http::StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            poll_state.adapter.lock().await.reject_malformed("data", e.to_string()).await;
            axum::http::StatusCode::BAD_REQUEST.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_registry_reuses_existing_session() {
        let registry = PollRegistry::new();
        let config = Arc::new(Config::load(&crate::config::Cli::default()).unwrap());
        let store = Arc::new(SessionStore::new());
        let a = registry.get_or_create("s1".to_string(), config.clone(), store.clone()).await;
        let b = registry.get_or_create("s1".to_string(), config, store).await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
