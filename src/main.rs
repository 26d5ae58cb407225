use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum_extra::extract::cookie::Key;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webssh_gateway::config::{Cli, Config};
use webssh_gateway::gateway::{self, PollRegistry};
use webssh_gateway::router::{self, AppState};
use webssh_gateway::session_store::SessionStore;

/// Builds the CORS layer from `http.origins` (SPEC_FULL §2: "CORS
/// configured ... the way the teacher's `main.rs` builds its
/// `CorsLayer`, generalized to config-driven origins"). An empty list
/// matches the teacher's own dev-mode default of allowing any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);
    if origins.is_empty() {
        return layer.allow_origin(Any).allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(parsed).allow_headers(Any)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let cookie_key = Key::derive_from(config.session.secret.as_bytes());
    let listen_ip = config.listen_ip;
    let listen_port = config.listen_port;
    let cors = cors_layer(&config.http_origins);

    let state = AppState {
        config: Arc::new(config),
        store: Arc::new(SessionStore::new()),
        cookie_key,
        poll_registry: Arc::new(PollRegistry::new()),
    };

    let app = router::router(state.clone())
        .merge(gateway::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    tokio::spawn(session_reaper(state.store, state.config.session.session_timeout));

    let addr = std::net::SocketAddr::new(listen_ip, listen_port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listen address");
            std::process::exit(1);
        }
    };
    info!(%addr, "webssh-gateway listening");

    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

/// Sweeps idle sessions on a fixed interval so `SessionStore` doesn't grow
/// without bound once a session's cookie has effectively expired (spec.md
/// §4.2). Runs at a quarter of the configured timeout so a session is
/// reaped reasonably close to when it actually goes idle, not up to a
/// whole timeout late.
async fn session_reaper(store: Arc<SessionStore>, timeout: std::time::Duration) {
    let interval = (timeout / 4).max(std::time::Duration::from_secs(30));
    let mut ticker = tokio::time::interval(interval);
    let chrono_timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
    loop {
        ticker.tick().await;
        let reaped = store.sweep_idle(chrono_timeout).await;
        if reaped > 0 {
            info!(reaped, "swept idle sessions");
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install Ctrl+C handler");
        return;
    }
    info!("shutdown signal received, draining connections");
}
