//! HTTP surface and broker assembly.
//!
//! [`start`] wires the registry, replay queue, worker pool and federation
//! pipeline together, then serves WebSocket clients, `/health` and
//! `POST /publish` on one port and peer RPC on another.

use crate::config::Config;
use crate::metrics;
use crate::peer::{subscribe_upstreams, PeerPublisher, PeerReceiver};
use crate::session::{run_session, SessionSettings};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use eventual_core::pool::PoolCore;
use eventual_core::{
    EventQueue, JwtAuthority, Origin, PoolHandle, Registry, RelayGuard, ReplayQueue,
    TokenAuthority, WorkerPool,
};
use eventual_protocol::PublishEnvelope;
use eventual_transport::RpcServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub replay: Arc<ReplayQueue>,
    pub pool: PoolHandle,
    pub core: Arc<PoolCore>,
    pub auth: Arc<dyn TokenAuthority>,
    pub session: SessionSettings,
    /// Server configuration.
    pub config: Config,
}

/// A running broker.
pub struct ServerHandle {
    pub http_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    pub state: Arc<AppState>,
    http: Option<JoinHandle<std::io::Result<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Wait for the HTTP server to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the server failed or its task panicked.
    pub async fn wait(mut self) -> Result<()> {
        let Some(http) = self.http.take() else {
            return Ok(());
        };
        http.await.context("HTTP server task failed")??;
        Ok(())
    }

    /// Stop every task of this broker.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(http) = &self.http {
            http.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Assemble the broker and start serving.
///
/// # Errors
///
/// Returns an error if either listener cannot be bound.
pub async fn start(config: Config) -> Result<ServerHandle> {
    if config.auth.secret.is_empty() {
        warn!("JWT_TOKEN_SECRET is empty; tokens are signed with an empty key");
    }
    let auth: Arc<dyn TokenAuthority> = Arc::new(
        JwtAuthority::new(
            config.auth.secret.as_bytes(),
            Duration::from_secs(config.auth.token_ttl_secs),
        )
        .with_subject(config.advertise_address()),
    );

    let registry = Arc::new(Registry::new());
    let replay = Arc::new(ReplayQueue::with_config(config.replay_config()));
    let guard = Arc::new(RelayGuard::default());
    let federation = config.federation_config();

    let (events_tx, events_rx) = mpsc::channel(federation.channel_capacity);
    let (requests_tx, requests_rx) = mpsc::channel(federation.channel_capacity);
    let (peer_tx, peer_rx) = mpsc::channel(federation.channel_capacity);

    let pool = WorkerPool::with_config(
        Arc::clone(&registry),
        Arc::clone(&replay),
        Some(events_tx),
        config.pool_config(),
    );
    let mut tasks = pool.start();
    tasks.push(tokio::spawn(Arc::clone(&replay).run_janitor()));

    let event_queue = EventQueue::new(
        Arc::clone(&registry),
        Arc::clone(&guard),
        events_rx,
        requests_rx,
        peer_tx.clone(),
        federation.batch_interval,
    );
    tasks.push(tokio::spawn(event_queue.run()));

    let publisher = Arc::new(PeerPublisher::new(
        Arc::clone(&registry),
        Arc::clone(&auth),
        config.rpc.call_timeout(),
        config.rpc.max_concurrent,
        config.profiling,
    ));
    tasks.push(tokio::spawn(publisher.run(peer_rx)));

    let receiver = Arc::new(PeerReceiver::new(
        Arc::clone(&registry),
        Arc::clone(&auth),
        pool.handle(),
        guard,
        requests_tx,
        peer_tx,
    ));
    let rpc = RpcServer::bind(config.rpc_bind_addr()?)
        .await
        .context("Failed to bind peer RPC listener")?;
    let rpc_addr = rpc
        .local_addr()
        .context("Peer RPC listener has no local address")?;
    tasks.push(tokio::spawn(rpc.serve(receiver)));

    if !config.rpc.upstreams.is_empty() {
        tasks.push(tokio::spawn(subscribe_upstreams(
            config.rpc.upstreams.clone(),
            config.advertise_address(),
            Arc::clone(&auth),
            config.rpc.call_timeout(),
            config.rpc.subscribe_attempts,
            Duration::from_millis(config.rpc.subscribe_retry_ms),
        )));
    }

    let state = Arc::new(AppState {
        registry,
        replay,
        pool: pool.handle(),
        core: pool.core(),
        auth,
        session: SessionSettings::from_config(&config),
        config,
    });

    if state.config.metrics.enabled {
        tasks.push(tokio::spawn(report_gauges(Arc::clone(&state))));
    }

    let app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/publish", post(publish_handler))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind(state.config.bind_addr()?)
        .await
        .context("Failed to bind client listener")?;
    let http_addr = listener.local_addr()?;

    info!("eventual listening on {}", http_addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        http_addr, state.config.transport.websocket_path
    );

    let http = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    Ok(ServerHandle {
        http_addr,
        rpc_addr,
        state,
        http: Some(http),
        tasks,
    })
}

/// Run the broker until the HTTP server stops.
///
/// # Errors
///
/// Returns an error if the server fails to start or stops with an error.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let server = start(config).await?;
    info!(rpc = %server.rpc_addr, "Peer RPC endpoint ready");
    server.wait().await
}

async fn report_gauges(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(15));
    loop {
        ticker.tick().await;
        metrics::set_active_channels(state.registry.stats().channel_count);
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "channels": stats.channel_count,
        "subscriptions": stats.subscription_count,
        "sessions": state.core.session_count(),
        "server_peers": stats.server_peer_count,
        "client_peers": stats.client_peer_count,
        "replay_channels": state.replay.channel_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let limit = state.config.limits.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| run_session(socket, remote.to_string(), state))
}

/// Inject an event through HTTP instead of a WebSocket.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut envelope: PublishEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => return rejection(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let token = envelope
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));
    if let Err(e) = state.auth.verify_present(token.as_deref()) {
        debug!(error = %e, "Rejected HTTP publish");
        metrics::record_auth_failure("http");
        return rejection(StatusCode::UNAUTHORIZED, &e.to_string());
    }

    if let Err(e) = envelope.validate() {
        return rejection(StatusCode::BAD_REQUEST, &e.to_string());
    }

    let event_id = envelope.event.id.clone();
    match state
        .pool
        .publish(envelope.channels, Arc::new(envelope.event), Origin::Local)
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted", "id": event_id })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Worker pool unavailable");
            rejection(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn rejection(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
