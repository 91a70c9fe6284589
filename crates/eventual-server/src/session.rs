//! WebSocket session: one read loop and one write loop per client.
//!
//! The read loop authenticates and dispatches client frames to the worker
//! pool. The write loop drains the session's outbound queue and keeps the
//! connection alive with pings. Whichever loop stops first closes the
//! session; the other notices through [`SessionHandle::closed`].

use crate::config::Config;
use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use axum::extract::ws::{close_code, Message, WebSocket};
use eventual_core::{Origin, Outbound, PoolHandle, SessionHandle, TokenAuthority};
use eventual_protocol::client::{encode_event, invalid_request};
use eventual_protocol::{decode_frame, ClientRequest};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Timing and sizing of client sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub outbound_capacity: usize,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            pong_wait: config.heartbeat.pong_wait(),
            ping_period: config.heartbeat.ping_period(),
            write_wait: config.heartbeat.write_wait(),
            outbound_capacity: config.limits.outbound_queue_capacity,
        }
    }
}

enum Flow {
    Continue,
    Stop(&'static str),
}

/// Serve one upgraded WebSocket until either side closes it.
pub async fn run_session(socket: WebSocket, client_id: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (handle, outbound) = SessionHandle::new(client_id, state.session.outbound_capacity);
    if !handle.mark_open() {
        return;
    }
    debug!(session = %handle.id(), client = %handle.client_id(), "Session opened");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        handle.clone(),
        state.pool.clone(),
        state.session.clone(),
    ));

    let reason = read_loop(stream, &handle, &state).await;
    close_session(&handle, &state.pool, reason).await;

    if let Err(e) = writer.await {
        error!(session = %handle.id(), error = %e, "Write loop failed");
    }
    handle.mark_closed();
    debug!(session = %handle.id(), "Session closed");
}

/// Begin closing `handle`. Only the first caller releases its subscriptions.
async fn close_session(handle: &SessionHandle, pool: &PoolHandle, reason: &str) {
    if !handle.close() {
        return;
    }
    debug!(session = %handle.id(), reason, "Closing session");
    if pool.unsubscribe_all(handle.clone()).await.is_err() {
        debug!(session = %handle.id(), "Pool stopped, leaving subscriptions to the cleaner");
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    handle: &SessionHandle,
    state: &AppState,
) -> &'static str {
    let pong_wait = state.session.pong_wait;

    loop {
        let next = tokio::select! {
            () = handle.closed() => return "closed by writer",
            next = tokio::time::timeout(pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(session = %handle.id(), "Read deadline exceeded");
                return "read deadline exceeded";
            }
            Ok(None) => return "stream ended",
            Ok(Some(Err(e))) => {
                debug!(session = %handle.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                return "transport error";
            }
            Ok(Some(Ok(message))) => message,
        };

        let flow = match message {
            Message::Text(text) => handle_text(&text, handle, state).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => handle_text(text, handle, state).await,
                Err(_) => {
                    warn!(session = %handle.id(), "Binary frame is not UTF-8");
                    metrics::record_error("decode");
                    Flow::Stop("malformed frame")
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                trace!(session = %handle.id(), "Heartbeat");
                Flow::Continue
            }
            Message::Close(frame) => {
                let code = frame.as_ref().map_or(close_code::NORMAL, |f| f.code);
                if code == close_code::NORMAL || code == close_code::AWAY {
                    debug!(session = %handle.id(), code, "Client closed");
                } else {
                    warn!(session = %handle.id(), code, "Client closed abnormally");
                }
                Flow::Stop("client closed")
            }
        };

        if let Flow::Stop(reason) = flow {
            return reason;
        }
    }
}

async fn handle_text(text: &str, handle: &SessionHandle, state: &AppState) -> Flow {
    let started = Instant::now();
    metrics::record_message(text.len(), "inbound");

    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session = %handle.id(), error = %e, "Malformed client frame");
            metrics::record_error("decode");
            return Flow::Stop("malformed frame");
        }
    };

    if let Err(e) = state.auth.verify_present(frame.token.as_deref()) {
        warn!(session = %handle.id(), error = %e, "Rejected client frame");
        metrics::record_auth_failure("client");
        return Flow::Stop("authentication failed");
    }

    let kind = frame.request.kind().to_string();
    let result = match frame.request {
        ClientRequest::Subscribe { channels } => {
            metrics::record_subscription(channels.len());
            state.pool.subscribe(channels, handle.clone()).await
        }
        ClientRequest::Unsubscribe { channels } => {
            state.pool.unsubscribe(channels, handle.clone()).await
        }
        ClientRequest::Publish { channels, event } => {
            state
                .pool
                .publish(channels, Arc::new(event), Origin::Local)
                .await
        }
        ClientRequest::History { channel, consume } => {
            state.pool.history(channel, consume, handle.clone()).await
        }
        ClientRequest::Unknown(kind) => {
            debug!(session = %handle.id(), kind = %kind, "Unknown request type");
            if let Err(e) = handle.deliver(Outbound::InvalidRequest) {
                debug!(session = %handle.id(), error = %e, "Could not queue Invalid Request");
            }
            Ok(())
        }
    };

    metrics::record_latency(started.elapsed().as_secs_f64());
    match result {
        Ok(()) => {
            trace!(session = %handle.id(), kind = %kind, "Dispatched");
            Flow::Continue
        }
        Err(e) => {
            error!(session = %handle.id(), error = %e, "Worker pool unavailable");
            Flow::Stop("worker pool closed")
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    handle: SessionHandle,
    pool: PoolHandle,
    settings: SessionSettings,
) {
    let start = tokio::time::Instant::now() + settings.ping_period;
    let mut ticker = tokio::time::interval_at(start, settings.ping_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        let message = tokio::select! {
            () = handle.closed() => break "closed by reader",
            item = outbound.recv() => match item {
                Some(Outbound::Event(event)) => match encode_event(&event) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!(session = %handle.id(), event = %event.id, error = %e, "Failed to encode event");
                        continue;
                    }
                },
                Some(Outbound::InvalidRequest) => Message::Text(invalid_request()),
                None => break "outbound queue closed",
            },
            _ = ticker.tick() => Message::Ping(Vec::new()),
        };

        let size = match &message {
            Message::Text(text) => text.len(),
            _ => 0,
        };

        match tokio::time::timeout(settings.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {
                if size > 0 {
                    metrics::record_message(size, "outbound");
                }
            }
            Ok(Err(e)) => {
                debug!(session = %handle.id(), error = %e, "Write failed");
                break "write failed";
            }
            Err(_) => {
                warn!(session = %handle.id(), "Write deadline exceeded");
                break "write deadline exceeded";
            }
        }
    };

    close_session(&handle, &pool, reason).await;
    let _ = tokio::time::timeout(settings.write_wait, sink.close()).await;
}
