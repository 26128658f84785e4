//! HTTP front end
//!
//! Serves the notification endpoint for application servers and the two
//! agent transports.
//!
//! # Routes
//!
//! - `PUT|GET <endpoint_prefix>/{token}` - Post `version=<n>` to a channel
//! - `GET <sockjs_prefix>/websocket` - Streaming transport
//! - `POST <sockjs_prefix>/{session}/xhr_send` - Upload protocol frames
//! - `POST <sockjs_prefix>/{session}/xhr` - Poll for queued frames
//! - `GET /health` - Liveness
//! - `GET /metrics` - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use pushrelay::config::RelayConfig;
//! use pushrelay::server::PushServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = PushServer::new(RelayConfig::new()).expect("Failed to create server");
//!     server.run().await.expect("Server failed");
//! }
//! ```

pub mod transport;

pub use transport::{Outbound, PollConnection, StreamConnection};

use crate::config::RelayConfig;
use crate::protocol::Uaid;
use crate::relay::{AgentContext, NotificationError, ReaperEvent, Relay};
use crate::session::Batch;
use crate::store::{self, DataStore};
use crate::{metrics, RelayError};
use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, State,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures::{stream, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Poll session ids and the agents their uploads established.
///
/// An agent keeps at most one session id; a newer one replaces it.
#[derive(Debug, Default)]
struct PollAgents {
    by_session: HashMap<String, Uaid>,
    by_agent: HashMap<Uaid, String>,
}

impl PollAgents {
    fn get(&self, session: &str) -> Option<Uaid> {
        self.by_session.get(session).copied()
    }

    fn insert(&mut self, session: &str, uaid: Uaid) {
        if let Some(previous) = self.by_session.get(session).copied() {
            if previous != uaid {
                self.by_agent.remove(&previous);
            }
        }
        if let Some(old_session) = self.by_agent.insert(uaid, session.to_string()) {
            if old_session != session {
                self.by_session.remove(&old_session);
            }
        }
        self.by_session.insert(session.to_string(), uaid);
    }

    fn remove(&mut self, session: &str) {
        if let Some(uaid) = self.by_session.remove(session) {
            self.by_agent.remove(&uaid);
        }
    }

    /// Drop every session whose agent fails `keep`. Returns how many went.
    fn retain(&mut self, mut keep: impl FnMut(&Uaid) -> bool) -> usize {
        let gone: Vec<String> = self
            .by_session
            .iter()
            .filter(|(_, uaid)| !keep(*uaid))
            .map(|(session, _)| session.clone())
            .collect();
        for session in &gone {
            self.remove(session);
        }
        gone.len()
    }

    fn len(&self) -> usize {
        self.by_session.len()
    }
}

/// Shared server state
struct AppState {
    relay: Arc<Relay>,
    poll_agents: Mutex<PollAgents>,
}

impl AppState {
    fn poll_agents(&self) -> MutexGuard<'_, PollAgents> {
        self.poll_agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn poll_agent(&self, session: &str) -> Option<Uaid> {
        self.poll_agents().get(session)
    }

    fn set_poll_agent(&self, session: &str, uaid: Option<Uaid>) {
        let mut agents = self.poll_agents();
        match uaid {
            Some(uaid) => agents.insert(session, uaid),
            None => agents.remove(session),
        }
    }

    /// Forget poll sessions whose agent was reaped or moved to a stream
    fn prune_poll_agents(&self) {
        let registry = self.relay.registry();
        let removed = self
            .poll_agents()
            .retain(|uaid| registry.get(uaid).is_some_and(|s| !s.is_streaming()));
        if removed > 0 {
            tracing::debug!(removed, "Pruned poll sessions");
        }
    }
}

/// Prune poll sessions after every reaper sweep until the reaper stops
fn spawn_poll_pruner(
    state: Arc<AppState>,
    mut events: broadcast::Receiver<ReaperEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ReaperEvent::SweepCompleted(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    state.prune_poll_agents();
                }
                Ok(ReaperEvent::Started) => {}
                Ok(ReaperEvent::Stopped) | Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Push server: router, transports and the reaper lifecycle
pub struct PushServer {
    config: RelayConfig,
    state: Arc<AppState>,
}

impl PushServer {
    /// Create a server with the datastore named in `config`
    pub fn new(config: RelayConfig) -> crate::Result<Self> {
        let store = store::open(&config.datastore)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: RelayConfig, store: Arc<dyn DataStore>) -> Self {
        let relay = Arc::new(Relay::from_config(&config, store));
        Self {
            config,
            state: Arc::new(AppState {
                relay,
                poll_agents: Mutex::new(PollAgents::default()),
            }),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.state.relay
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        let endpoint = self.config.endpoint_prefix.trim_end_matches('/');
        let sockjs = self.config.sockjs_prefix.trim_end_matches('/');

        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_text))
            .route(&format!("{}/{{token}}", endpoint), any(notification))
            .route(&format!("{}/websocket", sockjs), get(websocket))
            .route(&format!("{}/{{session}}/xhr_send", sockjs), post(xhr_send))
            .route(&format!("{}/{{session}}/xhr", sockjs), post(xhr_poll))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until SIGINT/SIGTERM, running the idle reaper alongside
    pub async fn run(self) -> crate::Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Server(format!("Failed to bind {}: {}", addr, e)))?;

        let reaper = match self.config.reaper_timeout() {
            Some(timeout) => {
                let reaper = self.state.relay.reaper(timeout);
                let pruner = spawn_poll_pruner(Arc::clone(&self.state), reaper.subscribe());
                Some((reaper.spawn(), pruner))
            }
            None => {
                tracing::info!("Idle reaper disabled");
                None
            }
        };

        tracing::info!(
            addr = %addr,
            endpoint = %self.config.notification_url(),
            ack_interval_ms = self.config.ack_interval,
            "Push server listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        if let Some((reaper, pruner)) = reaper {
            reaper.shutdown().await?;
            if let Err(e) = pruner.await {
                tracing::warn!(error = %e, "Poll session pruner failed");
            }
        }
        tracing::info!("Push server stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to set up SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

fn plain(status: StatusCode) -> Response {
    (status, status.canonical_reason().unwrap_or_default()).into_response()
}

async fn notification(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(token): Path<String>,
    body: String,
) -> Response {
    if method != Method::PUT && method != Method::GET {
        return plain(StatusCode::FORBIDDEN);
    }

    match state.relay.notify(&token, &body) {
        Ok(_) => plain(StatusCode::OK),
        Err(NotificationError::InvalidVersion(e)) => {
            tracing::debug!(error = %e, "Rejecting notification body");
            plain(StatusCode::BAD_REQUEST)
        }
        // unknown channels and stale versions are not the sender's problem
        Err(NotificationError::ChannelNotFound(_)) | Err(NotificationError::VersionConflict { .. }) => {
            plain(StatusCode::OK)
        }
        Err(NotificationError::Store(e)) => {
            tracing::error!(error = %e, "Notification failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_session(socket, state))
}

/// Drive one WebSocket: inbound frames go to the relay, outbound frames come
/// from the connection's channel
async fn stream_session(socket: WebSocket, state: Arc<AppState>) {
    let (conn, mut outbound) = StreamConnection::new();
    let mut ctx = AgentContext::streaming(conn.clone());
    let (mut sink, mut stream) = socket.split();
    let mut unsent = Vec::new();

    tracing::debug!("WebSocket opened");

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match state.relay.handle_frame(&mut ctx, text.as_str()) {
                        Ok(()) => {}
                        Err(RelayError::Codec(e)) => {
                            tracing::debug!(error = %e, "Dropping malformed frame");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Closing WebSocket after failure");
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket read failed");
                    break;
                }
            },
            next = outbound.recv() => match next {
                Some(Outbound::Frame(payload)) => {
                    if let Err(e) = sink.send(Message::Text(payload.clone().into())).await {
                        tracing::debug!(error = %e, "WebSocket write failed");
                        unsent.push(payload);
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    finish_stream(&state.relay, &ctx, &conn, &mut outbound, unsent);
    tracing::debug!(uaid = ?ctx.uaid, "WebSocket closed");
}

/// Tear down a stream. Frames the socket never took go back to the
/// agent's queue ahead of anything queued since, for its next hello.
fn finish_stream(
    relay: &Relay,
    ctx: &AgentContext,
    conn: &StreamConnection,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    mut unsent: Vec<String>,
) {
    conn.mark_closed();
    outbound.close();
    while let Ok(out) = outbound.try_recv() {
        if let Outbound::Frame(payload) = out {
            unsent.push(payload);
        }
    }
    relay.requeue(ctx, unsent);
    relay.disconnect(ctx);
}

/// Split an upload body into raw protocol frames
fn upload_frames(body: &str) -> Option<Vec<String>> {
    let frame = |value: Value| match value {
        Value::String(s) => Some(s),
        Value::Object(_) => Some(value.to_string()),
        _ => None,
    };

    match serde_json::from_str::<Value>(body).ok()? {
        Value::Array(items) => items.into_iter().map(frame).collect(),
        other => frame(other).map(|f| vec![f]),
    }
}

async fn xhr_send(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
    body: String,
) -> Response {
    let Some(frames) = upload_frames(&body) else {
        return (StatusCode::BAD_REQUEST, "Broken JSON encoding.").into_response();
    };

    let uaid = state.poll_agent(&session);
    if let Some(uaid) = &uaid {
        state.relay.enter_sending(uaid);
    }
    let mut ctx = AgentContext::polling(uaid);

    for frame in &frames {
        match state.relay.handle_frame(&mut ctx, frame) {
            Ok(()) => {}
            Err(RelayError::Codec(e)) => {
                tracing::debug!(session = %session, error = %e, "Dropping malformed frame");
            }
            Err(e) => {
                tracing::error!(session = %session, error = %e, "Upload failed");
                state.set_poll_agent(&session, ctx.uaid);
                return plain(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    state.set_poll_agent(&session, ctx.uaid);
    StatusCode::NO_CONTENT.into_response()
}

async fn xhr_poll(State(state): State<Arc<AppState>>, Path(session): Path<String>) -> Response {
    let json = |body: String| ([(header::CONTENT_TYPE, "application/json")], body).into_response();

    let Some(uaid) = state.poll_agent(&session) else {
        return json(transport::frames_body(&[]));
    };

    let (conn, reply) = PollConnection::new(uaid);
    if !state.relay.open_poll(&uaid, conn) {
        // agent was reaped or moved to a stream
        state.set_poll_agent(&session, None);
        return json(transport::frames_body(&[]));
    }

    match reply.await {
        Ok(batch) => poll_response(batch),
        Err(_) => json(transport::frames_body(&[])),
    }
}

enum PollBody {
    Unsent(String, Batch),
    Sent(Batch),
}

/// Respond with a batch, completing it only once the body has been taken.
/// A client that leaves earlier drops the body and the frames are requeued.
fn poll_response(batch: Batch) -> Response {
    let body = transport::frames_body(&batch.payloads());
    let chunks = stream::unfold(PollBody::Unsent(body, batch), |state| async move {
        match state {
            PollBody::Unsent(body, batch) => {
                Some((Ok::<_, Infallible>(Bytes::from(body)), PollBody::Sent(batch)))
            }
            PollBody::Sent(batch) => {
                batch.complete();
                None
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(chunks),
    )
        .into_response()
}
