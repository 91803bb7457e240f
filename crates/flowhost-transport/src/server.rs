//! WebSocket connection server with admission control, stats, and
//! broadcast.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use flowhost_core::{
    ErrorCode, ErrorCounters, HealthStatus, ServerConfig,
    error::DispatchError,
    traits::{FlowFileHandler, RunnerFactory},
};
use flowhost_registry::SessionRegistry;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::{dispatcher::ClientDispatcher, protocol::ServerMessage};

/// Shared server state behind every connection and route.
pub struct ServerState {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    errors: Arc<ErrorCounters>,
    runner_factory: Arc<dyn RunnerFactory>,
    file_handler: Arc<dyn FlowFileHandler>,
    /// client_id -> outbound sender plus connection metadata, for
    /// broadcast and the ops surface.
    connections: Mutex<HashMap<String, ConnectionEntry>>,
    active: AtomicUsize,
    total_connections: AtomicU64,
    messages_processed: AtomicU64,
    started_at: Instant,
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<String>,
    remote: SocketAddr,
    user_agent: String,
    connected_at: Instant,
}

/// One active connection as reported by the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub remote: String,
    pub user_agent: String,
    pub connected_secs: u64,
}

/// Aggregate server statistics for the health/ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_processed: u64,
    pub errors_total: u64,
    pub errors_by_kind: HashMap<String, u64>,
    pub uptime_secs: u64,
    pub health: HealthStatus,
}

/// Releases one admission slot and the broadcast registration when a
/// connection ends, however it ends.
struct ConnectionGuard {
    state: Arc<ServerState>,
    client_id: String,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.client_id);
    }
}

impl ServerState {
    /// Claim an admission slot, or fail with a structured overload error.
    ///
    /// The check-and-increment is a single atomic update so a burst of
    /// connections cannot overshoot the cap.
    fn try_admit(self: &Arc<Self>, client_id: &str) -> Result<ConnectionGuard, DispatchError> {
        let max = self.config.max_connections;
        let admitted = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            });
        match admitted {
            Ok(_) => {
                self.total_connections.fetch_add(1, Ordering::Relaxed);
                Ok(ConnectionGuard {
                    state: Arc::clone(self),
                    client_id: client_id.to_string(),
                })
            }
            Err(current) => Err(DispatchError::new(
                ErrorCode::ServerOverloaded,
                "Server is at capacity, try again later",
            )
            .with_detail("current", json!(current))
            .with_detail("max", json!(max))),
        }
    }

    fn register_connection(
        &self,
        client_id: &str,
        tx: mpsc::UnboundedSender<String>,
        remote: SocketAddr,
        user_agent: String,
    ) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                client_id.to_string(),
                ConnectionEntry {
                    tx,
                    remote,
                    user_agent,
                    connected_at: Instant::now(),
                },
            );
    }

    /// Metadata for every active connection.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                client_id: id.clone(),
                remote: entry.remote.to_string(),
                user_agent: entry.user_agent.clone(),
                connected_secs: entry.connected_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Send `payload` to every active connection except `exclude`.
    ///
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, payload: &ServerMessage, exclude: Option<&str>) -> usize {
        let Ok(text) = serde_json::to_string(payload) else {
            return 0;
        };
        let connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections
            .iter()
            .filter(|(id, _)| exclude != Some(id.as_str()))
            .filter(|(_, entry)| entry.tx.send(text.clone()).is_ok())
            .count()
    }

    /// Aggregate stats snapshot.
    #[must_use]
    pub fn stats(&self) -> ServerStatsSnapshot {
        let processed = self.messages_processed.load(Ordering::Relaxed);
        ServerStatsSnapshot {
            active_connections: self.active.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_processed: processed,
            errors_total: self.errors.total(),
            errors_by_kind: self.errors.snapshot(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            health: self.errors.health(processed),
        }
    }
}

/// Accepts WebSocket connections and owns one dispatcher per connection.
pub struct ConnectionServer {
    state: Arc<ServerState>,
}

impl ConnectionServer {
    /// Wire a server from its collaborators.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        errors: Arc<ErrorCounters>,
        runner_factory: Arc<dyn RunnerFactory>,
        file_handler: Arc<dyn FlowFileHandler>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                registry,
                errors,
                runner_factory,
                file_handler,
                connections: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                total_connections: AtomicU64::new(0),
                messages_processed: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    /// Shared state handle, for broadcast and stats from outside the
    /// router.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Build the axum router: `/ws` upgrade plus the ops surface.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.state))
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let stats = state.stats();
    Json(json!({
        "status": stats.health,
        "uptime_secs": stats.uptime_secs,
        "active_connections": stats.active_connections,
    }))
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let server = state.stats();
    let registry = state.registry.stats();
    Json(json!({
        "server": server,
        "connections": state.connections(),
        "sessions": registry,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote, user_agent))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    remote: SocketAddr,
    user_agent: String,
) {
    let client_id = Uuid::new_v4().to_string();

    // Admission control happens before anything else; at capacity the
    // client gets a structured notice and the socket closes, unqueued.
    let guard = match state.try_admit(&client_id) {
        Ok(guard) => guard,
        Err(err) => {
            state.errors.record(err.code);
            tracing::warn!(%remote, "connection rejected: server at capacity");
            let mut socket = socket;
            if let Ok(text) = serde_json::to_string(&ServerMessage::error(&err)) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    tracing::info!(client_id, %remote, user_agent, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound channel; one task owns the socket sink.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    state.register_connection(&client_id, tx.clone(), remote, user_agent);

    let (mut dispatcher, mut events_rx) = ClientDispatcher::new(
        client_id.clone(),
        state.config.clone(),
        Arc::clone(&state.registry),
        Arc::clone(&state.errors),
        Arc::clone(&state.runner_factory),
        Arc::clone(&state.file_handler),
    );

    send_message(
        &tx,
        &ServerMessage::ConnectionEstablished {
            client_id: client_id.clone(),
            message: "Connected to flowhost".to_string(),
        },
    );

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(client_id, error = %e, "websocket error");
                        break;
                    }
                };
                state.messages_processed.fetch_add(1, Ordering::Relaxed);
                if let Some(response) = dispatcher.handle_message(&text).await {
                    send_message(&tx, &response);
                }
            }
            event = events_rx.recv() => {
                // The sender side lives in this dispatcher, so the channel
                // cannot close while we hold it.
                let Some(event) = event else { break };
                if let Some(notification) = dispatcher.handle_runner_event(event) {
                    send_message(&tx, &notification);
                }
            }
        }
    }

    let removed = state.registry.remove_all_for_client(&client_id).await;
    send_task.abort();
    drop(guard);
    tracing::info!(client_id, sessions_removed = removed, "client disconnected");
}

fn send_message(tx: &mpsc::UnboundedSender<String>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            let _ = tx.send(text);
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize outbound message"),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use flowhost_core::traits::{
        CreatedRunner, EventSender, FileHandlerError, RunnerError, SessionId,
    };
    use serde_json::Value;

    use super::*;

    struct NoRunners;

    #[async_trait]
    impl RunnerFactory for NoRunners {
        async fn create(
            &self,
            _session_id: SessionId,
            _flow: &Value,
            _events: EventSender,
        ) -> Result<CreatedRunner, RunnerError> {
            Err(RunnerError::SpawnFailed("not available in tests".into()))
        }
    }

    struct NoFiles;

    #[async_trait]
    impl FlowFileHandler for NoFiles {
        async fn save(&self, _path: &str, _flow: &Value) -> Result<String, FileHandlerError> {
            Err(FileHandlerError::Failed("not available in tests".into()))
        }
        async fn convert(
            &self,
            _flow: &Value,
            _format: Option<&str>,
        ) -> Result<String, FileHandlerError> {
            Err(FileHandlerError::Failed("not available in tests".into()))
        }
    }

    fn server(max_connections: usize) -> ConnectionServer {
        let errors = Arc::new(ErrorCounters::new());
        ConnectionServer::new(
            ServerConfig::default().with_max_connections(max_connections),
            Arc::new(SessionRegistry::new(Arc::clone(&errors))),
            errors,
            Arc::new(NoRunners),
            Arc::new(NoFiles),
        )
    }

    #[test]
    fn admission_cap_rejects_with_counts() {
        let state = server(1).state();

        let first = state.try_admit("a").expect("first connection admitted");

        let err = state.try_admit("b").unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerOverloaded);
        assert_eq!(err.details["current"], json!(1));
        assert_eq!(err.details["max"], json!(1));

        // Slot frees when the first connection ends.
        drop(first);
        let _third = state.try_admit("c").expect("slot released");
    }

    fn test_remote() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn broadcast_skips_excluded_and_dead() {
        let state = server(10).state();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        drop(rx_dead);
        state.register_connection("a", tx_a, test_remote(), "t".into());
        state.register_connection("b", tx_b, test_remote(), "t".into());
        state.register_connection("dead", tx_dead, test_remote(), "t".into());

        let delivered = state.broadcast(
            &ServerMessage::ConnectionEstablished {
                client_id: "x".into(),
                message: "hi".into(),
            },
            Some("a"),
        );
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn connections_retain_metadata() {
        let state = server(10).state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote: SocketAddr = "10.0.0.8:5151".parse().unwrap();
        state.register_connection("c1", tx, remote, "flowhost-cli/1.0".into());

        let infos = state.connections();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].client_id, "c1");
        assert_eq!(infos[0].remote, "10.0.0.8:5151");
        assert_eq!(infos[0].user_agent, "flowhost-cli/1.0");
    }

    #[test]
    fn stats_start_healthy() {
        let state = server(10).state();
        let stats = state.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.messages_processed, 0);
        assert_eq!(stats.health, HealthStatus::Healthy);
    }
}
