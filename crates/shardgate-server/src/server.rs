//! `GatewayServer`: axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use shardgate_broker::BrokerAdapter;
use shardgate_core::metrics::{WS_CONNECTIONS_TOTAL, WS_REJECTED_TOTAL};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::gateway::session::run_session;
use crate::gateway::{CommandGateway, SessionTable, TokenValidator};
use crate::health::{self, HealthResponse, HealthSnapshot};
use crate::http::enqueue_command;
use crate::shutdown::ShutdownCoordinator;

/// Counts open sockets against `maxConnections`.
#[derive(Debug, Default)]
pub struct ConnectionLimiter {
    open: AtomicUsize,
}

impl ConnectionLimiter {
    /// Reserve a slot if fewer than `max` are open.
    pub fn try_acquire(self: &Arc<Self>, max: usize) -> Option<ConnectionPermit> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConnectionPermit {
                limiter: Arc::clone(self),
            })
    }

    /// Open sockets.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

/// One reserved connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let _ = self.limiter.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration.
    pub config: Arc<GatewayConfig>,
    /// Authenticated sessions.
    pub sessions: Arc<SessionTable>,
    /// Command routing and pending responses.
    pub commands: Arc<CommandGateway>,
    /// Handshake token validation.
    pub validator: Arc<dyn TokenValidator>,
    /// Broker adapter, for health.
    pub adapter: Arc<BrokerAdapter>,
    /// Open socket counter.
    pub connections: Arc<ConnectionLimiter>,
    /// Cancelled at shutdown.
    pub shutdown: CancellationToken,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The gateway server.
pub struct GatewayServer {
    state: AppState,
    shutdown: ShutdownCoordinator,
}

impl GatewayServer {
    /// Server over already-wired components.
    pub fn new(
        config: GatewayConfig,
        adapter: Arc<BrokerAdapter>,
        commands: Arc<CommandGateway>,
        sessions: Arc<SessionTable>,
        validator: Arc<dyn TokenValidator>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let state = AppState {
            config: Arc::new(config),
            sessions,
            commands,
            validator,
            adapter,
            connections: Arc::new(ConnectionLimiter::default()),
            shutdown: shutdown.token(),
            metrics: None,
            start_time: Instant::now(),
        };
        Self { state, shutdown }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/v1/commands", post(enqueue_command))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in the background until shutdown.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        info!(%addr, "gateway listening");
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                warn!(error = %err, "server stopped with error");
            }
        });
        Ok((addr, handle))
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Runtime configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(permit) = state.connections.try_acquire(state.config.max_connections) else {
        counter!(WS_REJECTED_TOTAL).increment(1);
        warn!(max = state.config.max_connections, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_session(socket, state, permit))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = HealthSnapshot {
        connections: state.connections.open(),
        sessions_by_type: state.sessions.counts_by_type(),
        pending_commands: state.commands.pending(),
        broker_connected: state.adapter.is_connected(),
    };
    Json(health::health_check(state.start_time, snapshot))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use shardgate_broker::{AdapterConfig, InMemoryBroker, Topology};
    use shardgate_core::payloads::{AuthRequest, TokenValidation};
    use shardgate_correlation::PendingRegistry;
    use tower::ServiceExt;

    use super::*;

    struct RejectAll;

    #[async_trait]
    impl TokenValidator for RejectAll {
        async fn validate(&self, _auth: &AuthRequest) -> shardgate_core::Result<TokenValidation> {
            Ok(TokenValidation::invalid("closed"))
        }
    }

    async fn make_server() -> GatewayServer {
        let adapter = BrokerAdapter::connect(
            Arc::new(InMemoryBroker::new()),
            Topology::gateway(),
            AdapterConfig::default(),
        )
        .await
        .unwrap();
        let sessions = Arc::new(SessionTable::new());
        let commands = Arc::new(CommandGateway::new(
            Arc::clone(&adapter),
            PendingRegistry::in_memory("gateway"),
            Arc::clone(&sessions),
            Duration::from_secs(5),
        ));
        GatewayServer::new(
            GatewayConfig::default(),
            adapter,
            commands,
            sessions,
            Arc::new(RejectAll),
            ShutdownCoordinator::new(),
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_command(client: Option<&str>, body: &str) -> Request<Body> {
        let mut req = Request::builder().method("POST").uri("/v1/commands");
        if let Some(client) = client {
            req = req.header("X-Client-ID", client);
        }
        req.header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[test]
    fn limiter_enforces_max_and_releases_on_drop() {
        let limiter = Arc::new(ConnectionLimiter::default());
        let a = limiter.try_acquire(2).unwrap();
        let _b = limiter.try_acquire(2).unwrap();
        assert!(limiter.try_acquire(2).is_none());
        drop(a);
        assert_eq!(limiter.open(), 1);
        assert!(limiter.try_acquire(2).is_some());
    }

    #[tokio::test]
    async fn health_reports_broker_and_sessions() {
        let server = make_server().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["activeSessions"], 0);
        assert_eq!(json["sessionsByType"]["DISCORD_BOT"], 0);
        assert_eq!(json["brokerConnected"], true);
    }

    #[tokio::test]
    async fn enqueue_returns_accepted_with_correlation_id() {
        let server = make_server().await;
        let req = Request::builder()
            .method("POST")
            .uri("/v1/commands")
            .header("X-Client-ID", "bot-1")
            .header("X-Correlation-ID", "http-1")
            .body(Body::from(r#"{"domain":"auth","action":"login"}"#))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["correlationId"], "http-1");
        assert_eq!(json["routingKey"], "command.auth.login");
        assert_eq!(server.state().commands.pending(), 1);
    }

    #[tokio::test]
    async fn enqueue_without_client_header_is_bad_request() {
        let server = make_server().await;
        let resp = server
            .router()
            .oneshot(post_command(None, r#"{"domain":"auth","action":"login"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "PROTOCOL_VIOLATION");
    }

    #[tokio::test]
    async fn enqueue_bad_body_or_domain_is_bad_request() {
        let server = make_server().await;
        let resp = server.router().oneshot(post_command(Some("bot-1"), "{oops")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = server
            .router()
            .oneshot(post_command(Some("bot-1"), r#"{"domain":"chess","action":"move"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "UNKNOWN_COMMAND");
    }

    #[tokio::test]
    async fn enqueue_after_broker_close_is_server_error() {
        let server = make_server().await;
        server.state().adapter.close().await;
        let resp = server
            .router()
            .oneshot(post_command(Some("bot-1"), r#"{"domain":"auth","action":"login"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(server.state().commands.pending(), 0);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let server = make_server().await;
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let server = make_server().await;
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }
}
