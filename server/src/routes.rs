//! HTTP route handlers for the telemetry relay.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - Bidirectional event channel
//! - `GET /api/v1/lat-long-logs` - Recent position log
//! - `POST /api/v1/send-competition-data` - Forward a competition payload
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The [`Relay`] holding the connection registry, position sink and
//!   forwarding gate
//! - The position store read by the history endpoint
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry_relay_server::config::Config;
//! use telemetry_relay_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::from_config(config).expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ws::WebSocket, DefaultBodyLimit, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::forwarding::{
    ClientIdentity, CompetitionForwarder, CompetitionSink, ForwardingFlag, ForwardingGate,
};
use crate::history::recent_positions;
use crate::influx::InfluxClient;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::sink::{PositionSink, PositionStore};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body size (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Event relay shared by every connection.
    pub relay: Relay,

    /// Store read by the history endpoint.
    pub store: Arc<dyn PositionStore>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Builds the production state: an InfluxDB-backed store and an mTLS
    /// competition forwarder.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if the client identity cannot be decoded or
    /// either HTTP client cannot be created.
    pub fn from_config(config: Config) -> Result<Self, ServerError> {
        let store = InfluxClient::new(
            &config.influxdb_host,
            &config.influxdb_token,
            &config.influxdb_database,
        )?;

        let identity =
            ClientIdentity::from_base64(&config.client_cert_base64, &config.client_key_base64)?;
        let forwarder = CompetitionForwarder::new(&config.competition_endpoint, Some(&identity))?;

        Ok(Self::with_components(
            config,
            Arc::new(store),
            Arc::new(forwarder),
        ))
    }

    /// Creates application state around custom store and forwarding
    /// implementations.
    ///
    /// The forwarding flag starts from `config.transmit_comp_data`.
    #[must_use]
    pub fn with_components(
        config: Config,
        store: Arc<dyn PositionStore>,
        competition: Arc<dyn CompetitionSink>,
    ) -> Self {
        let gate = ForwardingGate::new(ForwardingFlag::new(config.transmit_comp_data), competition);
        let relay = Relay::new(
            ConnectionRegistry::new(),
            PositionSink::new(Arc::clone(&store)),
            gate,
        );

        Self {
            config: Arc::new(config),
            relay,
            store,
            start_time: Instant::now(),
        }
    }

    /// The connection registry behind the relay.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        self.relay.registry()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("relay", &self.relay)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Every route allows any origin and is traced by `tower_http`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(get_ws))
        .route("/api/v1/lat-long-logs", get(get_lat_long_logs))
        .route(
            "/api/v1/send-competition-data",
            post(post_competition_data),
        )
        .route("/health", get(get_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

// ============================================================================
// GET /ws - Event Channel
// ============================================================================

/// GET /ws - Upgrade to the bidirectional event channel.
///
/// No authentication. Every text frame from the client goes through the
/// relay; every broadcast is sent to the client as a text frame.
async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.relay))
}

/// Handles an established WebSocket connection.
///
/// The connection is registered for the lifetime of this function and
/// deregistered when it returns.
async fn handle_websocket(socket: WebSocket, relay: Relay) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut connection = relay.registry().register();
    let connection_id = connection.id();

    info!(
        connection_id = %connection_id,
        connections = relay.registry().connection_count(),
        "WebSocket client connected"
    );

    // Spawn a task to forward broadcasts to the client
    let forward_task = tokio::spawn(async move {
        loop {
            match connection.recv().await {
                Ok(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => {
                        trace!(event = %frame.event, "Sending frame to WebSocket client");
                        if let Err(err) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %err, "Failed to send frame to WebSocket client");
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to serialize frame");
                    }
                },
                Err(RecvError::Lagged(count)) => {
                    warn!(skipped = count, "WebSocket client lagged, skipped frames");
                }
                Err(RecvError::Closed) => {
                    debug!("Connection registry closed");
                    break;
                }
            }
        }
    });

    // Process inbound frames in receipt order until the client goes away
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let handled = relay.handle_text(connection_id, text.as_str());
                trace!(connection_id = %connection_id, handled = ?handled, "Handled inbound frame");
            }
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "WebSocket client sent close frame");
                break;
            }
            Ok(_) => {
                // Binary, ping and pong frames carry no events
            }
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();
    info!(connection_id = %connection_id, "WebSocket client disconnected");
}

// ============================================================================
// GET /api/v1/lat-long-logs - Recent Positions
// ============================================================================

/// GET /api/v1/lat-long-logs - Last 24 hours of position samples.
///
/// # Responses
///
/// - `200 OK` - `[[timestamp, lat, long], ...]`, oldest first, at most 100
/// - `500 Internal Server Error` - The store could not be queried
async fn get_lat_long_logs(State(state): State<AppState>) -> Response {
    match recent_positions(state.store.as_ref()).await {
        Ok(rows) => {
            debug!(rows = rows.len(), "Served recent positions");
            Json(rows).into_response()
        }
        Err(err) => {
            error!(error = %err, "Failed to query recent positions");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("failed to query positions").with_code("store_unavailable")),
            )
                .into_response()
        }
    }
}

// ============================================================================
// POST /api/v1/send-competition-data - Competition Forwarding
// ============================================================================

/// POST /api/v1/send-competition-data - Forward a payload to the competition
/// endpoint.
///
/// The forwarding flag is not consulted on this path. The outcome is also
/// broadcast to every connection as `competition-data-result`.
///
/// # Responses
///
/// - The upstream status and body, when the endpoint answered
/// - `400 Bad Request` - Body is not JSON
/// - `502 Bad Gateway` - The endpoint could not be reached (empty body)
async fn post_competition_data(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "Invalid JSON in competition payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!("invalid JSON: {err}")).with_code("invalid_json")),
            )
                .into_response();
        }
    };

    let outcome = state.relay.forward_ungated(&payload).await;

    match outcome.status().and_then(|s| StatusCode::from_u16(s).ok()) {
        Some(status) => (status, outcome.body().unwrap_or_default().to_string()).into_response(),
        None => StatusCode::BAD_GATEWAY.into_response(),
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of open event channel connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// ```json
/// {"status": "ok", "connections": 3, "uptime_seconds": 3600}
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry().connection_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
