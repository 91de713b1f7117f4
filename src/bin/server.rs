//! Linkmark Sync Server
//!
//! Exposes the sync engine over HTTP for pull/push and WebSocket for
//! realtime fan-out.
//!
//! # Configuration
//!
//! Environment variables:
//! - `LINKMARK_PORT`: Port to listen on (default: 8080)
//! - `LINKMARK_DATABASE_PATH`: SQLite database path
//!   (default: ~/.local/share/linkmark-server/linkmark.db)
//! - `LINKMARK_CONFIG`: Path to config file
//!   (default: ~/.config/linkmark-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "user1"
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check (no auth required)
//! - `GET /me`: Current user info
//! - `POST /sync/delta`: Delta pull since a watermark
//! - `POST /sync/push`: Apply a batch of client changes
//! - `POST /sync/offline`: Two-phase offline reconciliation
//! - `GET /sync/events?deviceId=`: WebSocket stream of accepted changes

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, Request, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linkmark_sync::sync::{ChangeApplier, DeltaCollector, OfflineReconciler, SyncHub};
use linkmark_sync::{
    init_db, ApplyOutcome, DeltaResponse, EntityStore, OfflineSyncResponse, SyncEntity, SyncError,
};

// ============================================================================
// Configuration
// ============================================================================

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    user_id: String,
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// SQLite database path
    database_path: PathBuf,
    /// Path to config file
    config_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("LINKMARK_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let database_path = std::env::var("LINKMARK_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("linkmark-server")
                    .join("linkmark.db")
            });

        let config_path = std::env::var("LINKMARK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("linkmark-server")
                    .join("config.yaml")
            });

        Self {
            port,
            database_path,
            config_path,
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authenticated user info, added to request extensions after auth.
/// The authenticated user id is the owner id every sync operation is
/// scoped to.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

/// API key store - maps key -> AuthUser
#[derive(Debug, Clone)]
struct ApiKeyStore {
    keys: HashMap<String, AuthUser>,
}

impl ApiKeyStore {
    /// Load API keys from config file
    fn load(config_path: &PathBuf) -> Self {
        let keys = match std::fs::read_to_string(config_path) {
            Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                Ok(config) => {
                    let mut map = HashMap::new();
                    for entry in config.api_keys {
                        map.insert(
                            entry.key,
                            AuthUser {
                                user_id: entry.user_id,
                            },
                        );
                    }
                    tracing::info!("Loaded {} API key(s)", map.len());
                    map
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                HashMap::new()
            }
        };

        Self { keys }
    }

    /// Validate an API key and return the associated user
    fn validate(&self, key: &str) -> Option<AuthUser> {
        self.keys.get(key).cloned()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    api_keys: Arc<ApiKeyStore>,
    hub: Arc<SyncHub>,
    collector: DeltaCollector,
    applier: ChangeApplier,
    reconciler: OfflineReconciler,
}

/// Auth error response
#[derive(Serialize)]
struct AuthError {
    error: &'static str,
    message: &'static str,
}

/// Authentication middleware
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    // Extract Authorization header
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "invalid_auth",
                    message: "Authorization header must use Bearer scheme",
                }),
            )
                .into_response();
        }
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "missing_auth",
                    message: "Authorization header required",
                }),
            )
                .into_response();
        }
    };

    // Validate API key
    match state.api_keys.validate(api_key) {
        Some(user) => {
            // Add user info to request extensions
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                error: "invalid_key",
                message: "Invalid API key",
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Fatal sync error response. Conflicts and per-change failures are never
/// reported this way; they ride in the 200 body.
struct AppError(SyncError);

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "sync call failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": "sync_failed",
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current user response
#[derive(Serialize)]
struct MeResponse {
    user_id: String,
}

/// Get current user info (auth required)
async fn me(Extension(user): Extension<AuthUser>) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: user.user_id,
    })
}

/// Delta pull request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaRequest {
    #[serde(default)]
    last_sync_timestamp: Option<DateTime<Utc>>,
    device_id: String,
}

/// Delta pull since a watermark
async fn sync_delta(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(request): Json<DeltaRequest>,
) -> Result<Json<DeltaResponse>, AppError> {
    let response = state
        .collector
        .get_delta_changes(&user.user_id, request.last_sync_timestamp, &request.device_id)
        .await?;
    Ok(Json(response))
}

/// Push request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
    changes: Vec<SyncEntity>,
    device_id: String,
}

/// Apply a batch of client changes
async fn sync_push(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Json<ApplyOutcome> {
    let outcome = state
        .applier
        .apply_changes(&user.user_id, &request.changes, &request.device_id)
        .await;
    Json(outcome)
}

/// Offline reconciliation request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineSyncRequest {
    device_id: String,
    #[serde(default)]
    offline_changes: Vec<SyncEntity>,
    #[serde(default)]
    last_sync_timestamp: Option<DateTime<Utc>>,
}

/// Two-phase offline reconciliation: pull server deltas, then push the
/// device's queued changes
async fn sync_offline(
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
    Json(request): Json<OfflineSyncRequest>,
) -> Result<Json<OfflineSyncResponse>, AppError> {
    let response = state
        .reconciler
        .handle_offline_sync(
            &user.user_id,
            &request.device_id,
            &request.offline_changes,
            request.last_sync_timestamp,
        )
        .await?;
    Ok(Json(response))
}

/// Query parameters for the events stream
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsParams {
    device_id: String,
}

/// WebSocket stream of accepted changes for the authenticated owner.
///
/// Every message carries the change plus `excludeDeviceId`; echo
/// suppression is the client's job.
async fn sync_events(
    ws: WebSocketUpgrade,
    Query(params): Query<EventsParams>,
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state, user, params.device_id))
}

async fn handle_events_socket(
    socket: WebSocket,
    state: AppState,
    user: AuthUser,
    device_id: String,
) {
    let mut subscription = state.hub.subscribe(&user.user_id).await;
    let (mut sender, mut receiver) = socket.split();

    tracing::info!(owner_id = %user.user_id, device_id = %device_id, "events session opened");

    loop {
        tokio::select! {
            notice = subscription.recv() => match notice {
                Ok(notice) => {
                    let text = match serde_json::to_string(&notice) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode change notice");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // This session fell behind the channel buffer. Close
                    // the connection; the client reconnects and recovers
                    // via a delta pull, not message replay.
                    tracing::warn!(
                        owner_id = %user.user_id,
                        device_id = %device_id,
                        skipped,
                        "events session lagged, closing"
                    );
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // push-only stream; inbound frames ignored
                Some(Err(_)) => break,
            },
        }
    }

    tracing::info!(owner_id = %user.user_id, device_id = %device_id, "events session closed");
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "linkmark_server=info,linkmark_sync=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    tracing::info!("Database: {}", config.database_path.display());
    tracing::info!("Config file: {}", config.config_path.display());

    // Open the canonical store
    let pool = match init_db(config.database_path.clone()).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    let store = EntityStore::new(pool);

    // Load API keys
    let api_keys = Arc::new(ApiKeyStore::load(&config.config_path));

    // Build app state
    let hub = Arc::new(SyncHub::new());
    let applier = ChangeApplier::new(store.clone(), hub.clone());
    let state = AppState {
        api_keys,
        hub,
        collector: DeltaCollector::new(store.clone()),
        reconciler: OfflineReconciler::new(DeltaCollector::new(store.clone()), applier.clone()),
        applier,
    };

    // Build router
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/me", get(me))
        .route("/sync/delta", post(sync_delta))
        .route("/sync/push", post(sync_push))
        .route("/sync/offline", post(sync_offline))
        .route("/sync/events", get(sync_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
