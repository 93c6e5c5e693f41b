//! HTTP API
//!
//! Thin JSON adapter over the orchestrator. When a token is configured every
//! route except `/api/health` requires `Authorization: Bearer <token>`.

use crate::config::WireGuardConfig;
use crate::orchestrator::PeerOrchestrator;
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use wgpeer_common::{keys, Error, ServerConfig, ServerInfo};

// ============================================================================
// State
// ============================================================================

/// What the API advertises about the server side of the tunnel
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub private_key_path: PathBuf,
    pub endpoint: Option<String>,
    pub client_allowed_ips: String,
    pub dns_server: Option<String>,
}

impl From<&WireGuardConfig> for ServerSettings {
    fn from(wg: &WireGuardConfig) -> Self {
        Self {
            private_key_path: wg.private_key_path.clone(),
            endpoint: wg.endpoint.clone(),
            client_allowed_ips: wg.client_allowed_ips.clone(),
            dns_server: wg.dns_server.clone(),
        }
    }
}

pub struct ApiState {
    pub orchestrator: Arc<PeerOrchestrator>,
    pub server: ServerSettings,
    pub token: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Error response carrying the engine error
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::DuplicateKey(_) => StatusCode::CONFLICT,
            Error::PoolExhausted { .. } | Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ConfigWriteFailed(_)
            | Error::ConfigParse(_)
            | Error::InterfaceApplyFailed(_)
            | Error::Timeout { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self.0);
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    let protected = Router::new()
        .route("/api/peers/new", post(create_peer_handler))
        .route("/api/peers/delete", post(delete_peer_handler))
        .route("/api/peers/list", get(list_peers_handler))
        .route("/api/peers/stats", get(peer_stats_handler))
        .route("/api/peers/check", get(check_handler))
        .route("/api/repair", post(repair_handler))
        .route("/api/config", get(server_config_handler))
        .route("/api/serverinfo", get(server_info_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn extract_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

async fn require_token(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    match extract_token(request.headers()) {
        Some(token) if token == expected => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Missing or invalid bearer token"})),
        )
            .into_response(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreatePeerRequest {
    pub days_valid: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeletePeerRequest {
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletePeerResponse {
    pub deleted: bool,
}

/// An empty body takes the defaults; anything else must be a valid request
fn parse_create_request(body: &[u8]) -> wgpeer_common::Result<CreatePeerRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreatePeerRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidArgument(format!("invalid create request: {}", e)))
}

async fn create_peer_handler(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req = parse_create_request(&body)?;
    let days = req
        .days_valid
        .unwrap_or(state.orchestrator.lifecycle().default_days_valid);

    let record = state.orchestrator.create_peer(days).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_peer_handler(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<DeletePeerRequest>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.orchestrator.delete_peer(&req.public_key).await?;
    Ok(Json(DeletePeerResponse { deleted }))
}

async fn list_peers_handler(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.list_peers()?))
}

async fn peer_stats_handler(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.peer_stats().await?))
}

async fn check_handler(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.check_consistency().await?))
}

async fn repair_handler(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    info!("Repair requested over API");
    Ok(Json(state.orchestrator.repair().await?))
}

async fn server_config_handler(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    let public_key = keys::derive_local_public_key(&state.server.private_key_path).await?;
    Ok(Json(ServerConfig {
        public_key,
        endpoint: state.server.endpoint.clone(),
        allowed_ips: state.server.client_allowed_ips.clone(),
        dns_server: state.server.dns_server.clone(),
    }))
}

async fn server_info_handler() -> ApiResult<impl IntoResponse> {
    let uptime = tokio::fs::read_to_string("/proc/uptime").await.map_err(Error::from)?;
    let loadavg = tokio::fs::read_to_string("/proc/loadavg").await.map_err(Error::from)?;
    Ok(Json(ServerInfo {
        uptime: format_uptime(&uptime)?,
        load: format_loadavg(&loadavg)?,
    }))
}

async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let health = state.orchestrator.health();
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// `/proc/uptime` seconds as `[Nd ]HH:MM:SS`
fn format_uptime(proc_uptime: &str) -> wgpeer_common::Result<String> {
    let secs: f64 = proc_uptime
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Internal(format!("unreadable uptime {:?}", proc_uptime.trim())))?;

    let total = secs as u64;
    let (days, rem) = (total / 86_400, total % 86_400);
    let hms = format!("{:02}:{:02}:{:02}", rem / 3600, rem % 3600 / 60, rem % 60);
    Ok(if days > 0 { format!("{}d {}", days, hms) } else { hms })
}

/// First three `/proc/loadavg` fields with two decimals
fn format_loadavg(proc_loadavg: &str) -> wgpeer_common::Result<String> {
    let loads: Vec<f64> = proc_loadavg
        .split_whitespace()
        .take(3)
        .map(|s| s.parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Internal(format!("unreadable load average: {}", e)))?;
    if loads.len() != 3 {
        return Err(Error::Internal("short load average".to_string()));
    }
    Ok(format!("{:.2} {:.2} {:.2}", loads[0], loads[1], loads[2]))
}
