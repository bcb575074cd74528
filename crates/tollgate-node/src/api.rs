//! HTTP API server for the Tollgate node.
//!
//! Thin pass-through to [`SessionService`](tollgate_session::SessionService):
//! wallet generation, session listing and lookup, extend, end and manual
//! withdrawal, plus the runtime price setting.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tollgate_core::{Amount, SessionId, WalletId};
use tollgate_session::{SessionError, SessionView, WalletView};

use crate::state::NodeState;

// --- Request / response types ---

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub host_address: String,
    pub active_sessions: usize,
    pub uptime_secs: u64,
}

#[derive(Deserialize)]
pub struct CreateWalletRequest {
    /// Device to grant access once the wallet is funded.
    #[serde(default)]
    pub device_id: String,
}

#[derive(Deserialize)]
pub struct ExtendRequest {
    pub amount_ckb: u64,
}

#[derive(Deserialize, Default)]
pub struct WithdrawRequest {
    #[serde(default)]
    pub to_address: Option<String>,
}

#[derive(Serialize)]
pub struct SettingsResponse {
    pub rate_per_hour: u64,
    pub channel_setup_ckb: u64,
    /// Smallest wallet balance that buys an hour.
    pub minimum_ckb: u64,
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub rate_per_hour: u64,
}

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionView>,
    pub count: usize,
}

#[derive(Serialize)]
pub struct WithdrawResponse {
    pub tx_hash: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: SessionError) -> ApiError {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if e.is_rejection() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "API request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| api_error(SessionError::InvalidInput(format!("invalid session id: {}", raw))))
}

fn parse_wallet_id(raw: &str) -> Result<WalletId, ApiError> {
    raw.parse()
        .map_err(|_| api_error(SessionError::InvalidInput(format!("invalid wallet id: {}", raw))))
}

// --- Handlers ---

async fn handle_health(State(state): State<Arc<NodeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        host_address: state.host_address.clone(),
        active_sessions: state.active_sessions().await,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn handle_create_wallet(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<CreateWalletRequest>,
) -> Result<(StatusCode, Json<WalletView>), ApiError> {
    let wallet = state
        .service
        .create_wallet(&req.device_id)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(wallet)))
}

async fn handle_get_wallet(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
) -> Result<Json<WalletView>, ApiError> {
    let id = parse_wallet_id(&id)?;
    state.service.get_wallet(&id).map(Json).map_err(api_error)
}

async fn handle_list_sessions(
    State(state): State<Arc<NodeState>>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let sessions = state.service.list_sessions().map_err(api_error)?;
    let count = sessions.len();
    Ok(Json(SessionsResponse { sessions, count }))
}

async fn handle_get_session(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let id = parse_session_id(&id)?;
    state.service.get_session(&id).map(Json).map_err(api_error)
}

async fn handle_extend(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let id = parse_session_id(&id)?;
    let amount = Amount::from_ckb(req.amount_ckb as u128)
        .map_err(|e| api_error(SessionError::Core(e)))?;
    state
        .service
        .extend(&id, amount)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn handle_end(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let id = parse_session_id(&id)?;
    state.service.end(&id).await.map(Json).map_err(api_error)
}

async fn handle_withdraw(
    State(state): State<Arc<NodeState>>,
    Path(id): Path<String>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<WithdrawResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let tx_hash = state
        .service
        .withdraw(&id, req.to_address.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(WithdrawResponse { tx_hash }))
}

fn settings(state: &NodeState) -> SettingsResponse {
    let rate_per_hour = state.service.rate_per_hour();
    SettingsResponse {
        rate_per_hour,
        channel_setup_ckb: state.channel_setup_ckb,
        minimum_ckb: state.channel_setup_ckb.saturating_add(rate_per_hour),
    }
}

async fn handle_get_settings(State(state): State<Arc<NodeState>>) -> Json<SettingsResponse> {
    Json(settings(&state))
}

async fn handle_update_settings(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<SettingsResponse>, ApiError> {
    state
        .service
        .set_rate_per_hour(req.rate_per_hour)
        .map_err(api_error)?;
    Ok(Json(settings(&state)))
}

// --- Server ---

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/wallets", post(handle_create_wallet))
        .route("/api/v1/wallets/{id}", get(handle_get_wallet))
        .route("/api/v1/sessions", get(handle_list_sessions))
        .route("/api/v1/sessions/{id}", get(handle_get_session))
        .route("/api/v1/sessions/{id}/extend", post(handle_extend))
        .route("/api/v1/sessions/{id}/end", post(handle_end))
        .route("/api/v1/sessions/{id}/withdraw", post(handle_withdraw))
        .route(
            "/api/v1/settings",
            get(handle_get_settings).put(handle_update_settings),
        )
        .with_state(state)
}

/// Serve the API on an already bound listener until `cancel` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<NodeState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP API server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

pub async fn start_api_server(
    listen_addr: SocketAddr,
    state: Arc<NodeState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    serve(listener, state, cancel).await
}
