use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{AuthResolver, Credentials},
    config::Config,
    error::{FleetError, Result},
    store::{Command, DeviceView, Store, StoreOptions},
    token::SessionKeys,
};

#[derive(Clone)]
pub struct AppState {
    store: Arc<Store>,
    auth: Arc<AuthResolver>,
}

impl AppState {
    pub fn new(store: Arc<Store>, auth: Arc<AuthResolver>) -> Self {
        Self { store, auth }
    }
}

/// Telemetry payload posted by the reporting agent. The full body is stored
/// as the device's opaque last payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub device_id: String,
    pub hostname: String,
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub uptime_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub ok: bool,
    pub ts_utc: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub command: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub ok: bool,
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    pub acked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Starts the dispatch API on the configured port and serves until SIGINT or
/// SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    config.ensure_data_dir()?;
    let store = Arc::new(Store::open(config.db_path(), StoreOptions::from(&config))?);
    store.ensure_default_org(&config.default_org_name, config.default_org_token()?)?;

    let sessions = SessionKeys::new(config.session_secret()?);
    let auth = Arc::new(AuthResolver::new(Arc::clone(&store), sessions));
    let state = AppState::new(store, auth);

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("fleetdbx server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/devices", get(list_devices))
        .route(
            "/devices/{device_id}/commands",
            post(enqueue_command).get(list_commands),
        )
        .route("/devices/{device_id}/commands/next", get(next_command))
        .route(
            "/devices/{device_id}/commands/{command_id}/ack",
            post(ack_command),
        )
        .route("/devices/{device_id}/reassign", post(reassign_device))
        .with_state(state)
}

async fn health() -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>> {
    let credentials = Credentials::from_headers(&headers).org_only();
    let org_id = state.auth.resolve(&credentials)?;

    if request.device_id.trim().is_empty() {
        return Err(FleetError::Malformed("device_id must not be empty".into()));
    }

    let now = Utc::now();
    let payload = serde_json::to_value(&request)?;
    state
        .store
        .upsert_device(&request.device_id, org_id, &request.hostname, &payload, now)?;
    Ok(Json(IngestResponse { ok: true, ts_utc: now }))
}

async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceView>>> {
    let credentials = Credentials::from_headers(&headers).session_only();
    let org_id = state.auth.resolve(&credentials)?;
    let devices = state.store.list_devices(org_id, Utc::now())?;
    Ok(Json(devices))
}

async fn enqueue_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>> {
    let credentials = Credentials::from_headers(&headers);
    let org_id = state.auth.resolve(&credentials)?;

    if request.command.trim().is_empty() {
        return Err(FleetError::Malformed("command must not be empty".into()));
    }

    let command = state.store.enqueue_command(
        &device_id,
        org_id,
        &request.command,
        request.args,
        Utc::now(),
    )?;
    Ok(Json(EnqueueResponse {
        ok: true,
        id: command.id,
        created_at: command.created_at,
    }))
}

async fn list_commands(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Command>>> {
    let credentials = Credentials::from_headers(&headers);
    let org_id = state.auth.resolve(&credentials)?;
    let commands = state.store.list_commands(&device_id, org_id)?;
    Ok(Json(commands))
}

async fn next_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Option<Command>>> {
    let credentials = Credentials::from_headers(&headers).org_only();
    let org_id = state.auth.resolve(&credentials)?;
    let command = state.store.next_command(&device_id, org_id, Utc::now())?;
    Ok(Json(command))
}

async fn ack_command(
    State(state): State<AppState>,
    Path((device_id, command_id)): Path<(String, i64)>,
    headers: HeaderMap,
    Json(request): Json<AckRequest>,
) -> Result<Json<AckResponse>> {
    let credentials = Credentials::from_headers(&headers);
    let org_id = state.auth.resolve(&credentials)?;
    let command = state.store.ack_command(
        command_id,
        &device_id,
        org_id,
        request.success,
        request.message.as_deref(),
        Utc::now(),
    )?;
    Ok(Json(AckResponse {
        ok: true,
        acked_at: command.acked_at.unwrap_or_else(Utc::now),
    }))
}

async fn reassign_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OkResponse>> {
    let credentials = Credentials::from_headers(&headers).session_only();
    let org_id = state.auth.resolve(&credentials)?;
    state.store.reassign_device(&device_id, org_id)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
