use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracker_index::{ContentIndex, IndexError};
use tracker_registry::{PeerRegistry, RegistryError};
use tracker_relay::SignalRelay;
use tracker_transfer::{TransferError, TransferOrchestrator};
use tracker_types::{ContentHash, ContentRecord, Peer, PeerAddr};

use crate::ws::handle_ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PeerRegistry>,
    pub index: Arc<ContentIndex>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub relay: Arc<SignalRelay>,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    pub transfer_count: Arc<AtomicUsize>,
}

impl AppState {
    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub(crate) type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    uptime_secs: u64,
    peer_count: usize,
    file_count: usize,
    open_connections: usize,
    req_total: u64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub peer_id: u64,
    pub source_peer_id: u64,
    pub filename: String,
    /// Optional pinned content hash (hex); when present the received bytes
    /// must re-hash to exactly this value.
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidAddress(_) => ApiError::bad_request(err.to_string()),
            RegistryError::UnknownPeer(_) => ApiError::not_found(err.to_string()),
            RegistryError::Storage(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::UnknownPeer(_) | IndexError::UnknownContent(_) => {
                ApiError::not_found(err.to_string())
            }
            IndexError::Storage(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Validation(_) => ApiError::bad_request(err.to_string()),
            TransferError::NotFound(_) => ApiError::not_found(err.to_string()),
            TransferError::UpstreamUnavailable(_) => ApiError::bad_gateway(err.to_string()),
            TransferError::Storage(_) => ApiError::internal(err.to_string()),
        }
    }
}

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let shared = Arc::new(state);
    let app = build_router(shared);
    let listener = bind_listener(addr).await?;
    axum::serve(listener, app)
        .await
        .context("coordinator server terminated unexpectedly")
}

pub(crate) async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/register", post(handle_register))
        .route("/peers", get(handle_list_peers))
        .route("/upload", post(handle_upload))
        .route("/files", get(handle_list_files))
        .route("/sources/:hash", get(handle_sources))
        .route("/peer_files/:peer_id", get(handle_peer_files))
        .route("/download", post(handle_download))
        .route("/ws", get(handle_ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let req_total = state.record_request();
    let peer_count = state.registry.list()?.len();
    let file_count = state.index.all_files()?.len();

    Ok(Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_seconds(),
        peer_count,
        file_count,
        open_connections: state.relay.open_connections(),
        req_total,
    }))
}

async fn handle_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let req_total = state.record_request();
    let uptime = state.uptime_seconds();
    let peer_count = state.registry.list()?.len();
    let file_count = state.index.all_files()?.len();
    let open_connections = state.relay.open_connections();
    let transfers = state.transfer_count.load(Ordering::Relaxed);

    let mut metrics =
        "# HELP tracker_http_requests_total Total number of requests handled\n".to_string();
    metrics.push_str("# TYPE tracker_http_requests_total counter\n");
    metrics.push_str(&format!("tracker_http_requests_total {req_total}\n"));
    metrics.push_str("# HELP tracker_uptime_seconds Uptime of the coordinator in seconds\n");
    metrics.push_str("# TYPE tracker_uptime_seconds gauge\n");
    metrics.push_str(&format!("tracker_uptime_seconds {uptime}\n"));
    metrics.push_str("# HELP tracker_registered_peers Registered peer count\n");
    metrics.push_str("# TYPE tracker_registered_peers gauge\n");
    metrics.push_str(&format!("tracker_registered_peers {peer_count}\n"));
    metrics.push_str("# HELP tracker_content_records Distinct content records indexed\n");
    metrics.push_str("# TYPE tracker_content_records gauge\n");
    metrics.push_str(&format!("tracker_content_records {file_count}\n"));
    metrics.push_str("# HELP tracker_open_connections Open signaling connections\n");
    metrics.push_str("# TYPE tracker_open_connections gauge\n");
    metrics.push_str(&format!("tracker_open_connections {open_connections}\n"));
    metrics.push_str("# HELP tracker_transfers_total Completed uploads and orchestrated downloads\n");
    metrics.push_str("# TYPE tracker_transfers_total counter\n");
    metrics.push_str(&format!("tracker_transfers_total {transfers}\n"));

    let mut response = Response::new(Body::from(metrics));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}

async fn handle_register(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Peer>, ApiError> {
    state.record_request();
    let peer = state.registry.register(&request.address)?;
    Ok(Json(peer))
}

async fn handle_list_peers(State(state): State<SharedState>) -> Result<Json<Vec<Peer>>, ApiError> {
    state.record_request();
    Ok(Json(state.registry.list()?))
}

async fn handle_upload(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<ContentRecord>, ApiError> {
    state.record_request();

    let mut peer_id: Option<u64> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("peer_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("unreadable peer_id: {e}")))?;
                let id = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ApiError::bad_request("invalid peer_id format"))?;
                peer_id = Some(id);
            }
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(|name| name.to_string())
                    .ok_or_else(|| ApiError::bad_request("file field is missing a filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("unreadable file field: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let peer_id = peer_id.ok_or_else(|| ApiError::bad_request("missing peer_id"))?;
    let (filename, bytes) =
        file.ok_or_else(|| ApiError::bad_request("missing file upload field"))?;

    let record = state
        .orchestrator
        .record_upload(peer_id, &filename, &bytes)
        .await?;
    state.transfer_count.fetch_add(1, Ordering::Relaxed);
    Ok(Json(record))
}

async fn handle_list_files(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ContentRecord>>, ApiError> {
    state.record_request();
    Ok(Json(state.index.all_files()?))
}

/// Sources are an address+port projection only; an unknown hash yields an
/// empty list, never a 404.
async fn handle_sources(
    State(state): State<SharedState>,
    AxumPath(hash): AxumPath<String>,
) -> Result<Json<Vec<PeerAddr>>, ApiError> {
    state.record_request();
    let hash = ContentHash::from_hex(&hash)
        .map_err(|e| ApiError::bad_request(format!("invalid content hash: {e}")))?;

    let sources = state
        .index
        .sources_for(&hash)?
        .iter()
        .map(PeerAddr::from)
        .collect();
    Ok(Json(sources))
}

async fn handle_peer_files(
    State(state): State<SharedState>,
    AxumPath(peer_id): AxumPath<u64>,
) -> Result<Json<Vec<ContentRecord>>, ApiError> {
    state.record_request();
    Ok(Json(state.index.files_for(peer_id)?))
}

async fn handle_download(
    State(state): State<SharedState>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<ContentRecord>, ApiError> {
    state.record_request();

    let pinned = request
        .hash
        .as_deref()
        .map(ContentHash::from_hex)
        .transpose()
        .map_err(|e| ApiError::bad_request(format!("invalid content hash: {e}")))?;

    // Spawned so a requester dropping its request cannot cancel a fetch that
    // is already in flight; the transfer runs to completion or timeout.
    let orchestrator = state.orchestrator.clone();
    let record = tokio::spawn(async move {
        orchestrator
            .orchestrate_download(
                request.peer_id,
                request.source_peer_id,
                &request.filename,
                pinned,
            )
            .await
    })
    .await
    .map_err(|e| ApiError::internal(format!("download task failed: {e}")))??;

    state.transfer_count.fetch_add(1, Ordering::Relaxed);
    Ok(Json(record))
}
