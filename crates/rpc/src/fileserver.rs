//! Blob-serving router bound on the fixed file port.
//!
//! Other deployments fetch `GET /files/{peer_id}/{filename}` from here during
//! orchestrated transfers. Kept separate from the coordinator router so the
//! two can bind different ports, as the original deployment does.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;
use tracker_vault::{FileVault, VaultError};

use crate::server::bind_listener;

pub fn build_file_router(vault: FileVault) -> Router {
    Router::new()
        .route("/files/:peer_id/:filename", get(handle_serve_blob))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(vault)
}

pub async fn start_file_server(vault: FileVault, addr: &str) -> Result<()> {
    let app = build_file_router(vault);
    let listener = bind_listener(addr).await?;
    axum::serve(listener, app)
        .await
        .context("file server terminated unexpectedly")
}

async fn handle_serve_blob(
    State(vault): State<FileVault>,
    AxumPath((peer_id, filename)): AxumPath<(u64, String)>,
) -> Response {
    debug!(peer_id, filename = %filename, "serving blob");
    match vault.read(peer_id, &filename).await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(VaultError::NotFound(_)) | Err(VaultError::InvalidName(_)) => {
            (StatusCode::NOT_FOUND, "File not found").into_response()
        }
        Err(err) => {
            debug!(%err, "blob read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file").into_response()
        }
    }
}
