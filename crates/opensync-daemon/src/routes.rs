use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use opensync_transfer::{
    ACK_WAIT, MAX_FILE_SIZE, SendError, SenderConfig, TracingLogger, TransferLogger,
    sanitize_file_name, send_payload,
};

/// Largest accepted upload: the largest file a receiver will take. The whole
/// file is held in memory for the transfer.
const MAX_UPLOAD_BYTES: usize = MAX_FILE_SIZE as usize;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub ack_wait: Duration,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            ack_wait: ACK_WAIT,
            logger: Arc::new(TracingLogger),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        // Browser front-ends post from arbitrary origins.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("digest task failed: {0}")]
    Digest(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(e) => e.status(),
            ApiError::Send(SendError::InvalidFileName(_)) => StatusCode::BAD_REQUEST,
            ApiError::Send(SendError::TooLarge(_)) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Send(SendError::AckTimeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Send(SendError::Io(_) | SendError::ListenerClosed) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Digest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("upload failed ({}): {}", status, self);
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub file_name: String,
    pub bytes: u64,
    pub total_chunks: u64,
    pub retransmitted: u64,
    pub sha256: String,
    pub elapsed_ms: u64,
}

/// POST /upload: send the uploaded file to a receiver over UDP.
///
/// Multipart fields: `file` (with a filename) and `receiver_addr` or
/// `recipient` (`host:port`). Responds once the receiver has acknowledged the
/// whole file or the ack wait has run out.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut destination: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                let raw_name = field.file_name().unwrap_or("").to_string();
                let file_name = sanitize_file_name(&raw_name).ok_or_else(|| {
                    ApiError::BadRequest(format!("invalid file name {:?}", raw_name))
                })?;
                file = Some((file_name, field.bytes().await?));
            }
            "receiver_addr" | "recipient" => {
                destination = Some(field.text().await?.trim().to_string());
            }
            other => debug!("upload: ignoring field {:?}", other),
        }
    }

    let (file_name, payload) =
        file.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    let destination = destination
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing receiver_addr field".into()))?;
    let target = resolve(&destination).await?;

    info!(
        "upload: sending {} ({} bytes) to {} ({})",
        file_name,
        payload.len(),
        destination,
        target
    );

    // Hash alongside the transfer so the response can be checked against the receiver's log.
    let digest = tokio::task::spawn_blocking({
        let payload = payload.clone();
        move || hex::encode(Sha256::digest(&payload))
    });

    let mut config = SenderConfig::new(target, file_name.clone());
    config.ack_wait = state.ack_wait;
    config.logger = state.logger.clone();
    let sent = send_payload(config, payload).await;
    let sha256 = digest.await?;
    let sent = sent?;

    Ok(Json(UploadResponse {
        status: "transfer complete",
        file_name,
        bytes: sent.file_size,
        total_chunks: sent.total_chunks,
        retransmitted: sent.retransmitted,
        sha256,
        elapsed_ms: sent.elapsed.as_millis() as u64,
    }))
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn resolve(destination: &str) -> Result<SocketAddr, ApiError> {
    tokio::net::lookup_host(destination)
        .await
        .map_err(|e| ApiError::BadRequest(format!("cannot resolve {:?}: {}", destination, e)))?
        .next()
        .ok_or_else(|| ApiError::BadRequest(format!("{:?} resolved to no address", destination)))
}
