//! TUS 1.0.0 resumable upload endpoint.
//!
//! Five methods rooted at `/tus/`, extensions creation, termination
//! and expiration. Upload bytes stream through the core upload
//! service; this module only speaks HTTP framing and the TUS header
//! set.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
    routing::{head, options},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::TryStreamExt;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::debug;

use cinesync_core::models::UploadId;
use cinesync_core::upload::UploadService;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,termination,expiration";

const TUS_RESUMABLE: &str = "tus-resumable";
const UPLOAD_OFFSET: &str = "upload-offset";
const UPLOAD_LENGTH: &str = "upload-length";
const UPLOAD_METADATA: &str = "upload-metadata";
const UPLOAD_EXPIRES: &str = "upload-expires";
const UPLOAD_PIN: &str = "x-upload-pin";

const PATCH_CONTENT_TYPE: &str = "application/offset+octet-stream";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tus/", options(tus_options).post(tus_create))
        .route(
            "/tus/{id}",
            head(tus_head).patch(tus_patch).delete(tus_delete),
        )
        // Every response on this endpoint carries the protocol version.
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(TUS_RESUMABLE),
            HeaderValue::from_static(TUS_VERSION),
        ))
}

fn uploads(state: &AppState) -> AppResult<&UploadService> {
    state.uploads.as_deref().ok_or_else(|| {
        AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Upload endpoint is not available",
        )
    })
}

/// Non-OPTIONS requests must speak our protocol version.
fn require_tus_resumable(headers: &HeaderMap) -> AppResult<()> {
    match headers.get(TUS_RESUMABLE).and_then(|v| v.to_str().ok()) {
        Some(TUS_VERSION) => Ok(()),
        _ => Err(AppError::precondition_failed(format!(
            "Tus-Resumable: {TUS_VERSION} header is required"
        ))),
    }
}

fn check_pin(service: &UploadService, headers: &HeaderMap) -> AppResult<()> {
    let presented = headers.get(UPLOAD_PIN).and_then(|v| v.to_str().ok());
    service.check_pin(presented)?;
    Ok(())
}

fn parse_upload_id(raw: &str) -> AppResult<UploadId> {
    UploadId::parse(raw).map_err(|_| AppError::not_found(format!("Unknown upload {raw}")))
}

/// Parse `Upload-Metadata`: comma-separated `key base64value` pairs,
/// value optional per the TUS spec.
fn parse_metadata(raw: &str) -> AppResult<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, ' ');
        let key = parts
            .next()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::bad_request("Upload-Metadata key is empty"))?;
        let value = match parts.next() {
            None | Some("") => String::new(),
            Some(encoded) => {
                let bytes = BASE64.decode(encoded).map_err(|_| {
                    AppError::bad_request(format!("Upload-Metadata value for {key} is not base64"))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    AppError::bad_request(format!("Upload-Metadata value for {key} is not UTF-8"))
                })?
            }
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

async fn tus_options(State(state): State<AppState>) -> AppResult<Response> {
    let service = uploads(&state)?;
    let max_size = service.max_size().await;
    Response::builder()
        .status(StatusCode::OK)
        .header("Tus-Version", TUS_VERSION)
        .header("Tus-Extension", TUS_EXTENSIONS)
        .header("Tus-Max-Size", max_size.to_string())
        .body(Body::empty())
        .map_err(|e| AppError::internal(e.to_string()))
}

async fn tus_create(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let service = uploads(&state)?;
    require_tus_resumable(&headers)?;
    check_pin(service, &headers)?;

    let upload_length: i64 = headers
        .get(UPLOAD_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AppError::bad_request("Upload-Length header is required"))?;
    let metadata = match headers.get(UPLOAD_METADATA).and_then(|v| v.to_str().ok()) {
        Some(raw) => parse_metadata(raw)?,
        None => HashMap::new(),
    };

    let session = service.create(upload_length, &metadata).await?;
    debug!(upload_id = %session.id, "TUS creation accepted");

    Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, session.upload_url.as_str())
        .header("Upload-Offset", "0")
        .body(Body::empty())
        .map_err(|e| AppError::internal(e.to_string()))
}

async fn tus_head(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let service = uploads(&state)?;
    require_tus_resumable(&headers)?;
    check_pin(service, &headers)?;

    let id = parse_upload_id(&id)?;
    let session = service.head(&id).await?;
    let expires = session.expires_at(service.config().session_expiry_hours);

    Response::builder()
        .status(StatusCode::OK)
        .header("Upload-Offset", session.bytes_received.to_string())
        .header("Upload-Length", session.expected_bytes.to_string())
        .header("Upload-Expires", expires.to_rfc3339())
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::empty())
        .map_err(|e| AppError::internal(e.to_string()))
}

async fn tus_patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> AppResult<Response> {
    let service = uploads(&state)?;
    let headers = request.headers();
    require_tus_resumable(headers)?;
    check_pin(service, headers)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type != Some(PATCH_CONTENT_TYPE) {
        return Err(AppError::bad_request(format!(
            "PATCH requires Content-Type: {PATCH_CONTENT_TYPE}"
        )));
    }
    let offset: i64 = headers
        .get(UPLOAD_OFFSET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AppError::bad_request("Upload-Offset header is required"))?;

    let id = parse_upload_id(&id)?;
    let body = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let new_offset = service.patch(&id, offset, body).await?;

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Upload-Offset", new_offset.to_string())
        .body(Body::empty())
        .map_err(|e| AppError::internal(e.to_string()))
}

async fn tus_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let service = uploads(&state)?;
    require_tus_resumable(&headers)?;
    check_pin(service, &headers)?;

    let id = parse_upload_id(&id)?;
    service.cancel(&id).await?;

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .map_err(|e| AppError::internal(e.to_string()))
}
