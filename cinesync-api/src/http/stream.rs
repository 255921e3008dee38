//! Range-capable streaming of registered videos.
//!
//! `GET /video/{movie-id}` serves the whole file or a single byte
//! range; HEAD mirrors the headers without a body. Requests hold an
//! `Arc` snapshot of the registration, so deregistration never cancels
//! an in-flight read.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use cinesync_core::models::MovieId;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/video/{movie_id}", get(stream_video))
}

#[derive(Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

async fn stream_video(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> AppResult<Response> {
    let movie_id = MovieId::from_string(movie_id);
    let video = state
        .catalog
        .get(&movie_id)
        .ok_or_else(|| AppError::not_found(format!("No video registered as {movie_id}")))?;

    let range = match headers.get(header::RANGE).map(|v| v.to_str()) {
        None => None,
        Some(Ok(value)) => match parse_range_header(value, video.length) {
            Some(range) => Some(range),
            None => {
                debug!(movie_id = %movie_id, range = value, "Unsatisfiable range");
                return Ok(Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes */{}", video.length),
                    )
                    .body(Body::empty())
                    .map_err(|e| AppError::internal(e.to_string()))?);
            }
        },
        Some(Err(_)) => {
            return Ok(Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", video.length))
                .body(Body::empty())
                .map_err(|e| AppError::internal(e.to_string()))?)
        }
    };

    let (status, content_length, content_range) = match &range {
        Some(range) => (
            StatusCode::PARTIAL_CONTENT,
            range.end - range.start + 1,
            Some(format!(
                "bytes {}-{}/{}",
                range.start, range.end, video.length
            )),
        ),
        None => (StatusCode::OK, video.length, None),
    };

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        let mut file = tokio::fs::File::open(&video.path).await.map_err(|e| {
            warn!("Failed to open {:?}: {e}", video.path);
            AppError::internal("Video file not accessible")
        })?;
        if let Some(range) = &range {
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|e| {
                    warn!("Failed to seek in {:?}: {e}", video.path);
                    AppError::internal("Video file not seekable")
                })?;
            Body::from_stream(ReaderStream::new(file.take(content_length)))
        } else {
            Body::from_stream(ReaderStream::new(file))
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, video.content_type.as_str())
        .header(header::CONTENT_LENGTH, content_length.to_string())
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    builder
        .body(body)
        .map_err(|e| AppError::internal(e.to_string()))
}

/// Parse a single-range `Range` header against a file of `file_size`
/// bytes. `None` means malformed or unsatisfiable; both answer 416.
fn parse_range_header(range_str: &str, file_size: u64) -> Option<ByteRange> {
    let range_part = range_str.strip_prefix("bytes=")?;
    let (start_str, end_str) = range_part.split_once('-')?;

    let start = if start_str.is_empty() {
        // Suffix range: the final N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some(ByteRange {
            start: file_size.saturating_sub(suffix_len),
            end: file_size.checked_sub(1)?,
        });
    } else {
        start_str.parse::<u64>().ok()?
    };

    let end = if end_str.is_empty() {
        file_size.checked_sub(1)?
    } else {
        end_str.parse::<u64>().ok()?.min(file_size.saturating_sub(1))
    };

    if start <= end && start < file_size {
        Some(ByteRange { start, end })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ranges_parse() {
        assert_eq!(
            parse_range_header("bytes=100-199", 1_000),
            Some(ByteRange { start: 100, end: 199 })
        );
        assert_eq!(
            parse_range_header("bytes=0-0", 1_000),
            Some(ByteRange { start: 0, end: 0 })
        );
    }

    #[test]
    fn open_ended_range_caps_at_last_byte() {
        assert_eq!(
            parse_range_header("bytes=900-", 1_000),
            Some(ByteRange { start: 900, end: 999 })
        );
        // An end past the file is clamped, not rejected.
        assert_eq!(
            parse_range_header("bytes=900-5000", 1_000),
            Some(ByteRange { start: 900, end: 999 })
        );
    }

    #[test]
    fn suffix_range_takes_final_bytes() {
        assert_eq!(
            parse_range_header("bytes=-100", 1_000),
            Some(ByteRange { start: 900, end: 999 })
        );
    }

    #[test]
    fn malformed_and_unsatisfiable_ranges_are_rejected() {
        assert_eq!(parse_range_header("bytes=abc-def", 1_000), None);
        assert_eq!(parse_range_header("items=0-10", 1_000), None);
        assert_eq!(parse_range_header("bytes=200-100", 1_000), None);
        assert_eq!(parse_range_header("bytes=1000-", 1_000), None);
        assert_eq!(parse_range_header("bytes=-0", 1_000), None);
        assert_eq!(parse_range_header("bytes=0-10", 0), None);
    }
}
