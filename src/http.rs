//! HTTP surface: `/files/{path}`, `/list/{path}` and `/version`.
//!
//! Uploads are staged to disk on the blocking pool before any lock is
//! taken, downloads stream straight from the blob file, and listings
//! stream one line per link; nothing buffers a whole payload in memory.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};

use crate::fallback::{FallbackRoute, FallbackStrategy};
use crate::storage::{DeleteStatus, FileStorage, StorageError};

/// Protocol version advertised to clients for capability negotiation.
pub const PROTOCOL_VERSION: u32 = 2;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<FileStorage>,
    pub fallback: Option<Arc<dyn FallbackStrategy>>,
}

/// Builds the service router. `get` routes also answer HEAD with the body
/// elided, which is all HEAD needs here.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/version", get(protocol_version))
        .route(
            "/files/*path",
            get(get_file).put(put_file).delete(delete_file),
        )
        .route("/list/", get(list_root))
        .route("/list/*path", get(list_files))
        .with_state(state)
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(path) => ApiError::NotFound(path),
            StorageError::BadPayload(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(path) => {
                (StatusCode::NOT_FOUND, format!("File not found: {path}")).into_response()
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

#[derive(Deserialize)]
struct VersionQuery {
    last_modified: Option<String>,
}

/// GET /version - protocol advertisement
async fn protocol_version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "protocol_versions": [PROTOCOL_VERSION] }))
}

/// GET /files/{path} - stream a file
async fn get_file(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = canonical_path(&path)?;
    let record = match state.storage.lookup(&path)? {
        Some(record) => record,
        None => return miss(&state, &path).await,
    };

    let (file, stored_len) = match state.storage.open_blob(&record.digest).await {
        Ok(opened) => opened,
        // The only window where a link outlives its blob is between a
        // concurrent delete's commit and its unlink.
        Err(StorageError::BlobMissing(_)) => return miss(&state, &path).await,
        Err(e) => return Err(e.into()),
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::LAST_MODIFIED, format_http_date(record.version))
        .header(header::ETAG, format!("\"{}\"", record.digest))
        .header("logical-size", record.logical_size.to_string());

    let response = if record.compressed && accepts_gzip(&headers) {
        builder
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_LENGTH, stored_len.to_string())
            .body(Body::from_stream(ReaderStream::new(file)))
    } else if record.compressed {
        let decoder =
            async_compression::tokio::bufread::GzipDecoder::new(tokio::io::BufReader::new(file));
        builder.body(Body::from_stream(ReaderStream::new(decoder)))
    } else {
        builder
            .header(header::CONTENT_LENGTH, stored_len.to_string())
            .body(Body::from_stream(ReaderStream::new(file)))
    };
    response.map_err(|e| ApiError::Internal(e.to_string()))
}

/// PUT /files/{path}?last_modified= - store a file
async fn put_file(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let path = canonical_path(&path)?;
    let version = required_version(&query)?;
    let compressed = content_encoding_is_gzip(&headers)?;
    let declared_digest = declared_checksum(&headers)?;
    let declared_size = declared_logical_size(&headers)?;

    // The whole body is parked in staging before any lock is taken, so a
    // slow client cannot starve writers of other paths.
    let reader = StreamReader::new(
        body.into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
    );
    let storage = Arc::clone(&state.storage);
    let staged = tokio::task::spawn_blocking(move || {
        let mut src = SyncIoBridge::new(reader);
        storage.stage(&mut src, compressed)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("staging task failed: {e}")))??;

    if let Some(expected) = &declared_digest {
        if expected != staged.digest() {
            return Err(ApiError::BadRequest(format!(
                "checksum mismatch: declared {expected}, received {}",
                staged.digest()
            )));
        }
    }
    if let Some(expected) = declared_size {
        if expected != staged.logical_size() {
            return Err(ApiError::BadRequest(format!(
                "logical size mismatch: declared {expected}, received {}",
                staged.logical_size()
            )));
        }
    }

    let stored = state.storage.store(&path, staged, version).await?;
    Ok((
        StatusCode::OK,
        [(header::LAST_MODIFIED, format_http_date(stored))],
        "OK",
    )
        .into_response())
}

/// DELETE /files/{path}?last_modified= - delete a file
async fn delete_file(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Response, ApiError> {
    let path = canonical_path(&path)?;
    let version = required_version(&query)?;
    let retained = match state.storage.delete(&path, version).await? {
        DeleteStatus::Deleted => version,
        DeleteStatus::Kept { version } => version,
    };
    Ok((
        StatusCode::OK,
        [(header::LAST_MODIFIED, format_http_date(retained))],
        "OK",
    )
        .into_response())
}

/// GET /list/{path}?last_modified= - enumerate files under a directory
async fn list_files(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Response, ApiError> {
    let dir = canonical_path(&path)?;
    list_response(&state, dir, &query)
}

async fn list_root(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
) -> Result<Response, ApiError> {
    list_response(&state, "/".to_string(), &query)
}

fn list_response(
    state: &AppState,
    dir: String,
    query: &VersionQuery,
) -> Result<Response, ApiError> {
    let cutoff = required_version(query)?;
    let lines = state.storage.list(&dir, cutoff).map(|entry| {
        entry
            .map(|(path, _version)| Bytes::from(format!("{path}\n")))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(futures::stream::iter(lines)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn miss(state: &AppState, path: &str) -> Result<Response, ApiError> {
    if let Some(fallback) = &state.fallback {
        if let Some(FallbackRoute::Redirect(location)) = fallback.try_fetch(path).await {
            return Ok((
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location)],
            )
                .into_response());
        }
    }
    Err(ApiError::NotFound(path.to_string()))
}

/// Normalizes a request path to its canonical leading-slash form. Empty
/// segments collapse, so `//` is tolerated; `.` and `..` are rejected
/// outright.
fn canonical_path(raw: &str) -> Result<String, ApiError> {
    let mut out = String::with_capacity(raw.len() + 1);
    for segment in raw.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(ApiError::BadRequest(
                "path cannot contain '.' or '..' segments".to_string(),
            ));
        }
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        return Err(ApiError::BadRequest("empty path".to_string()));
    }
    Ok(out)
}

fn required_version(query: &VersionQuery) -> Result<i64, ApiError> {
    let raw = query
        .last_modified
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("last_modified is required".to_string()))?;
    parse_http_date(raw)
}

fn parse_http_date(raw: &str) -> Result<i64, ApiError> {
    DateTime::parse_from_rfc2822(raw)
        .map(|date| date.timestamp())
        .map_err(|_| ApiError::BadRequest(format!("malformed last_modified date: {raw}")))
}

fn format_http_date(version: i64) -> String {
    Utc.timestamp_opt(version, 0)
        .single()
        .map(|date| date.to_rfc2822())
        .unwrap_or_default()
}

fn content_encoding_is_gzip(headers: &HeaderMap) -> Result<bool, ApiError> {
    match headers.get(header::CONTENT_ENCODING) {
        None => Ok(false),
        Some(value) => match value.to_str() {
            Ok("gzip") => Ok(true),
            _ => Err(ApiError::BadRequest(
                "unsupported content encoding".to_string(),
            )),
        },
    }
}

fn declared_checksum(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get("sha256-checksum") else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("malformed SHA256-Checksum header".to_string()))?;
    if value.len() != 64
        || !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(ApiError::BadRequest(
            "SHA256-Checksum must be 64 lowercase hex characters".to_string(),
        ));
    }
    Ok(Some(value.to_string()))
}

fn declared_logical_size(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get("logical-size") else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            ApiError::BadRequest("Logical-Size must be a non-negative integer".to_string())
        })
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("gzip"))
        .unwrap_or(false)
}
