//! Axum routes: index page, MJPEG stream, attendance listing and marking.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tower_http::trace::TraceLayer;

use crate::attendance::{
    AttendanceRecord, AttendanceStore, MarkOutcome, MarkSource, RecordFilter, DATE_FORMAT,
};
use crate::engine::{FaceIdentifier, FrameSlot};

const INDEX_HTML: &str = include_str!("../static/index.html");
const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Shared handler state.
pub struct AppState {
    pub identifier: Arc<dyn FaceIdentifier>,
    pub store: AttendanceStore,
    /// Live frames; `None` when the camera is disabled.
    pub frames: Option<Arc<watch::Sender<FrameSlot>>>,
    pub gallery_size: usize,
}

pub fn router(state: Arc<AppState>, max_image_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/video_feed", get(video_feed_handler))
        .route("/attendance_records", get(records_handler))
        .route("/mark_attendance", post(mark_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_image_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MarkResponse {
    Success { name: String },
    Duplicate { name: String },
    Error { message: String },
}

impl MarkResponse {
    fn error(message: &str) -> Self {
        Self::Error { message: message.to_string() }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub date: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub gallery_size: usize,
    pub camera: bool,
    pub viewers: usize,
    pub present_today: u64,
}

type ApiError = (StatusCode, Json<MarkResponse>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(MarkResponse::error(message)))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Frame one JPEG as a multipart part.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn video_feed_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(frames) = state.frames.as_ref() else {
        return api_error(StatusCode::SERVICE_UNAVAILABLE, "Camera is disabled").into_response();
    };

    // Subscribing is what wakes the capture loop.
    let stream = WatchStream::from_changes(frames.subscribe())
        .take_while(|slot| *slot != FrameSlot::Ended)
        .filter_map(|slot| match slot {
            FrameSlot::Jpeg(jpeg) => Some(Ok::<_, Infallible>(mjpeg_part(&jpeg))),
            _ => None,
        });

    tracing::debug!(viewers = frames.receiver_count(), "stream viewer connected");
    ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], Body::from_stream(stream)).into_response()
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<Vec<AttendanceRecord>>, ApiError> {
    let date = match query.date.as_deref().filter(|d| !d.is_empty()) {
        Some(raw) => Some(NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| {
            api_error(StatusCode::BAD_REQUEST, "Invalid date, expected YYYY-MM-DD")
        })?),
        None => None,
    };
    let filter = RecordFilter { date, name: query.name.filter(|n| !n.is_empty()) };

    let records = state.store.list(filter).await.map_err(|e| {
        tracing::error!(error = %e, "failed to list attendance records");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;
    Ok(Json(records))
}

/// Decode a `data:image/...;base64,` URL or a bare base64 string.
pub fn decode_data_url(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match input.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => input,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact)
}

async fn mark_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MarkRequest>, JsonRejection>,
) -> Result<Json<MarkResponse>, ApiError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            tracing::debug!(error = %rejection, "submitted image exceeds the body limit");
            return Err(api_error(StatusCode::PAYLOAD_TOO_LARGE, "Image too large"));
        }
        Err(JsonRejection::MissingJsonContentType(_)) => MarkRequest { image: None },
        Err(rejection) => {
            tracing::debug!(error = %rejection, "malformed mark request");
            return Err(api_error(StatusCode::BAD_REQUEST, "Invalid image data"));
        }
    };
    let image = request
        .image
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No image data provided"))?;

    let bytes = decode_data_url(&image).map_err(|e| {
        tracing::debug!(error = %e, "submitted image is not valid base64");
        api_error(StatusCode::BAD_REQUEST, "Invalid image data")
    })?;

    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "image decode task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })?
        .map_err(|e| {
            tracing::debug!(error = %e, "submitted image could not be decoded");
            api_error(StatusCode::BAD_REQUEST, "Invalid image data")
        })?;

    let recognition = state.identifier.recognize(decoded.to_rgb8()).await.map_err(|e| {
        tracing::error!(error = %e, "recognition failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    let Some(name) = recognition.first_match() else {
        tracing::info!(faces = recognition.faces.len(), "submitted face not recognized");
        return Ok(Json(MarkResponse::error("Face not recognized")));
    };

    let now = Local::now().naive_local();
    let outcome = state.store.mark(name, now, MarkSource::Upload).await.map_err(|e| {
        tracing::error!(name, error = %e, "failed to record attendance");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    let name = name.to_string();
    Ok(Json(match outcome {
        MarkOutcome::Recorded => MarkResponse::Success { name },
        MarkOutcome::Duplicate => MarkResponse::Duplicate { name },
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let present_today = state.store.count_for_date(Local::now().date_naive()).await;
    if let Err(e) = &present_today {
        tracing::warn!(error = %e, "health: attendance count failed");
    }
    Json(HealthResponse {
        healthy: present_today.is_ok(),
        version: env!("CARGO_PKG_VERSION"),
        gallery_size: state.gallery_size,
        camera: state.frames.is_some(),
        viewers: state.frames.as_ref().map_or(0, |f| f.receiver_count()),
        present_today: present_today.unwrap_or(0),
    })
}
