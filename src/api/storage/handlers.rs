use std::convert::Infallible;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::progress::session::SessionSnapshot;
use crate::progress::transport::Frame;
use crate::schemas::progress::{ConnectQuery, StopProcessResponse};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub(super) async fn connect(
    State(state): State<AppState>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    query.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let connection = state
        .hub()
        .connect(&query.exam_code, query.exam_name.as_deref(), query.total)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        exam_code = %connection.snapshot.exam_code,
        total = connection.snapshot.total,
        index = connection.snapshot.index,
        cycle_reset = connection.cycle_reset,
        "SSE client connected"
    );

    let events = connection.stream.map(|frame| Ok::<_, Infallible>(sse_event(frame)));
    let headers = [(header::CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING, "no")];
    Ok((headers, Sse::new(events)))
}

fn sse_event(frame: Frame) -> Event {
    match frame {
        Frame::Event { event, data } => Event::default().event(event.name()).data(data.to_string()),
        Frame::Heartbeat => Event::default().comment("heartbeat"),
    }
}

pub(super) async fn list_active_processes(
    State(state): State<AppState>,
) -> Json<Vec<SessionSnapshot>> {
    Json(state.hub().registry().list_all())
}

pub(super) async fn get_progress(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .hub()
        .registry()
        .snapshot(&exam_code)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No progress for exam {exam_code}")))
}

pub(super) async fn stop_process(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
) -> Json<StopProcessResponse> {
    let removed = state.hub().remove_task(&exam_code);
    Json(StopProcessResponse { exam_code: exam_code.trim().to_uppercase(), removed })
}
