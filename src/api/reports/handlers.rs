use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::Value;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::progress::event::normalize_exam_code;
use crate::schemas::progress::{ExamCodeQuery, GradingResultsResponse};

fn exam_key(raw: &str) -> Result<String, ApiError> {
    normalize_exam_code(raw)
        .ok_or_else(|| ApiError::BadRequest("examCode must not be empty".to_string()))
}

pub(super) async fn unknown_images(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let key = exam_key(&exam_code)?;
    Ok(Json(state.hub().reports().unknown_images(&key)))
}

pub(super) async fn fallback_items(
    State(state): State<AppState>,
    Query(query): Query<ExamCodeQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    query.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let key = exam_key(&query.exam_code)?;
    Ok(Json(state.hub().reports().fallback_items(&key)))
}

pub(super) async fn grading_results(
    State(state): State<AppState>,
    Query(query): Query<ExamCodeQuery>,
) -> Result<Json<GradingResultsResponse>, ApiError> {
    query.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let key = exam_key(&query.exam_code)?;
    Ok(Json(state.hub().reports().grading_results(&key)))
}
