mod handlers;

use axum::{routing::get, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/reports/unknown-images/:exam_code", get(handlers::unknown_images))
        .route("/fallback-items", get(handlers::fallback_items))
        .route("/grading-results", get(handlers::grading_results))
}
