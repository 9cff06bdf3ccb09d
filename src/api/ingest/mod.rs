mod handlers;

use axum::{routing::get, routing::post, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/queue/resume", post(handlers::resume_queue))
}
