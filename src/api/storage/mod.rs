mod handlers;

use axum::{routing::delete, routing::get, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/sse/connect", get(handlers::connect))
        .route("/active-processes", get(handlers::list_active_processes))
        .route("/active-processes/:exam_code", delete(handlers::stop_process))
        .route("/progress/:exam_code", get(handlers::get_progress))
}

#[cfg(test)]
mod tests;
