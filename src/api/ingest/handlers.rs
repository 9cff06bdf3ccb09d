use axum::extract::State;
use axum::Json;

use crate::core::state::AppState;
use crate::schemas::ingest::{IngestStatusResponse, QueueStatus, ResumeResponse, TopicStatus};

pub(super) async fn status(State(state): State<AppState>) -> Json<IngestStatusResponse> {
    let settings = state.settings();
    let poller = state.poller();

    Json(IngestStatusResponse {
        queue: QueueStatus {
            enabled: settings.sqs().enabled,
            suspended: poller.is_suspended(),
            consecutive_failures: poller.failure_count(),
            max_failures: poller.max_failures(),
        },
        topic: TopicStatus {
            enabled: settings.topic().enabled,
            channels: settings.topic().channels.clone(),
        },
        active_sessions: state.hub().registry().len(),
        tracked_keys: state.hub().dedup().len(),
    })
}

pub(super) async fn resume_queue(State(state): State<AppState>) -> Json<ResumeResponse> {
    let poller = state.poller();
    let was_suspended = poller.resume();
    if was_suspended {
        tracing::warn!("Queue polling resumed by operator");
    }
    Json(ResumeResponse { was_suspended, consecutive_failures: poller.failure_count() })
}
