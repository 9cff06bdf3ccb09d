use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueueStatus {
    pub(crate) enabled: bool,
    pub(crate) suspended: bool,
    pub(crate) consecutive_failures: u32,
    pub(crate) max_failures: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopicStatus {
    pub(crate) enabled: bool,
    pub(crate) channels: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IngestStatusResponse {
    pub(crate) queue: QueueStatus,
    pub(crate) topic: TopicStatus,
    pub(crate) active_sessions: usize,
    pub(crate) tracked_keys: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResumeResponse {
    pub(crate) was_suspended: bool,
    pub(crate) consecutive_failures: u32,
}
