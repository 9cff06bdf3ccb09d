use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ConnectQuery {
    #[serde(alias = "examCode")]
    #[validate(length(min = 1, max = 128, message = "examCode must not be empty"))]
    pub(crate) exam_code: String,
    #[serde(default)]
    #[serde(alias = "examName")]
    #[validate(length(max = 256, message = "examName is too long"))]
    pub(crate) exam_name: Option<String>,
    #[serde(default)]
    pub(crate) total: u64,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ExamCodeQuery {
    #[serde(alias = "examCode")]
    #[validate(length(min = 1, max = 128, message = "examCode must not be empty"))]
    pub(crate) exam_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StopProcessResponse {
    pub(crate) exam_code: String,
    pub(crate) removed: bool,
}

pub(crate) type GradingResultsResponse = HashMap<String, Value>;
