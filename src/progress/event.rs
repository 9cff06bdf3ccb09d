use serde_json::{Map, Value};
use thiserror::Error;

/// Student id the recognizer reports when it could not read the id box.
pub(crate) const UNKNOWN_STUDENT_ID: &str = "unknown_id";

const TYPE_KEYS: &[&str] = &["eventType", "event_type"];
const EXAM_CODE_KEYS: &[&str] = &["examCode", "exam_code"];
const EXAM_NAME_KEYS: &[&str] = &["examName", "exam_name"];
const STUDENT_ID_KEYS: &[&str] = &["studentId", "student_id"];
const FILENAME_KEYS: &[&str] = &["filename", "fileName", "file_name"];
const S3_KEY_KEYS: &[&str] = &["s3Key", "s3_key"];
const INDEX_KEYS: &[&str] = &["index", "idx"];
const TOTAL_KEYS: &[&str] = &["total"];
const PRESIGNED_URL_KEYS: &[&str] = &["presignedUrls", "presigned_urls"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EventKind {
    Progress,
    Fallback,
    AnswerResult,
    Error,
    AttendanceUpload,
    Unknown(String),
}

impl EventKind {
    pub(crate) fn classify(tag: Option<&str>) -> Self {
        match tag.map(str::trim) {
            None | Some("") => Self::Progress,
            Some("STUDENT_ID_RECOGNITION" | "QUESTION_RECOGNITION") => Self::Progress,
            Some("ANSWER_FALLBACK") => Self::Fallback,
            Some("ANSWER_RECOGNITION_RESULT") => Self::AnswerResult,
            Some("ERROR") => Self::Error,
            Some("ATTENDANCE_UPLOAD") => Self::AttendanceUpload,
            Some(other) => Self::Unknown(other.to_string()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        match self {
            Self::Progress => "progress",
            Self::Fallback => "fallback",
            Self::AnswerResult => "answer_result",
            Self::Error => "error",
            Self::AttendanceUpload => "attendance_upload",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// An inbound recognition event with every aliased field resolved once.
///
/// `fields` keeps the producer's original payload so it can be forwarded to
/// clients unchanged apart from the computed progress fields.
#[derive(Debug, Clone)]
pub(crate) struct InboundEvent {
    pub(crate) kind: EventKind,
    pub(crate) exam_code: Option<String>,
    pub(crate) exam_name: Option<String>,
    pub(crate) student_id: Option<String>,
    pub(crate) filename: Option<String>,
    pub(crate) s3_key: Option<String>,
    pub(crate) index: Option<u64>,
    pub(crate) total: Option<u64>,
    pub(crate) presigned_urls: Vec<String>,
    pub(crate) fields: Map<String, Value>,
}

impl InboundEvent {
    pub(crate) fn parse(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub(crate) fn from_value(value: Value) -> Result<Self, ParseError> {
        let Value::Object(fields) = value else {
            return Err(ParseError::NotAnObject);
        };

        Ok(Self {
            kind: EventKind::classify(text_field(&fields, TYPE_KEYS).as_deref()),
            exam_code: text_field(&fields, EXAM_CODE_KEYS)
                .and_then(|value| normalize_exam_code(&value)),
            exam_name: text_field(&fields, EXAM_NAME_KEYS),
            student_id: text_field(&fields, STUDENT_ID_KEYS),
            filename: text_field(&fields, FILENAME_KEYS),
            s3_key: text_field(&fields, S3_KEY_KEYS),
            index: count_field(&fields, INDEX_KEYS),
            total: count_field(&fields, TOTAL_KEYS),
            presigned_urls: url_list_field(&fields, PRESIGNED_URL_KEYS),
            fields,
        })
    }

    pub(crate) fn has_unknown_student(&self) -> bool {
        self.student_id.as_deref() == Some(UNKNOWN_STUDENT_ID)
    }
}

/// Trims and upper-cases an exam code so `" ex1 "` and `"EX1"` share a session.
pub(crate) fn normalize_exam_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_uppercase())
}

fn lookup<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|key| fields.get(*key)).find(|value| !value.is_null())
}

fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match lookup(fields, keys)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn count_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    match lookup(fields, keys)? {
        Value::Number(number) => {
            number.as_u64().or_else(|| number.as_f64().filter(|value| *value >= 0.0).map(truncate))
        }
        Value::String(text) => {
            let text = text.trim();
            text.parse::<u64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().filter(|value| *value >= 0.0).map(truncate))
        }
        _ => None,
    }
}

fn url_list_field(fields: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    match lookup(fields, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn truncate(value: f64) -> u64 {
    if value.is_finite() {
        value.trunc() as u64
    } else {
        0
    }
}
