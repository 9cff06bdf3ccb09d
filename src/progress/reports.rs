use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};

/// Per-exam side data collected from recognition events: images whose
/// student id could not be read, answers that need manual fallback, and
/// per-student grading results.
#[derive(Debug, Default)]
pub(crate) struct ReportStore {
    reports: DashMap<String, ExamReports>,
}

#[derive(Debug, Default)]
struct ExamReports {
    // Decoded file name -> presigned URL; a re-delivered image replaces its entry.
    unknown_images: BTreeMap<String, String>,
    fallback_items: Vec<Value>,
    grading_results: HashMap<String, Value>,
}

impl ReportStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn save_unknown_images(&self, exam_code: &str, urls: &[String]) -> usize {
        let mut entry = self.reports.entry(exam_code.to_string()).or_default();
        let mut saved = 0;
        for url in urls {
            if let Some(filename) = filename_from_url(url) {
                entry.unknown_images.insert(filename, url.clone());
                saved += 1;
            }
        }
        saved
    }

    pub(crate) fn unknown_images(&self, exam_code: &str) -> Vec<String> {
        self.reports
            .get(exam_code)
            .map(|entry| entry.unknown_images.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a fallback request; a redelivery of the same item replaces the
    /// stored one instead of adding a second entry.
    pub(crate) fn save_fallback_item(&self, exam_code: &str, item: Value) {
        let identity = fallback_identity(&item);
        let mut entry = self.reports.entry(exam_code.to_string()).or_default();
        let existing = entry
            .fallback_items
            .iter()
            .position(|stored| fallback_identity(stored) == identity);
        match existing {
            Some(position) => entry.fallback_items[position] = item,
            None => entry.fallback_items.push(item),
        }
    }

    pub(crate) fn fallback_items(&self, exam_code: &str) -> Vec<Value> {
        self.reports.get(exam_code).map(|entry| entry.fallback_items.clone()).unwrap_or_default()
    }

    pub(crate) fn save_grading_result(&self, exam_code: &str, student_id: &str, result: Value) {
        self.reports
            .entry(exam_code.to_string())
            .or_default()
            .grading_results
            .insert(student_id.to_string(), result);
    }

    pub(crate) fn grading_results(&self, exam_code: &str) -> HashMap<String, Value> {
        self.reports.get(exam_code).map(|entry| entry.grading_results.clone()).unwrap_or_default()
    }

    pub(crate) fn clear(&self, exam_code: &str) {
        self.reports.remove(exam_code);
    }

    /// Drops reports of exams `keep` rejects; returns how many were dropped.
    pub(crate) fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut dropped = 0;
        self.reports.retain(|exam_code, _| {
            let kept = keep(exam_code);
            if !kept {
                dropped += 1;
            }
            kept
        });
        dropped
    }
}

const FALLBACK_IDENTITY_KEYS: [&str; 9] = [
    "s3Key",
    "s3_key",
    "studentId",
    "student_id",
    "questionNum",
    "question_num",
    "filename",
    "fileName",
    "file_name",
];

/// Fields that name the answer a fallback is about. An item carrying none of
/// them is identified by its whole body.
fn fallback_identity(item: &Value) -> Value {
    let Some(fields) = item.as_object() else {
        return item.clone();
    };
    let identity: Map<String, Value> = FALLBACK_IDENTITY_KEYS
        .iter()
        .filter_map(|key| fields.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect();
    if identity.is_empty() {
        item.clone()
    } else {
        Value::Object(identity)
    }
}

/// Last path segment of a URL with the query string stripped and
/// percent-escapes decoded.
fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next()?;
    let segment = path.rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    Some(percent_decode_str(segment).decode_utf8_lossy().into_owned())
}
