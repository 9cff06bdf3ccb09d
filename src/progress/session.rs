use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::time::format_offset;
use crate::progress::transport::Transport;

/// Display name used when a client connects without naming the exam.
pub(crate) const PLACEHOLDER_EXAM_NAME: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ProgressStatus {
    Processing,
    Completed,
}

impl ProgressStatus {
    pub(crate) fn derive(index: u64, total: u64) -> Self {
        if total > 0 && index >= total {
            Self::Completed
        } else {
            Self::Processing
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Counted,
    Repeated,
}

/// The progress step one inbound event carries.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ProgressUpdate<'a> {
    pub(crate) item: Option<&'a str>,
    pub(crate) index: Option<u64>,
    pub(crate) total_hint: u64,
    pub(crate) name_hint: Option<&'a str>,
}

#[cfg(test)]
impl<'a> ProgressUpdate<'a> {
    pub(crate) fn item(item: &'a str) -> Self {
        Self { item: Some(item), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionSnapshot {
    pub(crate) exam_code: String,
    pub(crate) exam_name: String,
    pub(crate) index: u64,
    pub(crate) total: u64,
    pub(crate) status: ProgressStatus,
    pub(crate) connected: bool,
    pub(crate) updated_at: String,
}

/// Progress record for one exam code.
///
/// `index` only moves forward within a cycle; [`Session::reset_cycle`] is the
/// only way back to zero.
#[derive(Debug)]
pub(crate) struct Session {
    exam_code: String,
    exam_name: String,
    index: u64,
    total: u64,
    status: ProgressStatus,
    processed_items: HashSet<String>,
    last_activity: Instant,
    updated_at: OffsetDateTime,
    transport: Option<Transport>,
}

impl Session {
    pub(crate) fn new(exam_code: String, name_hint: Option<&str>, total_hint: u64) -> Self {
        let mut session = Self {
            exam_code,
            exam_name: PLACEHOLDER_EXAM_NAME.to_string(),
            index: 0,
            total: 0,
            status: ProgressStatus::Processing,
            processed_items: HashSet::new(),
            last_activity: Instant::now(),
            updated_at: OffsetDateTime::now_utc(),
            transport: None,
        };
        session.merge_hints(name_hint, total_hint);
        session
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    #[cfg(test)]
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> ProgressStatus {
        self.status
    }

    #[cfg(test)]
    pub(crate) fn processed_item_count(&self) -> usize {
        self.processed_items.len()
    }

    /// Folds connect/create hints in without losing what is already known:
    /// a zero total or the placeholder name never overwrite real values.
    pub(crate) fn merge_hints(&mut self, name_hint: Option<&str>, total_hint: u64) {
        if let Some(name) = name_hint.map(str::trim).filter(|name| !name.is_empty()) {
            if name != PLACEHOLDER_EXAM_NAME {
                self.exam_name = name.to_string();
            }
        }
        if total_hint > 0 {
            self.total = total_hint;
        }
        self.recompute();
        self.touch();
    }

    /// A connect carrying a fresh total on a session that already ran means
    /// the caller started a new run under the same exam code.
    pub(crate) fn starts_new_cycle(&self, total_hint: u64) -> bool {
        total_hint > 0 && (self.status == ProgressStatus::Completed || self.index > 0)
    }

    pub(crate) fn reset_cycle(&mut self, name_hint: Option<&str>, total: u64) {
        self.index = 0;
        self.total = 0;
        self.processed_items.clear();
        self.merge_hints(name_hint, total);
    }

    /// Counts a recognized item once per cycle. Items without an identifier
    /// cannot be deduplicated and do not move the counter.
    pub(crate) fn record_item(&mut self, item: Option<&str>, total_hint: u64) -> ItemOutcome {
        if let Some(item) = item {
            if !self.processed_items.insert(item.to_string()) {
                return ItemOutcome::Repeated;
            }
        }

        if total_hint > 0 {
            self.total = total_hint;
        }
        self.index = self.index.max(self.processed_items.len() as u64);
        self.recompute();
        self.touch();
        ItemOutcome::Counted
    }

    /// An explicit index without an item moves the counter directly; every
    /// other update counts its item.
    pub(crate) fn apply(&mut self, update: &ProgressUpdate<'_>) -> ItemOutcome {
        if update.name_hint.is_some() {
            self.merge_hints(update.name_hint, 0);
        }
        match (update.item, update.index) {
            (None, Some(index)) => {
                self.update_progress(index, update.total_hint);
                ItemOutcome::Counted
            }
            (item, _) => self.record_item(item, update.total_hint),
        }
    }

    pub(crate) fn update_progress(&mut self, index: u64, total_hint: u64) {
        if total_hint > 0 {
            self.total = total_hint;
        }
        self.index = self.index.max(index);
        self.recompute();
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub(crate) fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    /// Returns the superseded transport, if any, so the caller decides when
    /// it is dropped.
    pub(crate) fn attach(&mut self, transport: Transport) -> Option<Transport> {
        self.transport.replace(transport)
    }

    pub(crate) fn detach(&mut self, transport_id: Uuid) -> Option<Transport> {
        match &self.transport {
            Some(current) if current.id() == transport_id => self.transport.take(),
            _ => None,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            exam_code: self.exam_code.clone(),
            exam_name: self.exam_name.clone(),
            index: self.index,
            total: self.total,
            status: self.status,
            connected: self.transport.is_some(),
            updated_at: format_offset(self.updated_at),
        }
    }

    fn recompute(&mut self) {
        if self.total > 0 && self.index > self.total {
            self.index = self.total;
        }
        self.status = ProgressStatus::derive(self.index, self.total);
    }
}
