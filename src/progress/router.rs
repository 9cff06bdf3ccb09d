use anyhow::Context;
use serde_json::{Map, Value};

use crate::progress::event::{EventKind, InboundEvent};
use crate::progress::hub::ProgressHub;
use crate::progress::registry::Advance;
use crate::progress::session::{ProgressUpdate, SessionSnapshot};
use crate::progress::transport::OutboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventSource {
    Queue,
    Topic,
}

impl EventSource {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Topic => "topic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Progress(SessionSnapshot),
    /// Idempotency key already handled, possibly by the other adapter.
    DuplicateDelivery,
    /// Item already counted in the current cycle.
    RepeatedItem,
    Forwarded,
    Logged,
    Unroutable,
    UnknownKind,
}

impl DispatchOutcome {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::DuplicateDelivery => "duplicate_delivery",
            Self::RepeatedItem => "repeated_item",
            Self::Forwarded => "forwarded",
            Self::Logged => "logged",
            Self::Unroutable => "unroutable",
            Self::UnknownKind => "unknown_kind",
        }
    }
}

impl ProgressHub {
    /// Routes one normalized event.
    ///
    /// An `Err` means the event could not be handled right now and should be
    /// redelivered; anything the event itself gets wrong is an `Ok` outcome.
    pub(crate) async fn dispatch(
        &self,
        event: InboundEvent,
        source: EventSource,
    ) -> anyhow::Result<DispatchOutcome> {
        if let EventKind::Unknown(tag) = &event.kind {
            tracing::warn!(
                source = source.label(),
                event_type = %tag,
                "Dropping unknown event type"
            );
            return Ok(DispatchOutcome::UnknownKind);
        }

        let Some(exam_code) = event.exam_code.clone() else {
            tracing::debug!(
                source = source.label(),
                kind = event.kind.label(),
                "Dropping event without exam code"
            );
            return Ok(DispatchOutcome::Unroutable);
        };

        match event.kind {
            EventKind::Progress => self.handle_progress(&exam_code, event, source).await,
            EventKind::Fallback => {
                self.registry.get_or_create(&exam_code, event.exam_name.as_deref(), 0);
                let payload = forwarded_payload(event.fields, &exam_code);
                self.reports.save_fallback_item(&exam_code, payload.clone());
                tracing::info!(exam_code = %exam_code, "Answer fallback required");
                self.registry.deliver(&exam_code, OutboundEvent::FallbackRequired, payload);
                Ok(DispatchOutcome::Forwarded)
            }
            EventKind::AnswerResult => {
                self.registry.get_or_create(&exam_code, event.exam_name.as_deref(), 0);
                let payload = forwarded_payload(event.fields, &exam_code);
                match event.student_id.as_deref() {
                    Some(student_id) => {
                        self.reports.save_grading_result(&exam_code, student_id, payload.clone());
                    }
                    None => tracing::warn!(
                        exam_code = %exam_code,
                        "Answer result without student id was not recorded"
                    ),
                }
                self.registry.deliver(&exam_code, OutboundEvent::AnswerResult, payload);
                Ok(DispatchOutcome::Forwarded)
            }
            EventKind::Error => {
                self.registry.get_or_create(&exam_code, event.exam_name.as_deref(), 0);
                let message = event.fields.get("message").and_then(Value::as_str).unwrap_or("");
                tracing::error!(
                    exam_code = %exam_code,
                    source = source.label(),
                    detail = message,
                    "Recognition pipeline reported an error"
                );
                let payload = forwarded_payload(event.fields, &exam_code);
                self.registry.deliver(&exam_code, OutboundEvent::ErrorOccurred, payload);
                Ok(DispatchOutcome::Forwarded)
            }
            EventKind::AttendanceUpload => {
                let download_url = event.fields.get("downloadUrl").and_then(Value::as_str);
                tracing::info!(exam_code = %exam_code, download_url, "Attendance sheet uploaded");
                Ok(DispatchOutcome::Logged)
            }
            EventKind::Unknown(_) => Ok(DispatchOutcome::UnknownKind),
        }
    }

    async fn handle_progress(
        &self,
        exam_code: &str,
        event: InboundEvent,
        source: EventSource,
    ) -> anyhow::Result<DispatchOutcome> {
        if let Some(key) = event.s3_key.as_deref() {
            if !self.dedup.check_and_insert(exam_code, key) {
                metrics::counter!("dedup_dropped_total", "layer" => "global").increment(1);
                tracing::debug!(
                    exam_code,
                    s3_key = key,
                    source = source.label(),
                    "Skipping already processed object"
                );
                return Ok(DispatchOutcome::DuplicateDelivery);
            }
        }

        let image_urls = match self.image_urls(exam_code, &event).await {
            Ok(urls) => urls,
            Err(err) => {
                // Let the redelivery through the global filter.
                if let Some(key) = event.s3_key.as_deref() {
                    self.dedup.forget(key);
                }
                return Err(err);
            }
        };
        if !image_urls.is_empty() {
            self.reports.save_unknown_images(exam_code, &image_urls);
        }

        let update = ProgressUpdate {
            item: event.filename.as_deref(),
            index: event.index,
            total_hint: event.total.unwrap_or(0),
            name_hint: event.exam_name.as_deref(),
        };
        let fields = event.fields;
        let advance = self.registry.advance(exam_code, &update, |snapshot| {
            progress_payload(fields, snapshot, image_urls)
        });
        let snapshot = match advance {
            Some(Advance::Counted { snapshot, .. }) => snapshot,
            Some(Advance::Repeated) => {
                metrics::counter!("dedup_dropped_total", "layer" => "task").increment(1);
                tracing::debug!(
                    exam_code,
                    item = update.item,
                    "Item already counted in this cycle"
                );
                return Ok(DispatchOutcome::RepeatedItem);
            }
            None => return Ok(DispatchOutcome::Unroutable),
        };

        tracing::info!(
            exam_code,
            index = snapshot.index,
            total = snapshot.total,
            status = snapshot.status.as_str(),
            source = source.label(),
            "Recognition progress"
        );
        Ok(DispatchOutcome::Progress(snapshot))
    }

    /// URLs to attach to a progress update: explicit ones from the producer
    /// plus a presigned link for images whose student id was unreadable.
    async fn image_urls(
        &self,
        exam_code: &str,
        event: &InboundEvent,
    ) -> anyhow::Result<Vec<String>> {
        let mut urls = event.presigned_urls.clone();
        if !event.has_unknown_student() {
            return Ok(urls);
        }

        let (Some(filename), Some(presigner)) = (event.filename.as_deref(), &self.presigner) else {
            return Ok(urls);
        };
        let key = format!("header/{exam_code}/unknown_id/{filename}");
        let url = presigner
            .presign_get(&key)
            .await
            .with_context(|| format!("failed to presign {key}"))?;
        if !urls.contains(&url) {
            urls.push(url);
        }
        Ok(urls)
    }
}

fn forwarded_payload(mut fields: Map<String, Value>, exam_code: &str) -> Value {
    fields.insert("examCode".to_string(), Value::from(exam_code));
    Value::Object(fields)
}

fn progress_payload(
    mut fields: Map<String, Value>,
    snapshot: &SessionSnapshot,
    image_urls: Vec<String>,
) -> Value {
    fields.insert("examCode".to_string(), Value::from(snapshot.exam_code.as_str()));
    fields.insert("index".to_string(), Value::from(snapshot.index));
    fields.insert("total".to_string(), Value::from(snapshot.total));
    fields.insert("status".to_string(), Value::from(snapshot.status.as_str()));
    if !image_urls.is_empty() {
        fields.insert("presignedUrls".to_string(), Value::from(image_urls));
    }
    Value::Object(fields)
}
