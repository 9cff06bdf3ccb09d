use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::progress::event::normalize_exam_code;
use crate::progress::session::{ItemOutcome, ProgressUpdate, Session, SessionSnapshot};
use crate::progress::transport::{
    DeliveryError, Frame, OutboundEvent, Transport, TransportStream,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RegistryError {
    #[error("exam code must not be empty")]
    InvalidExamCode,
}

pub(crate) struct Connection {
    pub(crate) stream: TransportStream,
    pub(crate) snapshot: SessionSnapshot,
    pub(crate) cycle_reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    NoSession,
    NoTransport,
    Detached(DeliveryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Advance {
    Repeated,
    Counted { snapshot: SessionSnapshot, delivery: Delivery },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HeartbeatReport {
    pub(crate) delivered: usize,
    pub(crate) detached: usize,
}

/// Concurrent map of exam code to [`Session`].
///
/// Every mutation of one exam runs under that key's shard lock, so the queue
/// poller, the topic consumer and the sweeper never interleave inside a
/// session. Superseded or failed transports are dropped after the lock is
/// released.
#[derive(Clone)]
pub(crate) struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
    channel_capacity: usize,
}

impl SessionRegistry {
    pub(crate) fn new(channel_capacity: usize) -> Self {
        Self { sessions: Arc::new(DashMap::new()), channel_capacity }
    }

    pub(crate) fn get_or_create(
        &self,
        exam_code: &str,
        name_hint: Option<&str>,
        total_hint: u64,
    ) -> Option<SessionSnapshot> {
        let key = normalize_exam_code(exam_code)?;
        let mut session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key, None, 0));
        session.merge_hints(name_hint, total_hint);
        Some(session.snapshot())
    }

    /// Opens the push stream for an exam, replacing any stream already attached.
    ///
    /// A fresh non-zero total on a session that has progressed or completed
    /// starts a new cycle; otherwise the hints are merged into the counters
    /// that are already there.
    pub(crate) fn connect(
        &self,
        exam_code: &str,
        name_hint: Option<&str>,
        total_hint: u64,
    ) -> Result<Connection, RegistryError> {
        let key = normalize_exam_code(exam_code).ok_or(RegistryError::InvalidExamCode)?;
        let (transport, rx) = Transport::open(self.channel_capacity);
        let transport_id = transport.id();

        let (snapshot, cycle_reset, superseded) = {
            let mut session = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| Session::new(key.clone(), None, 0));

            let cycle_reset = session.starts_new_cycle(total_hint);
            if cycle_reset {
                session.reset_cycle(name_hint, total_hint);
            } else {
                session.merge_hints(name_hint, total_hint);
            }

            let superseded = session.attach(transport);
            let snapshot = session.snapshot();
            if let Some(transport) = session.transport() {
                let greeting = Frame::Event {
                    event: OutboundEvent::Connected,
                    data: connected_payload(&snapshot),
                };
                if let Err(err) = transport.try_deliver(greeting) {
                    tracing::warn!(
                        exam_code = %key,
                        error = ?err,
                        "Failed to queue connected frame"
                    );
                }
            }
            (snapshot, cycle_reset, superseded)
        };

        if superseded.is_some() {
            metrics::counter!("sse_transports_detached_total", "reason" => "superseded")
                .increment(1);
            tracing::info!(exam_code = %key, "SSE transport superseded by reconnect");
        }
        drop(superseded);

        let stream = TransportStream::new(self.clone(), key, transport_id, rx);
        Ok(Connection { stream, snapshot, cycle_reset })
    }

    /// Applies one progress step and pushes `recognition_update` before the
    /// exam's lock is released, so the client sees frames in the order the
    /// counters moved. A repeated item changes nothing and pushes nothing.
    pub(crate) fn advance<F>(
        &self,
        exam_code: &str,
        update: &ProgressUpdate<'_>,
        payload: F,
    ) -> Option<Advance>
    where
        F: FnOnce(&SessionSnapshot) -> Value,
    {
        let key = normalize_exam_code(exam_code)?;
        let event = OutboundEvent::RecognitionUpdate;

        let (snapshot, delivery, dropped) = {
            let mut session = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| Session::new(key.clone(), None, 0));
            if session.apply(update) == ItemOutcome::Repeated {
                return Some(Advance::Repeated);
            }

            let snapshot = session.snapshot();
            let frame = Frame::Event { event, data: payload(&snapshot) };
            let (delivery, dropped) = push(&mut session, frame);
            (snapshot, delivery, dropped)
        };

        record_delivery(&key, event, delivery);
        drop(dropped);
        Some(Advance::Counted { snapshot, delivery })
    }

    /// Best-effort push to the exam's client. A full or closed stream detaches
    /// the transport; the session and its counters stay.
    pub(crate) fn deliver(&self, exam_code: &str, event: OutboundEvent, data: Value) -> Delivery {
        let Some(key) = normalize_exam_code(exam_code) else {
            return Delivery::NoSession;
        };

        let (delivery, dropped) = {
            let Some(mut session) = self.sessions.get_mut(&key) else {
                return Delivery::NoSession;
            };
            session.touch();
            push(&mut session, Frame::Event { event, data })
        };

        record_delivery(&key, event, delivery);
        drop(dropped);
        delivery
    }

    pub(crate) fn heartbeat(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut dropped = Vec::new();

        for mut session in self.sessions.iter_mut() {
            let attempt = session
                .transport()
                .map(|transport| (transport.id(), transport.try_deliver(Frame::Heartbeat)));
            match attempt {
                None => {}
                Some((_, Ok(()))) => report.delivered += 1,
                Some((transport_id, Err(err))) => {
                    tracing::debug!(exam_code = %session.key(), error = ?err, "Heartbeat failed");
                    if let Some(transport) = session.detach(transport_id) {
                        dropped.push(transport);
                        report.detached += 1;
                    }
                }
            }
        }

        if report.detached > 0 {
            metrics::counter!("sse_transports_detached_total", "reason" => "heartbeat")
                .increment(report.detached as u64);
        }
        drop(dropped);
        report
    }

    /// Removes sessions with no activity for longer than `idle_timeout` and
    /// returns their exam codes.
    pub(crate) fn sweep_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.sessions.retain(|key, session| {
            if session.idle_for(now) > idle_timeout {
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Idempotent: only clears the handle when `transport_id` is still the
    /// attached one.
    pub(crate) fn detach(&self, exam_code: &str, transport_id: Uuid) -> bool {
        self.sessions
            .get_mut(exam_code)
            .and_then(|mut session| session.detach(transport_id))
            .is_some()
    }

    pub(crate) fn remove_session(&self, exam_code: &str) -> bool {
        let Some(key) = normalize_exam_code(exam_code) else {
            return false;
        };
        self.sessions.remove(&key).is_some()
    }

    /// Closes every attached stream; used on shutdown so long-lived responses end.
    pub(crate) fn close_all(&self) -> usize {
        let mut closed = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if let Some(transport_id) = session.transport().map(Transport::id) {
                closed.extend(session.detach(transport_id));
            }
        }
        closed.len()
    }

    pub(crate) fn snapshot(&self, exam_code: &str) -> Option<SessionSnapshot> {
        let key = normalize_exam_code(exam_code)?;
        self.sessions.get(&key).map(|session| session.snapshot())
    }

    pub(crate) fn list_all(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> =
            self.sessions.iter().map(|session| session.snapshot()).collect();
        sessions.sort_by(|left, right| left.exam_code.cmp(&right.exam_code));
        sessions
    }

    pub(crate) fn contains(&self, exam_code: &str) -> bool {
        self.sessions.contains_key(exam_code)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Tries the attached transport; a failed one is detached and handed back
/// so the caller drops it outside the lock.
fn push(session: &mut Session, frame: Frame) -> (Delivery, Option<Transport>) {
    let attempt = session
        .transport()
        .map(|transport| (transport.id(), transport.try_deliver(frame)));
    match attempt {
        None => (Delivery::NoTransport, None),
        Some((_, Ok(()))) => (Delivery::Sent, None),
        Some((transport_id, Err(err))) => (Delivery::Detached(err), session.detach(transport_id)),
    }
}

fn record_delivery(exam_code: &str, event: OutboundEvent, delivery: Delivery) {
    match delivery {
        Delivery::Sent => {
            metrics::counter!("sse_events_sent_total", "event" => event.name()).increment(1);
        }
        Delivery::Detached(err) => {
            metrics::counter!("sse_transports_detached_total", "reason" => "send_failed")
                .increment(1);
            tracing::warn!(
                exam_code,
                event = event.name(),
                error = ?err,
                "Failed to push SSE event, detaching transport"
            );
        }
        Delivery::NoSession | Delivery::NoTransport => {}
    }
}

fn connected_payload(snapshot: &SessionSnapshot) -> Value {
    json!({
        "examCode": snapshot.exam_code,
        "examName": snapshot.exam_name,
        "message": "SSE connected",
        "index": snapshot.index,
        "total": snapshot.total,
        "status": snapshot.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::session::ProgressStatus;
    use futures::StreamExt;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(8)
    }

    fn record(registry: &SessionRegistry, exam_code: &str, item: &str) -> Option<Advance> {
        registry.advance(exam_code, &ProgressUpdate::item(item), |snapshot| {
            json!({ "index": snapshot.index, "total": snapshot.total })
        })
    }

    #[test]
    fn exam_codes_are_normalized_to_one_session() {
        let registry = registry();
        registry.get_or_create(" ex1 ", Some("Midterm"), 3);
        record(&registry, "EX1", "f1");
        record(&registry, "Ex1\n", "f2");

        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot("ex1").expect("session");
        assert_eq!(snapshot.exam_code, "EX1");
        assert_eq!(snapshot.index, 2);
        assert_eq!(snapshot.total, 3);
    }

    #[test]
    fn blank_exam_code_is_rejected() {
        let registry = registry();
        assert!(registry.get_or_create("  ", None, 1).is_none());
        assert_eq!(registry.connect("", None, 1).err(), Some(RegistryError::InvalidExamCode));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn get_or_create_never_downgrades_total() {
        let registry = registry();
        registry.get_or_create("EX1", Some("Midterm"), 5);
        let snapshot = registry.get_or_create("EX1", Some("Unknown"), 0).expect("session");
        assert_eq!(snapshot.total, 5);
        assert_eq!(snapshot.exam_name, "Midterm");
    }

    #[tokio::test]
    async fn connect_sends_connected_frame_with_snapshot() {
        let registry = registry();
        let mut connection = registry.connect("ex1", Some("Midterm"), 4).expect("connect");
        assert!(!connection.cycle_reset);
        assert!(connection.snapshot.connected);

        match connection.stream.next().await {
            Some(Frame::Event { event, data }) => {
                assert_eq!(event, OutboundEvent::Connected);
                assert_eq!(data["examCode"], "EX1");
                assert_eq!(data["total"], 4);
                assert_eq!(data["status"], "processing");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn connect_with_zero_then_total_keeps_index() {
        let registry = registry();
        let _first = registry.connect("EX1", None, 0).expect("connect");
        let second = registry.connect("EX1", None, 5).expect("connect");

        assert!(!second.cycle_reset);
        assert_eq!(second.snapshot.total, 5);
        assert_eq!(second.snapshot.index, 0);
        assert_eq!(second.snapshot.status, ProgressStatus::Processing);
    }

    #[test]
    fn connect_with_fresh_total_resets_completed_cycle() {
        let registry = registry();
        registry.get_or_create("EX1", None, 2);
        record(&registry, "EX1", "f1");
        record(&registry, "EX1", "f2");
        assert_eq!(registry.snapshot("EX1").expect("session").status, ProgressStatus::Completed);

        let connection = registry.connect("EX1", None, 3).expect("connect");
        assert!(connection.cycle_reset);
        assert_eq!(connection.snapshot.index, 0);
        assert_eq!(connection.snapshot.total, 3);
        assert_eq!(connection.snapshot.status, ProgressStatus::Processing);

        match record(&registry, "EX1", "f1") {
            Some(Advance::Counted { snapshot, .. }) => assert_eq!(snapshot.index, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn reconnect_without_total_keeps_progress() {
        let registry = registry();
        registry.get_or_create("EX1", None, 4);
        record(&registry, "EX1", "f1");

        let connection = registry.connect("EX1", None, 0).expect("connect");
        assert!(!connection.cycle_reset);
        assert_eq!(connection.snapshot.index, 1);
        assert_eq!(connection.snapshot.total, 4);
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_stream() {
        let registry = registry();
        let mut first = registry.connect("EX1", None, 0).expect("connect");
        let mut second = registry.connect("EX1", None, 0).expect("connect");

        assert!(matches!(first.stream.next().await, Some(Frame::Event { .. })));
        assert!(first.stream.next().await.is_none());

        drop(first);
        assert!(registry.snapshot("EX1").expect("session").connected);

        assert_eq!(
            registry.deliver("EX1", OutboundEvent::AnswerResult, json!({"ok": true})),
            Delivery::Sent
        );
        assert!(matches!(second.stream.next().await, Some(Frame::Event { .. })));
        assert!(matches!(
            second.stream.next().await,
            Some(Frame::Event { event: OutboundEvent::AnswerResult, .. })
        ));
    }

    #[test]
    fn dropping_the_stream_detaches_without_touching_counters() {
        let registry = registry();
        registry.get_or_create("EX1", None, 3);
        record(&registry, "EX1", "f1");

        let connection = registry.connect("EX1", None, 0).expect("connect");
        drop(connection);

        let snapshot = registry.snapshot("EX1").expect("session");
        assert!(!snapshot.connected);
        assert_eq!(snapshot.index, 1);
        assert_eq!(
            registry.deliver("EX1", OutboundEvent::AnswerResult, json!({})),
            Delivery::NoTransport
        );
    }

    #[test]
    fn backlogged_client_is_detached_on_send() {
        let registry = SessionRegistry::new(1);
        let connection = registry.connect("EX1", None, 0).expect("connect");

        let delivery = registry.deliver("EX1", OutboundEvent::AnswerResult, json!({}));
        assert_eq!(delivery, Delivery::Detached(DeliveryError::Backlogged));
        assert!(!registry.snapshot("EX1").expect("session").connected);
        drop(connection);
    }

    #[tokio::test]
    async fn heartbeat_detaches_backlogged_streams() {
        let registry = SessionRegistry::new(1);
        let _stalled = registry.connect("EX1", None, 0).expect("connect");
        let mut live = registry.connect("EX2", None, 0).expect("connect");
        assert!(matches!(live.stream.next().await, Some(Frame::Event { .. })));
        registry.get_or_create("EX3", None, 0);

        let report = registry.heartbeat();
        assert_eq!(report, HeartbeatReport { delivered: 1, detached: 1 });
        assert!(!registry.snapshot("EX1").expect("session").connected);
        assert_eq!(live.stream.next().await, Some(Frame::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept() {
        let registry = registry();
        registry.get_or_create("OLD", None, 3);
        tokio::time::advance(Duration::from_secs(500)).await;
        registry.get_or_create("NEW", None, 3);
        tokio::time::advance(Duration::from_secs(200)).await;

        let evicted = registry.sweep_idle(Duration::from_secs(600));
        assert_eq!(evicted, vec!["OLD".to_string()]);
        assert!(registry.snapshot("OLD").is_none());
        assert!(registry.snapshot("NEW").is_some());
    }

    #[tokio::test]
    async fn remove_session_closes_stream() {
        let registry = registry();
        let mut connection = registry.connect("EX1", None, 0).expect("connect");
        assert!(registry.remove_session("ex1"));
        assert!(!registry.remove_session("ex1"));

        assert!(matches!(connection.stream.next().await, Some(Frame::Event { .. })));
        assert!(connection.stream.next().await.is_none());
        assert!(registry.snapshot("EX1").is_none());
    }

    #[tokio::test]
    async fn advance_pushes_update_carrying_the_counted_index() {
        let registry = registry();
        let mut connection = registry.connect("EX1", None, 2).expect("connect");
        assert!(matches!(connection.stream.next().await, Some(Frame::Event { .. })));

        match record(&registry, "EX1", "f1") {
            Some(Advance::Counted { snapshot, delivery }) => {
                assert_eq!(snapshot.index, 1);
                assert_eq!(delivery, Delivery::Sent);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(record(&registry, "EX1", "f1"), Some(Advance::Repeated));
        record(&registry, "EX1", "f2");

        for expected in [1, 2] {
            match connection.stream.next().await {
                Some(Frame::Event { event, data }) => {
                    assert_eq!(event, OutboundEvent::RecognitionUpdate);
                    assert_eq!(data["index"], expected);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn advance_without_stream_still_counts() {
        let registry = registry();
        match record(&registry, "EX1", "f1") {
            Some(Advance::Counted { snapshot, delivery }) => {
                assert_eq!(snapshot.index, 1);
                assert_eq!(delivery, Delivery::NoTransport);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(record(&registry, " ", "f1").is_none());
    }

    #[test]
    fn list_all_is_sorted_by_exam_code() {
        let registry = registry();
        registry.get_or_create("B", None, 0);
        registry.get_or_create("A", None, 0);
        let codes: Vec<String> =
            registry.list_all().into_iter().map(|snapshot| snapshot.exam_code).collect();
        assert_eq!(codes, vec!["A", "B"]);
    }

    #[test]
    fn close_all_detaches_every_transport() {
        let registry = registry();
        let _a = registry.connect("A", None, 0).expect("connect");
        let _b = registry.connect("B", None, 0).expect("connect");
        assert_eq!(registry.close_all(), 2);
        assert!(registry.list_all().iter().all(|snapshot| !snapshot.connected));
    }
}
