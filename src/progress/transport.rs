use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::progress::registry::SessionRegistry;

/// Named events on the per-exam push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundEvent {
    Connected,
    RecognitionUpdate,
    FallbackRequired,
    AnswerResult,
    ErrorOccurred,
}

impl OutboundEvent {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::RecognitionUpdate => "recognition_update",
            Self::FallbackRequired => "fallback_required",
            Self::AnswerResult => "answer_result",
            Self::ErrorOccurred => "error_occurred",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Event { event: OutboundEvent, data: Value },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    /// The client is not draining its stream fast enough.
    Backlogged,
    Closed,
}

/// Sending half of one client's push stream.
///
/// Dropping the last `Transport` for an id closes the client's stream.
#[derive(Debug)]
pub(crate) struct Transport {
    id: Uuid,
    tx: mpsc::Sender<Frame>,
}

impl Transport {
    pub(crate) fn open(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Never waits on the client: a full buffer counts as a failed delivery.
    pub(crate) fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Backlogged,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Receiving half handed to the HTTP layer.
///
/// When the response is dropped (client went away, server shutdown) the
/// transport is detached from its session. Detach is keyed by transport id,
/// so a stream that was already superseded by a reconnect leaves the newer
/// transport alone.
pub(crate) struct TransportStream {
    frames: ReceiverStream<Frame>,
    _detach: DetachOnDrop,
}

impl TransportStream {
    pub(super) fn new(
        registry: SessionRegistry,
        exam_code: String,
        transport_id: Uuid,
        rx: mpsc::Receiver<Frame>,
    ) -> Self {
        Self {
            frames: ReceiverStream::new(rx),
            _detach: DetachOnDrop { registry, exam_code, transport_id },
        }
    }
}

impl Stream for TransportStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

struct DetachOnDrop {
    registry: SessionRegistry,
    exam_code: String,
    transport_id: Uuid,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        if self.registry.detach(&self.exam_code, self.transport_id) {
            tracing::info!(exam_code = %self.exam_code, "SSE client disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_buffer_is_reported_without_blocking() {
        let (transport, _rx) = Transport::open(1);
        transport.try_deliver(Frame::Heartbeat).expect("first frame fits");
        assert_eq!(transport.try_deliver(Frame::Heartbeat), Err(DeliveryError::Backlogged));
    }

    #[test]
    fn dropped_receiver_is_reported_as_closed() {
        let (transport, rx) = Transport::open(4);
        drop(rx);
        let frame = Frame::Event { event: OutboundEvent::AnswerResult, data: json!({}) };
        assert_eq!(transport.try_deliver(frame), Err(DeliveryError::Closed));
    }

    #[test]
    fn event_names_match_the_push_protocol() {
        assert_eq!(OutboundEvent::Connected.name(), "connected");
        assert_eq!(OutboundEvent::RecognitionUpdate.name(), "recognition_update");
        assert_eq!(OutboundEvent::FallbackRequired.name(), "fallback_required");
        assert_eq!(OutboundEvent::AnswerResult.name(), "answer_result");
        assert_eq!(OutboundEvent::ErrorOccurred.name(), "error_occurred");
    }
}
