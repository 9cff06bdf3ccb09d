pub(crate) mod queue;
pub(crate) mod topic;

use thiserror::Error;

use crate::progress::event::{InboundEvent, ParseError};
use crate::progress::{DispatchOutcome, EventSource, ProgressHub};

#[derive(Debug, Error)]
pub(crate) enum HandleError {
    /// The payload can never be handled; retrying it is pointless.
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("dispatch failed: {0:#}")]
    Dispatch(anyhow::Error),
}

/// Parse-and-route step shared by every adapter.
pub(crate) async fn handle_payload(
    hub: &ProgressHub,
    source: EventSource,
    raw: &str,
) -> Result<DispatchOutcome, HandleError> {
    let event = InboundEvent::parse(raw)?;
    let outcome = hub.dispatch(event, source).await.map_err(HandleError::Dispatch)?;
    metrics::counter!(
        "ingest_messages_total",
        "source" => source.label(),
        "outcome" => outcome.label()
    )
    .increment(1);
    Ok(outcome)
}
