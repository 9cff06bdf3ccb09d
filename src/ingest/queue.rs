use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::config::SqsSettings;
use crate::ingest::{handle_payload, HandleError};
use crate::progress::{EventSource, ProgressHub};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueMessage {
    pub(crate) body: String,
    pub(crate) receipt_handle: String,
}

#[derive(Debug, Error)]
pub(crate) enum QueueError {
    #[error("failed to receive messages: {0}")]
    Receive(String),
    #[error("failed to delete message: {0}")]
    Delete(String),
}

#[async_trait]
pub(crate) trait QueueClient: Send + Sync {
    async fn receive(
        &self,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
pub(crate) struct SqsQueueClient {
    client: Client,
    queue_url: String,
}

impl SqsQueueClient {
    pub(crate) async fn from_settings(settings: &SqsSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let config = loader.load().await;

        Self { client: Client::new(&config), queue_url: settings.queue_url.clone() }
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(
        &self,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|err| QueueError::Receive(DisplayErrorContext(err).to_string()))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let Some(receipt_handle) = message.receipt_handle() else {
                    tracing::warn!(
                        message_id = message.message_id().unwrap_or("-"),
                        "Skipping queue message without receipt handle"
                    );
                    return None;
                };
                Some(QueueMessage {
                    body: message.body().unwrap_or_default().to_string(),
                    receipt_handle: receipt_handle.to_string(),
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|err| QueueError::Delete(DisplayErrorContext(err).to_string()))?;
        Ok(())
    }
}

/// Consecutive-failure breaker shared between the poller and the operator
/// endpoints. Once tripped it stays open until [`PollerControl::resume`].
#[derive(Debug, Clone)]
pub(crate) struct PollerControl {
    failures: Arc<AtomicU32>,
    max_failures: u32,
}

impl PollerControl {
    pub(crate) fn new(max_failures: u32) -> Self {
        Self { failures: Arc::new(AtomicU32::new(0)), max_failures: max_failures.max(1) }
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub(crate) fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.failure_count() >= self.max_failures
    }

    /// Returns the failure count including this one.
    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub(crate) fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Clears the breaker; returns whether polling was suspended.
    pub(crate) fn resume(&self) -> bool {
        self.failures.swap(0, Ordering::SeqCst) >= self.max_failures
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchReport {
    pub(crate) received: usize,
    pub(crate) handled: usize,
    /// Unparseable messages, deleted so they are not redelivered forever.
    pub(crate) rejected: usize,
    /// Left on the queue for redelivery.
    pub(crate) retained: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Suspended,
    Failed,
    Batch(BatchReport),
}

pub(crate) struct QueuePoller<C> {
    client: C,
    hub: ProgressHub,
    control: PollerControl,
    max_messages: i32,
    wait_seconds: i32,
}

impl<C: QueueClient> QueuePoller<C> {
    pub(crate) fn new(
        client: C,
        hub: ProgressHub,
        control: PollerControl,
        settings: &SqsSettings,
    ) -> Self {
        Self {
            client,
            hub,
            control,
            max_messages: settings.max_messages,
            wait_seconds: settings.wait_seconds,
        }
    }

    pub(crate) async fn poll_once(&self) -> PollOutcome {
        if self.control.is_suspended() {
            return PollOutcome::Suspended;
        }

        let messages = match self.client.receive(self.max_messages, self.wait_seconds).await {
            Ok(messages) => {
                self.control.record_success();
                messages
            }
            Err(err) => {
                metrics::counter!("ingest_poll_failures_total").increment(1);
                let failures = self.control.record_failure();
                if failures == self.control.max_failures() {
                    tracing::error!(
                        error = %err,
                        failures,
                        "Queue polling suspended after repeated failures; resume required"
                    );
                } else {
                    tracing::warn!(error = %err, failures, "Queue poll failed");
                }
                return PollOutcome::Failed;
            }
        };

        let mut report = BatchReport { received: messages.len(), ..BatchReport::default() };
        for message in messages {
            match handle_payload(&self.hub, EventSource::Queue, &message.body).await {
                Ok(_) => {
                    self.acknowledge(&message).await;
                    report.handled += 1;
                }
                Err(HandleError::Parse(err)) => {
                    tracing::warn!(error = %err, "Dropping malformed queue message");
                    metrics::counter!(
                        "ingest_messages_total",
                        "source" => EventSource::Queue.label(),
                        "outcome" => "malformed"
                    )
                    .increment(1);
                    self.acknowledge(&message).await;
                    report.rejected += 1;
                }
                Err(err @ HandleError::Dispatch(_)) => {
                    tracing::error!(error = %err, "Queue message left for redelivery");
                    report.retained += 1;
                }
            }
        }
        PollOutcome::Batch(report)
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        if let Err(err) = self.client.delete(&message.receipt_handle).await {
            tracing::warn!(error = %err, "Failed to delete queue message");
        }
    }

    pub(crate) async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            max_messages = self.max_messages,
            wait_seconds = self.wait_seconds,
            "Queue poller started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.poll_once() => {}
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(interval) => {}
            }
        }
        tracing::info!("Queue poller stopped");
    }
}
