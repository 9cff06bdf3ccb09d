use std::time::Duration;

use futures::StreamExt;
use redis::RedisError;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::config::TopicSettings;
use crate::core::redis::RedisHandle;
use crate::ingest::handle_payload;
use crate::progress::{DispatchOutcome, EventSource, ProgressHub};

/// Push-side adapter: one Redis pub/sub subscription over every configured
/// channel, re-established after a fixed delay whenever it drops.
pub(crate) struct TopicConsumer {
    redis: RedisHandle,
    hub: ProgressHub,
    channels: Vec<String>,
    reconnect_delay: Duration,
}

impl TopicConsumer {
    pub(crate) fn new(redis: RedisHandle, hub: ProgressHub, settings: &TopicSettings) -> Self {
        Self {
            redis,
            hub,
            channels: settings.channels.clone(),
            reconnect_delay: Duration::from_secs(settings.reconnect_seconds),
        }
    }

    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.consume() => match result {
                    Ok(()) => tracing::warn!("Topic subscription closed; reconnecting"),
                    Err(err) => tracing::error!(error = %err, "Topic subscription failed"),
                },
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.reconnect_delay) => {}
            }
        }
        tracing::info!("Topic consumer stopped");
    }

    async fn consume(&self) -> Result<(), RedisError> {
        let mut pubsub = self.redis.pubsub().await?;
        for channel in &self.channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        tracing::info!(channels = ?self.channels, "Subscribed to progress topics");

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let channel = message.get_channel_name().to_string();
            match message.get_payload::<String>() {
                Ok(payload) => {
                    self.handle_message(&channel, &payload).await;
                }
                Err(err) => {
                    tracing::warn!(channel, error = %err, "Discarding non-text topic payload");
                }
            }
        }
        Ok(())
    }

    /// Failures stay local to the message.
    pub(crate) async fn handle_message(
        &self,
        channel: &str,
        payload: &str,
    ) -> Option<DispatchOutcome> {
        match handle_payload(&self.hub, EventSource::Topic, payload).await {
            Ok(outcome) => {
                tracing::debug!(channel, outcome = outcome.label(), "Handled topic message");
                Some(outcome)
            }
            Err(err) => {
                tracing::error!(channel, error = %err, "Failed to handle topic message");
                None
            }
        }
    }
}
