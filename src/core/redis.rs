use std::sync::Arc;

use redis::aio::{ConnectionManager, PubSub};
use redis::{cmd, Client, RedisError};
use tokio::sync::RwLock;

/// Shared Redis access: a managed connection for health checks and fresh
/// pub/sub connections for the topic consumer.
#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone)]
pub(crate) enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub(crate) async fn health(&self) -> RedisHealth {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// Subscriptions need a dedicated connection; the managed one is not reused.
    pub(crate) async fn pubsub(&self) -> Result<PubSub, RedisError> {
        let client = Client::open(self.url.clone())?;
        client.get_async_pubsub().await
    }
}

#[cfg(test)]
mod tests {
    use super::{RedisHandle, RedisHealth};

    #[tokio::test]
    async fn health_is_disconnected_before_connect() {
        let redis = RedisHandle::new("redis://127.0.0.1:6379/1".to_string());
        assert!(matches!(redis.health().await, RedisHealth::Disconnected));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let redis = RedisHandle::new("not-a-redis-url".to_string());
        assert!(redis.connect().await.is_err());
        assert!(redis.pubsub().await.is_err());
    }
}
