use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::ingest::queue::PollerControl;
use crate::progress::ProgressHub;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    redis: RedisHandle,
    hub: ProgressHub,
    poller: PollerControl,
}

impl AppState {
    pub(crate) fn new(settings: Settings, redis: RedisHandle, hub: ProgressHub) -> Self {
        let poller = PollerControl::new(settings.sqs().max_failures);
        Self { inner: Arc::new(InnerState { settings, redis, hub, poller }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn hub(&self) -> &ProgressHub {
        &self.inner.hub
    }

    pub(crate) fn poller(&self) -> &PollerControl {
        &self.inner.poller
    }
}
