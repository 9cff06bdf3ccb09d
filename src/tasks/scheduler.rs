use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::state::AppState;
use crate::ingest::queue::{QueuePoller, SqsQueueClient};
use crate::ingest::topic::TopicConsumer;
use crate::progress::ProgressHub;

/// Starts the ingestion adapters and the heartbeat/sweep loop. Every task
/// exits once `shutdown` flips to `true`.
pub(crate) async fn spawn(
    state: &AppState,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let settings = state.settings();
    let hub = state.hub().clone();
    let mut handles = Vec::with_capacity(3);

    let progress = settings.progress();
    handles.push(tokio::spawn(maintenance_loop(
        hub.clone(),
        progress.heartbeat_interval(),
        progress.idle_timeout(),
        shutdown.clone(),
    )));

    let sqs = settings.sqs();
    if !sqs.enabled {
        tracing::info!("Queue poller disabled");
    } else if sqs.queue_url.is_empty() {
        tracing::warn!("SQS_ENABLED is set without SQS_QUEUE_URL; queue poller not started");
    } else {
        let client = SqsQueueClient::from_settings(sqs).await;
        let poller = QueuePoller::new(client, hub.clone(), state.poller().clone(), sqs);
        handles.push(tokio::spawn(poller.run(sqs.poll_interval(), shutdown.clone())));
    }

    let topic = settings.topic();
    if topic.enabled {
        let consumer = TopicConsumer::new(state.redis().clone(), hub, topic);
        handles.push(tokio::spawn(consumer.run(shutdown)));
    } else {
        tracing::info!("Topic consumer disabled");
    }

    handles
}

pub(crate) async fn join(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }
}

async fn maintenance_loop(
    hub: ProgressHub,
    heartbeat: Duration,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(heartbeat);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let report = hub.run_maintenance(idle_timeout);
                if report.heartbeat.detached > 0 || !report.evicted.is_empty() {
                    tracing::debug!(
                        heartbeats = report.heartbeat.delivered,
                        detached = report.heartbeat.detached,
                        evicted = report.evicted.len(),
                        dedup_pruned = report.dedup_pruned,
                        "Progress maintenance pass"
                    );
                }
            }
        }
    }
}
