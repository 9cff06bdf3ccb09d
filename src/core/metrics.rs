use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    if PROM_HANDLE.get().is_none() {
        let handle = PrometheusBuilder::new().install_recorder()?;
        let _ = PROM_HANDLE.set(handle);
        describe();
    }
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("ingest_messages_total", "Inbound events handled, by source and outcome");
    describe_counter!("ingest_poll_failures_total", "Failed queue receive calls");
    describe_counter!("dedup_dropped_total", "Events suppressed by the global or per-task filter");
    describe_counter!("sse_events_sent_total", "Events pushed to connected clients");
    describe_counter!("sse_transports_detached_total", "Client streams detached, by reason");
    describe_counter!("sessions_evicted_total", "Sessions removed by the idle sweep");
    describe_gauge!("progress_sessions_active", "Sessions currently tracked");
    describe_gauge!("dedup_keys_tracked", "Idempotency keys currently remembered");
    describe_counter!("http_requests_total", "HTTP responses, by status");
    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request latency"
    );
}
