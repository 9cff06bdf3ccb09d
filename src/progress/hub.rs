use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::config::Settings;
use crate::progress::dedup::GlobalDedup;
use crate::progress::event::normalize_exam_code;
use crate::progress::registry::{Connection, HeartbeatReport, RegistryError, SessionRegistry};
use crate::progress::reports::ReportStore;

/// Issues short-lived download URLs for objects the recognizer wrote.
#[async_trait]
pub(crate) trait UrlPresigner: Send + Sync {
    async fn presign_get(&self, key: &str) -> anyhow::Result<String>;
}

/// Everything the ingestion adapters, the sweeper and the HTTP layer share.
#[derive(Clone)]
pub(crate) struct ProgressHub {
    pub(super) registry: SessionRegistry,
    pub(super) dedup: Arc<GlobalDedup>,
    pub(super) reports: Arc<ReportStore>,
    pub(super) presigner: Option<Arc<dyn UrlPresigner>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MaintenanceReport {
    pub(crate) heartbeat: HeartbeatReport,
    pub(crate) evicted: Vec<String>,
    pub(crate) dedup_pruned: usize,
    pub(crate) reports_pruned: usize,
}

impl ProgressHub {
    pub(crate) fn new(
        registry: SessionRegistry,
        dedup: GlobalDedup,
        presigner: Option<Arc<dyn UrlPresigner>>,
    ) -> Self {
        Self {
            registry,
            dedup: Arc::new(dedup),
            reports: Arc::new(ReportStore::new()),
            presigner,
        }
    }

    pub(crate) fn from_settings(
        settings: &Settings,
        presigner: Option<Arc<dyn UrlPresigner>>,
    ) -> Self {
        let progress = settings.progress();
        Self::new(
            SessionRegistry::new(progress.channel_capacity),
            GlobalDedup::new(progress.dedup_ttl(), progress.dedup_max_entries),
            presigner,
        )
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn reports(&self) -> &ReportStore {
        &self.reports
    }

    pub(crate) fn dedup(&self) -> &GlobalDedup {
        &self.dedup
    }

    /// Opens the client stream. When the connect starts a new cycle the
    /// exam's idempotency keys are dropped so re-uploaded objects count again.
    pub(crate) fn connect(
        &self,
        exam_code: &str,
        name_hint: Option<&str>,
        total_hint: u64,
    ) -> Result<Connection, RegistryError> {
        let connection = self.registry.connect(exam_code, name_hint, total_hint)?;
        if connection.cycle_reset {
            let exam_code = connection.snapshot.exam_code.as_str();
            let cleared = self.dedup.clear_exam(exam_code);
            tracing::info!(
                exam_code,
                total = connection.snapshot.total,
                dedup_cleared = cleared,
                "Progress cycle restarted"
            );
        }
        Ok(connection)
    }

    /// Explicit stop: closes the client stream and forgets the exam.
    pub(crate) fn remove_task(&self, exam_code: &str) -> bool {
        let removed = self.registry.remove_session(exam_code);
        if let Some(key) = normalize_exam_code(exam_code) {
            self.reports.clear(&key);
            self.dedup.clear_exam(&key);
        }
        if removed {
            tracing::info!(exam_code, "Progress session stopped");
        }
        removed
    }

    /// One heartbeat-and-sweep pass.
    pub(crate) fn run_maintenance(&self, idle_timeout: Duration) -> MaintenanceReport {
        let heartbeat = self.registry.heartbeat();

        let evicted = self.registry.sweep_idle(idle_timeout);
        for exam_code in &evicted {
            self.reports.clear(exam_code);
            self.dedup.clear_exam(exam_code);
            tracing::info!(exam_code = %exam_code, "Evicted idle progress session");
        }
        if !evicted.is_empty() {
            metrics::counter!("sessions_evicted_total").increment(evicted.len() as u64);
        }

        // Reports written between a sweep and the next event have no session.
        let reports_pruned = self.reports.retain(|exam_code| self.registry.contains(exam_code));
        let dedup_pruned = self.dedup.prune();
        metrics::gauge!("progress_sessions_active").set(self.registry.len() as f64);
        metrics::gauge!("dedup_keys_tracked").set(self.dedup.len() as f64);

        MaintenanceReport { heartbeat, evicted, dedup_pruned, reports_pruned }
    }
}
