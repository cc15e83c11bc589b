//! Periodic liveness sweep.
//!
//! Each pass finalizes registered sessions that have been silent past the
//! soft threshold, retries terminal writes that failed earlier, closes
//! orphaned in-progress records past the hard threshold, and prunes expired
//! tombstones. One failing session never aborts the pass.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::reconciler::{Reconciler, Reconciliation};
use crate::registry::SessionRegistry;
use crate::store::{ActivityStore, FinalizeWrite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub swept_at: DateTime<Utc>,
    pub live_sessions: usize,
    pub stale_finalized: usize,
    pub orphans_finalized: usize,
    pub retried: usize,
    pub tombstones_pruned: u64,
    pub errors: usize,
}

impl SweepReport {
    fn new(swept_at: DateTime<Utc>) -> Self {
        Self {
            swept_at,
            live_sessions: 0,
            stale_finalized: 0,
            orphans_finalized: 0,
            retried: 0,
            tombstones_pruned: 0,
            errors: 0,
        }
    }
}

pub struct HeartbeatMonitor {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ActivityStore>,
    reconciler: Arc<Reconciler>,
    config: MonitorConfig,
    last_report: Mutex<Option<SweepReport>>,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ActivityStore>,
        reconciler: Arc<Reconciler>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            reconciler,
            config,
            last_report: Mutex::new(None),
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::new(now);
        let threshold = self.config.stale_threshold();

        for session in self.registry.snapshot() {
            if session.needs_persist_retry() {
                report.retried += 1;
                match self.reconciler.retry_pending(&session) {
                    Reconciliation::PersistDeferred { .. } => report.errors += 1,
                    _ => debug!(session_key = %session.session_key(), "Deferred finalize persisted"),
                }
                continue;
            }
            if session.is_finalized() {
                continue;
            }
            match self.reconciler.reap_stale(&session, threshold, now) {
                Reconciliation::Finalized { .. } => report.stale_finalized += 1,
                Reconciliation::PersistDeferred { .. } => {
                    report.stale_finalized += 1;
                    report.errors += 1;
                }
                Reconciliation::AlreadyFinalized | Reconciliation::UnknownSession => {}
            }
        }

        self.close_orphans(now, &mut report);

        match self.store.prune_tombstones(now) {
            Ok(pruned) => report.tombstones_pruned = pruned,
            Err(err) => {
                report.errors += 1;
                warn!(error = %err, "Failed to prune tombstones");
            }
        }

        report.live_sessions = self.registry.len();
        if report.stale_finalized > 0 || report.orphans_finalized > 0 || report.errors > 0 {
            info!(
                live_sessions = report.live_sessions,
                stale_finalized = report.stale_finalized,
                orphans_finalized = report.orphans_finalized,
                retried = report.retried,
                errors = report.errors,
                "Heartbeat sweep finished"
            );
        } else {
            debug!(
                live_sessions = report.live_sessions,
                tombstones_pruned = report.tombstones_pruned,
                "Heartbeat sweep finished"
            );
        }

        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        report
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().ok().and_then(|last| last.clone())
    }

    pub fn spawn(self: Arc<Self>) {
        let interval = self.config.sweep_interval();
        thread::spawn(move || loop {
            thread::sleep(interval);
            self.sweep(Utc::now());
        });
    }

    fn close_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let records = match self.store.list_in_progress() {
            Ok(records) => records,
            Err(err) => {
                report.errors += 1;
                warn!(error = %err, "Failed to list in-progress records");
                return;
            }
        };

        let hard_threshold = self.config.hard_threshold();
        for record in records {
            if now.signed_duration_since(record.last_seen) <= hard_threshold {
                continue;
            }
            let _admission = self.registry.admission();
            if self.registry.contains(&record.session_key) {
                continue;
            }
            match self.reconciler.finalize_orphan(&record) {
                Ok(FinalizeWrite::Written) => report.orphans_finalized += 1,
                Ok(FinalizeWrite::AlreadyCompleted) => {}
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        session_key = %record.session_key,
                        record_id = record.id,
                        error = %err,
                        "Failed to finalize orphaned record"
                    );
                }
            }
        }
    }
}
