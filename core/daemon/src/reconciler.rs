//! Completion reconciler.
//!
//! Every termination signal (explicit end, explicit leave, stale timeout,
//! transport disconnect) funnels through here. The session's `finalized`
//! flag is claimed with a single compare-and-set; the winner computes the
//! end time and duration, writes the terminal record, removes the session
//! from the registry and queues one notification. Losers are no-ops.
//!
//! The in-memory claim and the durable write are tracked separately: if the
//! write keeps failing the session stays registered with its sealed
//! completion, accepts no further updates, and the monitor retries the write
//! later with the same values.

use chrono::{DateTime, Duration, Utc};
use meetlog_protocol::Role;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::StoreError;
use crate::notify::{ActivityCompleted, Notifier};
use crate::registry::{Session, SessionRegistry};
use crate::store::{
    duration_minutes, ActivityRecord, ActivityStore, Completion, FinalizeWrite, TombstoneRow,
    Trigger,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRequest {
    pub session_key: String,
    pub trigger: Trigger,
    /// The trigger's own timestamp; `None` means "now".
    pub at: Option<DateTime<Utc>>,
    pub final_name: Option<String>,
}

impl TerminationRequest {
    pub fn new(session_key: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            session_key: session_key.into(),
            trigger,
            at: None,
            final_name: None,
        }
    }

    pub fn at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.at = at;
        self
    }

    pub fn final_name(mut self, final_name: Option<String>) -> Self {
        self.final_name = final_name;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reconciliation {
    Finalized {
        record_id: i64,
        completion: Completion,
    },
    /// Another trigger already claimed the session.
    AlreadyFinalized,
    /// No registry entry: finalized earlier or never registered.
    UnknownSession,
    /// Claimed, but the durable write did not go through yet.
    PersistDeferred { record_id: i64 },
}

pub struct Reconciler {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ActivityStore>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    tombstone_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ActivityStore>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
        tombstone_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
            retry,
            tombstone_ttl,
        }
    }

    pub fn terminate(&self, request: TerminationRequest) -> Reconciliation {
        let Some(session) = self.registry.lookup(&request.session_key) else {
            debug!(
                session_key = %request.session_key,
                trigger = request.trigger.as_str(),
                "Termination for unknown session ignored"
            );
            return Reconciliation::UnknownSession;
        };

        if !session.claim_finalization() {
            debug!(
                session_key = %request.session_key,
                trigger = request.trigger.as_str(),
                "Session already finalized; trigger ignored"
            );
            return Reconciliation::AlreadyFinalized;
        }

        let end_time = request.at.unwrap_or_else(Utc::now);
        let completion = session.seal(request.trigger, end_time, request.final_name.as_deref());
        info!(
            session_key = %request.session_key,
            trigger = request.trigger.as_str(),
            end_time = %completion.end_time.to_rfc3339(),
            duration_minutes = completion.duration_minutes,
            "Session finalize claimed"
        );
        let outcome = self.persist(&session, &completion);

        if request.trigger == Trigger::ExplicitEnd && session.role().is_host() {
            self.end_meeting(&session, end_time);
        }

        outcome
    }

    /// Finalizes a registered session if it has been silent past `threshold`,
    /// using its last-seen time as the end time.
    pub fn reap_stale(
        &self,
        session: &Arc<Session>,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let Some(last_seen) = session.claim_if_stale(threshold, now) else {
            return Reconciliation::AlreadyFinalized;
        };

        let completion = session.seal(Trigger::StaleTimeout, last_seen, None);
        info!(
            session_key = %session.session_key(),
            last_seen = %last_seen.to_rfc3339(),
            silent_secs = now.signed_duration_since(last_seen).num_seconds(),
            duration_minutes = completion.duration_minutes,
            "Stale session finalize claimed"
        );
        self.persist(session, &completion)
    }

    /// Re-attempts the durable write for a session whose claim succeeded but
    /// whose write failed. Uses the completion sealed by the original winner.
    pub fn retry_pending(&self, session: &Arc<Session>) -> Reconciliation {
        if !session.is_finalized() {
            return Reconciliation::PersistDeferred {
                record_id: session.record_id(),
            };
        }
        if session.is_persisted() {
            return Reconciliation::AlreadyFinalized;
        }
        let Some(completion) = session.completion() else {
            return Reconciliation::PersistDeferred {
                record_id: session.record_id(),
            };
        };
        self.persist(session, &completion)
    }

    /// Backstop for in-progress records whose registry entry is gone (for
    /// example after a daemon restart). Ends at the record's stored last-seen.
    pub fn finalize_orphan(&self, record: &ActivityRecord) -> Result<FinalizeWrite, StoreError> {
        let completion = Completion {
            trigger: Trigger::StaleTimeout,
            end_time: record.last_seen,
            duration_minutes: duration_minutes(record.start_time, record.last_seen),
            final_display_name: record.display_name.clone(),
        };

        let write = self.retry.run("finalize orphaned activity record", || {
            self.store.finalize(record.id, &completion)
        })?;

        if write == FinalizeWrite::Written {
            info!(
                session_key = %record.session_key,
                record_id = record.id,
                duration_minutes = completion.duration_minutes,
                "Orphaned activity record finalized"
            );
            self.write_tombstone(&record.session_key, completion.end_time);
            let role = if record.is_host {
                Role::Host
            } else {
                Role::Participant
            };
            self.emit(ActivityCompleted {
                record_id: record.id,
                user_id: record.user_id.clone(),
                meeting_id: record.meeting_id.clone(),
                final_display_name: completion.final_display_name.clone(),
                duration_minutes: completion.duration_minutes,
                role,
                completed_at: completion.end_time.to_rfc3339(),
            });
        }
        Ok(write)
    }

    /// A host's explicit end closes every other live session in the meeting
    /// at the same instant. Each goes through its own claim, so sessions
    /// that already left keep their own end time.
    fn end_meeting(&self, host: &Arc<Session>, end_time: DateTime<Utc>) {
        let others: Vec<Arc<Session>> = self
            .registry
            .meeting_sessions(host.meeting_id())
            .into_iter()
            .filter(|session| session.session_key() != host.session_key())
            .collect();
        if others.is_empty() {
            return;
        }

        info!(
            meeting_id = %host.meeting_id(),
            sessions = others.len(),
            "Host ended meeting; closing remaining sessions"
        );
        for session in others {
            if !session.claim_finalization() {
                continue;
            }
            let completion = session.seal(Trigger::ExplicitEnd, end_time, None);
            self.persist(&session, &completion);
        }
    }

    fn persist(&self, session: &Arc<Session>, completion: &Completion) -> Reconciliation {
        let record_id = session.record_id();
        let Some(_guard) = session.try_persist_guard() else {
            debug!(
                session_key = %session.session_key(),
                "Finalize write already in flight"
            );
            return Reconciliation::PersistDeferred { record_id };
        };
        if session.is_persisted() {
            return Reconciliation::AlreadyFinalized;
        }

        let write = self.retry.run("finalize activity record", || {
            self.store.finalize(record_id, completion)
        });

        let write = match write {
            Ok(write) => write,
            Err(err) => {
                session.mark_write_failed();
                warn!(
                    session_key = %session.session_key(),
                    record_id,
                    error = %err,
                    "Finalize write failed; session kept for retry"
                );
                return Reconciliation::PersistDeferred { record_id };
            }
        };

        session.mark_persisted();
        // Tombstone first: a start that no longer finds the key registered
        // must already see it.
        self.write_tombstone(session.session_key(), completion.end_time);
        self.registry.remove(session.session_key());

        match write {
            FinalizeWrite::Written => {
                info!(
                    session_key = %session.session_key(),
                    record_id,
                    trigger = completion.trigger.as_str(),
                    duration_minutes = completion.duration_minutes,
                    final_display_name = %completion.final_display_name,
                    "Activity record completed"
                );
                self.emit(ActivityCompleted {
                    record_id,
                    user_id: session.user_id().to_string(),
                    meeting_id: session.meeting_id().to_string(),
                    final_display_name: completion.final_display_name.clone(),
                    duration_minutes: completion.duration_minutes,
                    role: session.role(),
                    completed_at: completion.end_time.to_rfc3339(),
                });
            }
            FinalizeWrite::AlreadyCompleted => {
                debug!(
                    session_key = %session.session_key(),
                    record_id,
                    "Record was already completed; notification skipped"
                );
            }
        }

        Reconciliation::Finalized {
            record_id,
            completion: completion.clone(),
        }
    }

    fn write_tombstone(&self, session_key: &str, finalized_at: DateTime<Utc>) {
        let tombstone = TombstoneRow {
            session_key: session_key.to_string(),
            finalized_at,
            expires_at: Utc::now() + self.tombstone_ttl,
        };
        if let Err(err) = self.store.upsert_tombstone(&tombstone) {
            warn!(session_key = %session_key, error = %err, "Failed to write tombstone");
        }
    }

    fn emit(&self, event: ActivityCompleted) {
        if let Err(err) = self.notifier.notify(&event) {
            warn!(
                user_id = %event.user_id,
                record_id = event.record_id,
                error = %err,
                "Activity notification failed; record remains authoritative"
            );
        }
    }
}
