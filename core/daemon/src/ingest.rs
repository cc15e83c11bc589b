//! Event ingest: maps validated lifecycle signals onto the registry, the
//! store and the reconciler.

use chrono::{DateTime, Utc};
use meetlog_protocol::LifecycleSignal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::UserDirectory;
use crate::error::{IngestError, StoreError};
use crate::reconciler::{Reconciler, Reconciliation, TerminationRequest};
use crate::registry::{NewSession, Session, SessionRegistry, TouchOutcome};
use crate::store::{ActivityDraft, ActivityStore, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownSession,
    /// The key was finalized recently; the signal arrived after the fact.
    LateSignal,
    /// A session-start not newer than the key's last finalize.
    ReplayedStart,
    SessionFinalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Registered {
        record_id: i64,
    },
    /// The key already had a live session or an in-progress record.
    Resumed {
        record_id: i64,
    },
    Touched {
        name_changed: bool,
    },
    Ignored {
        reason: IgnoreReason,
    },
    Finalized {
        record_id: i64,
        trigger: Trigger,
        duration_minutes: i64,
        final_display_name: String,
    },
    AlreadyFinalized,
    Deferred {
        record_id: i64,
    },
    /// The key's previous session is still being finalized. The start was
    /// not applied; the client has to send it again.
    StartDeferred {
        previous_record_id: i64,
    },
}

pub struct EventIngest {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ActivityStore>,
    reconciler: Arc<Reconciler>,
    directory: Arc<dyn UserDirectory>,
}

impl EventIngest {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ActivityStore>,
        reconciler: Arc<Reconciler>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            registry,
            store,
            reconciler,
            directory,
        }
    }

    pub fn handle(&self, signal: LifecycleSignal) -> Result<IngestOutcome, IngestError> {
        let session_key = signal.session_key().to_string();
        debug!(
            session_key = %session_key,
            signal_type = ?signal.signal_type(),
            "Lifecycle signal received"
        );

        match signal {
            LifecycleSignal::SessionStart {
                session_key,
                user_id,
                meeting_id,
                role,
                name,
                at,
            } => {
                let new = NewSession {
                    display_name: self.resolve_name(&user_id, name.as_deref()),
                    session_key,
                    user_id,
                    meeting_id,
                    role,
                    join_time: at,
                    record_id: 0,
                };
                self.start(new, name.as_deref())
            }
            LifecycleSignal::NameChanged { name, at, .. } => {
                self.touch(&session_key, at, Some(name.as_str()))
            }
            LifecycleSignal::Heartbeat { name, at, .. } => {
                self.touch(&session_key, at, name.as_deref())
            }
            LifecycleSignal::ExplicitEnd { final_name, at, .. } => self.terminate(
                TerminationRequest::new(session_key, Trigger::ExplicitEnd)
                    .at(at)
                    .final_name(final_name),
            ),
            LifecycleSignal::ExplicitLeave {
                final_name,
                duration_hint_minutes,
                at,
                ..
            } => {
                if let Some(hint) = duration_hint_minutes {
                    // Client-side estimate; the record uses signal timestamps.
                    debug!(
                        session_key = %session_key,
                        hint_minutes = hint,
                        "Leave carried duration hint"
                    );
                }
                self.terminate(
                    TerminationRequest::new(session_key, Trigger::ExplicitLeave)
                        .at(at)
                        .final_name(final_name),
                )
            }
            LifecycleSignal::TransportDisconnect { at, .. } => {
                self.terminate(TerminationRequest::new(session_key, Trigger::Disconnect).at(at))
            }
        }
    }

    /// Explicit name, then the user directory, then the user id.
    fn resolve_name(&self, user_id: &str, name: Option<&str>) -> String {
        name.map(str::to_string)
            .or_else(|| self.directory.display_name(user_id))
            .unwrap_or_else(|| user_id.to_string())
    }

    fn start(
        &self,
        mut new: NewSession,
        explicit_name: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let _admission = self.registry.admission();

        if let Some(existing) = self.registry.lookup(&new.session_key) {
            if !existing.is_finalized() {
                return Ok(self.resume_live(&existing, new.join_time, explicit_name));
            }
            // The key's previous session still owes its terminal write, or
            // another thread is finishing it right now.
            self.reconciler.retry_pending(&existing);
            if self.registry.contains(&new.session_key) {
                warn!(
                    session_key = %new.session_key,
                    previous_record_id = existing.record_id(),
                    "Session start deferred while previous session finalizes; client must resend"
                );
                return Ok(IngestOutcome::StartDeferred {
                    previous_record_id: existing.record_id(),
                });
            }
        }

        if let Some(tombstone) = self.store.get_tombstone(&new.session_key)? {
            if tombstone.is_active(Utc::now()) {
                if new.join_time <= tombstone.finalized_at {
                    info!(
                        session_key = %new.session_key,
                        started_at = %new.join_time.to_rfc3339(),
                        finalized_at = %tombstone.finalized_at.to_rfc3339(),
                        "Replayed session start rejected"
                    );
                    return Ok(IngestOutcome::Ignored {
                        reason: IgnoreReason::ReplayedStart,
                    });
                }
                info!(session_key = %new.session_key, "Session key reused after finalize");
            }
            self.store.delete_tombstone(&new.session_key)?;
        }

        let signal_at = new.join_time;
        let draft = ActivityDraft {
            session_key: new.session_key.clone(),
            user_id: new.user_id.clone(),
            meeting_id: new.meeting_id.clone(),
            is_host: new.role.is_host(),
            start_time: new.join_time,
            display_name: new.display_name.clone(),
        };
        let adopted = match self.store.create_in_progress(&draft) {
            Ok(record_id) => {
                new.record_id = record_id;
                false
            }
            Err(StoreError::DuplicateSession { record_id, .. }) => {
                let record = self
                    .store
                    .get(record_id)?
                    .ok_or(StoreError::RecordNotFound(record_id))?;
                info!(
                    session_key = %new.session_key,
                    record_id,
                    "Adopting existing in-progress record"
                );
                new.record_id = record.id;
                new.join_time = record.start_time;
                new.display_name = record.display_name;
                true
            }
            Err(err) => return Err(err.into()),
        };

        // Registry inserts only happen under the admission lock, and the key
        // was checked free above, so this cannot collide.
        let session = self.registry.register(new)?;
        if adopted {
            session.touch(signal_at, explicit_name);
            self.mirror(&session);
            return Ok(IngestOutcome::Resumed {
                record_id: session.record_id(),
            });
        }
        info!(
            session_key = %session.session_key(),
            user_id = %session.user_id(),
            meeting_id = %session.meeting_id(),
            role = session.role().as_str(),
            record_id = session.record_id(),
            "Session started"
        );
        Ok(IngestOutcome::Registered {
            record_id: session.record_id(),
        })
    }

    fn resume_live(
        &self,
        session: &Arc<Session>,
        at: DateTime<Utc>,
        explicit_name: Option<&str>,
    ) -> IngestOutcome {
        if let TouchOutcome::Applied { .. } = session.touch(at, explicit_name) {
            self.mirror(session);
        }
        debug!(session_key = %session.session_key(), "Start for live session treated as resume");
        IngestOutcome::Resumed {
            record_id: session.record_id(),
        }
    }

    fn touch(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
        name: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let Some(session) = self.registry.lookup(session_key) else {
            return Ok(IngestOutcome::Ignored {
                reason: self.unknown_reason(session_key),
            });
        };

        match session.touch(at, name) {
            TouchOutcome::Finalized => Ok(IngestOutcome::Ignored {
                reason: IgnoreReason::SessionFinalized,
            }),
            TouchOutcome::Applied { name_changed } => {
                if name_changed {
                    debug!(
                        session_key = %session_key,
                        display_name = %session.display_name(),
                        "Display name updated"
                    );
                }
                self.mirror(&session);
                Ok(IngestOutcome::Touched { name_changed })
            }
        }
    }

    fn terminate(&self, request: TerminationRequest) -> Result<IngestOutcome, IngestError> {
        let session_key = request.session_key.clone();
        let outcome = match self.reconciler.terminate(request) {
            Reconciliation::Finalized {
                record_id,
                completion,
            } => IngestOutcome::Finalized {
                record_id,
                trigger: completion.trigger,
                duration_minutes: completion.duration_minutes,
                final_display_name: completion.final_display_name,
            },
            Reconciliation::AlreadyFinalized => IngestOutcome::AlreadyFinalized,
            Reconciliation::UnknownSession => IngestOutcome::Ignored {
                reason: self.unknown_reason(&session_key),
            },
            Reconciliation::PersistDeferred { record_id } => IngestOutcome::Deferred { record_id },
        };
        Ok(outcome)
    }

    /// Mirrors live state onto the in-progress record for the backstop sweep.
    fn mirror(&self, session: &Session) {
        if let Err(err) = self.store.record_heartbeat(
            session.record_id(),
            session.last_seen(),
            &session.display_name(),
        ) {
            warn!(
                session_key = %session.session_key(),
                error = %err,
                "Failed to mirror heartbeat"
            );
        }
    }

    fn unknown_reason(&self, session_key: &str) -> IgnoreReason {
        match self.store.get_tombstone(session_key) {
            Ok(Some(tombstone)) if tombstone.is_active(Utc::now()) => {
                debug!(session_key = %session_key, "Late signal for finalized session dropped");
                IgnoreReason::LateSignal
            }
            Ok(_) => {
                debug!(session_key = %session_key, "Signal for unknown session ignored");
                IgnoreReason::UnknownSession
            }
            Err(err) => {
                warn!(session_key = %session_key, error = %err, "Tombstone lookup failed");
                IgnoreReason::UnknownSession
            }
        }
    }
}
