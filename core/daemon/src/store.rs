//! Durable activity records and the store interface the reconciler writes to.
//!
//! One record per session: created `in_progress` at session start, frozen to
//! `completed` exactly once. The SQLite adapter lives in `db.rs`; tests use
//! the in-memory store in [`testing`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    InProgress,
    Completed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::InProgress => "in_progress",
            RecordState::Completed => "completed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(RecordState::InProgress),
            "completed" => Some(RecordState::Completed),
            _ => None,
        }
    }
}

/// The signal that won the right to finalize a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    ExplicitEnd,
    ExplicitLeave,
    StaleTimeout,
    Disconnect,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::ExplicitEnd => "explicit_end",
            Trigger::ExplicitLeave => "explicit_leave",
            Trigger::StaleTimeout => "stale_timeout",
            Trigger::Disconnect => "disconnect",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "explicit_end" => Some(Trigger::ExplicitEnd),
            "explicit_leave" => Some(Trigger::ExplicitLeave),
            "stale_timeout" => Some(Trigger::StaleTimeout),
            "disconnect" => Some(Trigger::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDraft {
    pub session_key: String,
    pub user_id: String,
    pub meeting_id: String,
    pub is_host: bool,
    pub start_time: DateTime<Utc>,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRecord {
    pub id: i64,
    pub session_key: String,
    pub user_id: String,
    pub meeting_id: String,
    pub state: RecordState,
    pub is_host: bool,
    pub start_time: DateTime<Utc>,
    /// Mirrors the registry while in progress; used by the backstop sweep.
    pub last_seen: DateTime<Utc>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
}

/// Terminal values computed once by the finalize winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub trigger: Trigger,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub final_display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeWrite {
    Written,
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TombstoneRow {
    pub session_key: String,
    pub finalized_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TombstoneRow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub trait ActivityStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateSession`] when the key already has an
    /// in-progress record; callers adopt that record.
    fn create_in_progress(&self, draft: &ActivityDraft) -> Result<i64, StoreError>;

    /// No-op for completed records.
    fn record_heartbeat(
        &self,
        record_id: i64,
        last_seen: DateTime<Utc>,
        display_name: &str,
    ) -> Result<(), StoreError>;

    /// Idempotent: a completed record is left untouched.
    fn finalize(&self, record_id: i64, completion: &Completion)
        -> Result<FinalizeWrite, StoreError>;

    fn get(&self, record_id: i64) -> Result<Option<ActivityRecord>, StoreError>;

    fn list_in_progress(&self) -> Result<Vec<ActivityRecord>, StoreError>;

    fn list_for_user(&self, user_id: &str, limit: usize)
        -> Result<Vec<ActivityRecord>, StoreError>;

    fn upsert_tombstone(&self, tombstone: &TombstoneRow) -> Result<(), StoreError>;

    fn get_tombstone(&self, session_key: &str) -> Result<Option<TombstoneRow>, StoreError>;

    fn delete_tombstone(&self, session_key: &str) -> Result<(), StoreError>;

    fn prune_tombstones(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Whole minutes between `start` and `end`, rounded half away from zero and
/// never below one.
pub fn duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = end.signed_duration_since(start).num_milliseconds();
    let minutes = (millis as f64 / 60_000.0).round() as i64;
    minutes.max(1)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store with failure injection for finalize writes.
    #[derive(Default)]
    pub struct MemoryStore {
        records: Mutex<Vec<ActivityRecord>>,
        tombstones: Mutex<HashMap<String, TombstoneRow>>,
        failing_finalizes: AtomicU32,
        finalize_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn fail_next_finalizes(&self, count: u32) {
            self.failing_finalizes.store(count, Ordering::SeqCst);
        }

        pub fn finalize_calls(&self) -> usize {
            self.finalize_calls.load(Ordering::SeqCst)
        }

        pub fn records(&self) -> Vec<ActivityRecord> {
            self.records.lock().expect("records lock").clone()
        }

        pub fn completed_for_key(&self, session_key: &str) -> Vec<ActivityRecord> {
            self.records()
                .into_iter()
                .filter(|record| {
                    record.session_key == session_key && record.state == RecordState::Completed
                })
                .collect()
        }
    }

    impl ActivityStore for MemoryStore {
        fn create_in_progress(&self, draft: &ActivityDraft) -> Result<i64, StoreError> {
            let mut records = self.records.lock().expect("records lock");
            if let Some(existing) = records.iter().find(|record| {
                record.session_key == draft.session_key && record.state == RecordState::InProgress
            }) {
                return Err(StoreError::DuplicateSession {
                    session_key: draft.session_key.clone(),
                    record_id: existing.id,
                });
            }
            let id = records.len() as i64 + 1;
            records.push(ActivityRecord {
                id,
                session_key: draft.session_key.clone(),
                user_id: draft.user_id.clone(),
                meeting_id: draft.meeting_id.clone(),
                state: RecordState::InProgress,
                is_host: draft.is_host,
                start_time: draft.start_time,
                last_seen: draft.start_time,
                display_name: draft.display_name.clone(),
                end_time: None,
                duration_minutes: None,
                final_display_name: None,
                trigger: None,
            });
            Ok(id)
        }

        fn record_heartbeat(
            &self,
            record_id: i64,
            last_seen: DateTime<Utc>,
            display_name: &str,
        ) -> Result<(), StoreError> {
            let mut records = self.records.lock().expect("records lock");
            if let Some(record) = records
                .iter_mut()
                .find(|record| record.id == record_id && record.state == RecordState::InProgress)
            {
                record.last_seen = record.last_seen.max(last_seen);
                record.display_name = display_name.to_string();
            }
            Ok(())
        }

        fn finalize(
            &self,
            record_id: i64,
            completion: &Completion,
        ) -> Result<FinalizeWrite, StoreError> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_finalizes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_finalizes.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::sqlite(
                    "finalize activity record",
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                        None,
                    ),
                ));
            }

            let mut records = self.records.lock().expect("records lock");
            let record = records
                .iter_mut()
                .find(|record| record.id == record_id)
                .ok_or(StoreError::RecordNotFound(record_id))?;
            if record.state == RecordState::Completed {
                return Ok(FinalizeWrite::AlreadyCompleted);
            }
            record.state = RecordState::Completed;
            record.end_time = Some(completion.end_time);
            record.duration_minutes = Some(completion.duration_minutes);
            record.final_display_name = Some(completion.final_display_name.clone());
            record.trigger = Some(completion.trigger);
            Ok(FinalizeWrite::Written)
        }

        fn get(&self, record_id: i64) -> Result<Option<ActivityRecord>, StoreError> {
            Ok(self
                .records()
                .into_iter()
                .find(|record| record.id == record_id))
        }

        fn list_in_progress(&self) -> Result<Vec<ActivityRecord>, StoreError> {
            Ok(self
                .records()
                .into_iter()
                .filter(|record| record.state == RecordState::InProgress)
                .collect())
        }

        fn list_for_user(
            &self,
            user_id: &str,
            limit: usize,
        ) -> Result<Vec<ActivityRecord>, StoreError> {
            Ok(self
                .records()
                .into_iter()
                .filter(|record| record.user_id == user_id)
                .take(limit)
                .collect())
        }

        fn upsert_tombstone(&self, tombstone: &TombstoneRow) -> Result<(), StoreError> {
            self.tombstones
                .lock()
                .expect("tombstones lock")
                .insert(tombstone.session_key.clone(), tombstone.clone());
            Ok(())
        }

        fn get_tombstone(&self, session_key: &str) -> Result<Option<TombstoneRow>, StoreError> {
            Ok(self
                .tombstones
                .lock()
                .expect("tombstones lock")
                .get(session_key)
                .cloned())
        }

        fn delete_tombstone(&self, session_key: &str) -> Result<(), StoreError> {
            self.tombstones
                .lock()
                .expect("tombstones lock")
                .remove(session_key);
            Ok(())
        }

        fn prune_tombstones(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
            let mut tombstones = self.tombstones.lock().expect("tombstones lock");
            let before = tombstones.len();
            tombstones.retain(|_, row| row.is_active(now));
            Ok((before - tombstones.len()) as u64)
        }
    }
}
