//! SQLite persistence for meetlog-daemon.
//!
//! This is the single-writer store backing the daemon: activity records,
//! tombstones for recently finalized session keys, and the per-user
//! notification outbox. A partial unique index enforces at most one
//! in-progress record per session key.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::StoreError;
use crate::store::{
    ActivityDraft, ActivityRecord, ActivityStore, Completion, FinalizeWrite, RecordState,
    TombstoneRow, Trigger,
};

const RECORD_COLUMNS: &str = "id, session_key, user_id, meeting_id, state, is_host, \
     start_time, last_seen, display_name, end_time, duration_minutes, \
     final_display_name, trigger_kind";

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn enqueue_notification(
        &self,
        user_id: &str,
        record_id: i64,
        payload: &str,
    ) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO notifications (user_id, record_id, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, record_id, payload, format_timestamp(Utc::now())],
            )
            .map_err(|err| StoreError::sqlite("Failed to enqueue notification", err))?;
            Ok(())
        })
    }

    /// Returns and removes every queued notification for `user_id`, oldest first.
    pub fn drain_notifications(&self, user_id: &str) -> Result<Vec<Value>, StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| StoreError::sqlite("Failed to start drain transaction", err))?;

            let rows: Vec<(i64, String)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, payload FROM notifications \
                         WHERE user_id = ?1 ORDER BY id ASC",
                    )
                    .map_err(|err| StoreError::sqlite("Failed to prepare outbox query", err))?;
                let mapped = stmt
                    .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(|err| StoreError::sqlite("Failed to read outbox rows", err))?;
                let mut rows: Vec<(i64, String)> = Vec::new();
                for row in mapped {
                    rows.push(
                        row.map_err(|err| StoreError::sqlite("Failed to decode outbox row", err))?,
                    );
                }
                rows
            };

            let mut payloads = Vec::with_capacity(rows.len());
            for (id, payload) in rows {
                tx.execute("DELETE FROM notifications WHERE id = ?1", params![id])
                    .map_err(|err| StoreError::sqlite("Failed to delete outbox row", err))?;
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => payloads.push(value),
                    Err(err) => {
                        tracing::warn!(id, error = %err, "Dropping unreadable notification payload");
                    }
                }
            }

            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit outbox drain", err))?;
            Ok(payloads)
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS activity_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_key TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    meeting_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    is_host INTEGER NOT NULL,
                    start_time TEXT NOT NULL,
                    last_seen TEXT NOT NULL,
                    display_name TEXT NOT NULL,
                    end_time TEXT,
                    duration_minutes INTEGER,
                    final_display_name TEXT,
                    trigger_kind TEXT
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_activity_in_progress
                    ON activity_records(session_key) WHERE state = 'in_progress';
                 CREATE INDEX IF NOT EXISTS idx_activity_user
                    ON activity_records(user_id, start_time);
                 CREATE TABLE IF NOT EXISTS tombstones (
                    session_key TEXT PRIMARY KEY,
                    finalized_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    record_id INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| StoreError::sqlite("Failed to initialize schema", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| StoreError::Io {
                context: "Failed to create daemon data dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::sqlite("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::sqlite("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| StoreError::sqlite("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| StoreError::sqlite("Failed to set busy_timeout", err))?;

        Ok(conn)
    }

    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| StoreError::sqlite("Failed to prepare records query", err))?;
            let rows = stmt
                .query_map(params, record_from_row)
                .map_err(|err| StoreError::sqlite("Failed to query records", err))?;

            let mut records = Vec::new();
            for row in rows {
                records
                    .push(row.map_err(|err| StoreError::sqlite("Failed to decode record row", err))?);
            }
            Ok(records)
        })
    }
}

impl ActivityStore for Db {
    fn create_in_progress(&self, draft: &ActivityDraft) -> Result<i64, StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| StoreError::sqlite("Failed to start create transaction", err))?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM activity_records \
                     WHERE session_key = ?1 AND state = 'in_progress'",
                    params![draft.session_key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| StoreError::sqlite("Failed to check in-progress record", err))?;
            if let Some(record_id) = existing {
                return Err(StoreError::DuplicateSession {
                    session_key: draft.session_key.clone(),
                    record_id,
                });
            }

            let start = format_timestamp(draft.start_time);
            tx.execute(
                "INSERT INTO activity_records \
                    (session_key, user_id, meeting_id, state, is_host, start_time, last_seen, display_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
                params![
                    draft.session_key,
                    draft.user_id,
                    draft.meeting_id,
                    RecordState::InProgress.as_str(),
                    draft.is_host,
                    start,
                    draft.display_name
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to insert activity record", err))?;
            let record_id = tx.last_insert_rowid();

            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit activity record", err))?;
            Ok(record_id)
        })
    }

    fn record_heartbeat(
        &self,
        record_id: i64,
        last_seen: DateTime<Utc>,
        display_name: &str,
    ) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE activity_records SET \
                    last_seen = MAX(last_seen, ?2), \
                    display_name = ?3 \
                 WHERE id = ?1 AND state = 'in_progress'",
                params![record_id, format_timestamp(last_seen), display_name],
            )
            .map_err(|err| StoreError::sqlite("Failed to record heartbeat", err))?;
            Ok(())
        })
    }

    fn finalize(
        &self,
        record_id: i64,
        completion: &Completion,
    ) -> Result<FinalizeWrite, StoreError> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| StoreError::sqlite("Failed to start finalize transaction", err))?;

            let state: Option<String> = tx
                .query_row(
                    "SELECT state FROM activity_records WHERE id = ?1",
                    params![record_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| StoreError::sqlite("Failed to read record state", err))?;

            match state.as_deref().and_then(RecordState::from_str) {
                None if state.is_none() => return Err(StoreError::RecordNotFound(record_id)),
                None => {
                    return Err(StoreError::InvalidRow(format!(
                        "record {} has unknown state {:?}",
                        record_id, state
                    )))
                }
                Some(RecordState::Completed) => return Ok(FinalizeWrite::AlreadyCompleted),
                Some(RecordState::InProgress) => {}
            }

            tx.execute(
                "UPDATE activity_records SET \
                    state = ?2, \
                    end_time = ?3, \
                    duration_minutes = ?4, \
                    final_display_name = ?5, \
                    trigger_kind = ?6 \
                 WHERE id = ?1 AND state = 'in_progress'",
                params![
                    record_id,
                    RecordState::Completed.as_str(),
                    format_timestamp(completion.end_time),
                    completion.duration_minutes,
                    completion.final_display_name,
                    completion.trigger.as_str()
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to finalize activity record", err))?;

            tx.commit()
                .map_err(|err| StoreError::sqlite("Failed to commit finalize", err))?;
            Ok(FinalizeWrite::Written)
        })
    }

    fn get(&self, record_id: i64) -> Result<Option<ActivityRecord>, StoreError> {
        let sql = format!("SELECT {} FROM activity_records WHERE id = ?1", RECORD_COLUMNS);
        let mut records = self.query_records(&sql, &[&record_id])?;
        Ok(records.pop())
    }

    fn list_in_progress(&self) -> Result<Vec<ActivityRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM activity_records WHERE state = 'in_progress' ORDER BY last_seen ASC",
            RECORD_COLUMNS
        );
        self.query_records(&sql, &[])
    }

    fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<ActivityRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM activity_records WHERE user_id = ?1 \
             ORDER BY start_time DESC, id DESC LIMIT ?2",
            RECORD_COLUMNS
        );
        let limit = limit as i64;
        self.query_records(&sql, &[&user_id, &limit])
    }

    fn upsert_tombstone(&self, tombstone: &TombstoneRow) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO tombstones (session_key, finalized_at, expires_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(session_key) DO UPDATE SET \
                    finalized_at = excluded.finalized_at, \
                    expires_at = excluded.expires_at",
                params![
                    tombstone.session_key,
                    format_timestamp(tombstone.finalized_at),
                    format_timestamp(tombstone.expires_at)
                ],
            )
            .map_err(|err| StoreError::sqlite("Failed to upsert tombstone", err))?;
            Ok(())
        })
    }

    fn get_tombstone(&self, session_key: &str) -> Result<Option<TombstoneRow>, StoreError> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT session_key, finalized_at, expires_at FROM tombstones \
                 WHERE session_key = ?1",
                params![session_key],
                |row| {
                    Ok(TombstoneRow {
                        session_key: row.get(0)?,
                        finalized_at: timestamp_column(row, 1)?,
                        expires_at: timestamp_column(row, 2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| StoreError::sqlite("Failed to query tombstone", err))
        })
    }

    fn delete_tombstone(&self, session_key: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM tombstones WHERE session_key = ?1",
                params![session_key],
            )
            .map_err(|err| StoreError::sqlite("Failed to delete tombstone", err))?;
            Ok(())
        })
    }

    fn prune_tombstones(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM tombstones WHERE expires_at <= ?1",
                params![format_timestamp(now)],
            )
            .map(|count| count as u64)
            .map_err(|err| StoreError::sqlite("Failed to prune tombstones", err))
        })
    }
}

/// Fixed-width UTC form so text comparison in SQL matches time order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_rfc3339(&raw).ok_or_else(|| conversion_error(index, format!("Bad timestamp: {}", raw)))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    match raw {
        Some(raw) => parse_rfc3339(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(index, format!("Bad timestamp: {}", raw))),
        None => Ok(None),
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityRecord> {
    let state_raw: String = row.get(4)?;
    let state = RecordState::from_str(&state_raw)
        .ok_or_else(|| conversion_error(4, format!("Unknown record state: {}", state_raw)))?;
    let trigger_raw: Option<String> = row.get(12)?;
    let trigger = match trigger_raw {
        Some(raw) => Some(
            Trigger::from_str(&raw)
                .ok_or_else(|| conversion_error(12, format!("Unknown trigger: {}", raw)))?,
        ),
        None => None,
    };

    Ok(ActivityRecord {
        id: row.get(0)?,
        session_key: row.get(1)?,
        user_id: row.get(2)?,
        meeting_id: row.get(3)?,
        state,
        is_host: row.get(5)?,
        start_time: timestamp_column(row, 6)?,
        last_seen: timestamp_column(row, 7)?,
        display_name: row.get(8)?,
        end_time: optional_timestamp_column(row, 9)?,
        duration_minutes: row.get(10)?,
        final_display_name: row.get(11)?,
        trigger,
    })
}
