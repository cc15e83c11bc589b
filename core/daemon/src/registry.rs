//! In-memory table of live sessions, keyed by connection identity.
//!
//! The registry map lock is only held to insert, look up, or remove an
//! `Arc<Session>`. Everything mutable about a session sits behind that
//! session's own mutex and atomics, so unrelated sessions never contend.
//!
//! Admitting a session (creating or adopting its record and inserting it
//! here) and closing an orphaned record both run under the admission lock,
//! so the backstop never finalizes a record that a start is about to own.

use chrono::{DateTime, Utc};
use meetlog_protocol::Role;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RegistryError;
use crate::names::ResolvedName;
use crate::store::{duration_minutes, Completion, Trigger};

#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_key: String,
    pub user_id: String,
    pub meeting_id: String,
    pub role: Role,
    pub join_time: DateTime<Utc>,
    pub display_name: String,
    pub record_id: i64,
}

#[derive(Debug)]
struct LiveState {
    last_seen: DateTime<Utc>,
    name: ResolvedName,
    completion: Option<Completion>,
}

#[derive(Debug)]
pub struct Session {
    session_key: String,
    user_id: String,
    meeting_id: String,
    role: Role,
    join_time: DateTime<Utc>,
    record_id: i64,
    /// Set once by whichever termination path claims the session.
    finalized: AtomicBool,
    /// Set once the terminal record is durable.
    persisted: AtomicBool,
    write_failed: AtomicBool,
    live: Mutex<LiveState>,
    persist_guard: Mutex<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutcome {
    Applied { name_changed: bool },
    Finalized,
}

impl Session {
    fn new(new: NewSession) -> Self {
        Self {
            live: Mutex::new(LiveState {
                last_seen: new.join_time,
                name: ResolvedName::new(new.display_name, new.join_time),
                completion: None,
            }),
            session_key: new.session_key,
            user_id: new.user_id,
            meeting_id: new.meeting_id,
            role: new.role,
            join_time: new.join_time,
            record_id: new.record_id,
            finalized: AtomicBool::new(false),
            persisted: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            persist_guard: Mutex::new(()),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn join_time(&self) -> DateTime<Utc> {
        self.join_time
    }

    pub fn record_id(&self) -> i64 {
        self.record_id
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.live().last_seen
    }

    pub fn display_name(&self) -> String {
        self.live().name.as_str().to_string()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Finalized, failed to persist, and waiting for a sweep retry.
    pub fn needs_persist_retry(&self) -> bool {
        self.is_finalized() && !self.is_persisted() && self.write_failed.load(Ordering::Acquire)
    }

    pub fn completion(&self) -> Option<Completion> {
        self.live().completion.clone()
    }

    /// Advances `last_seen` and offers `name` under the timestamp policy.
    /// Once finalized the session accepts no further updates.
    pub fn touch(&self, at: DateTime<Utc>, name: Option<&str>) -> TouchOutcome {
        let mut live = self.live();
        if self.is_finalized() {
            return TouchOutcome::Finalized;
        }
        if at > live.last_seen {
            live.last_seen = at;
        }
        let name_changed = name.map(|name| live.name.offer(name, at)).unwrap_or(false);
        TouchOutcome::Applied { name_changed }
    }

    /// The single `false -> true` transition. Exactly one caller gets `true`.
    pub fn claim_finalization(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the session only if it has been silent for longer than
    /// `threshold`. Returns the last-seen time that becomes the end time.
    ///
    /// The check and the claim happen under the session lock, so a heartbeat
    /// landing mid-sweep either refreshes the session first or is ignored.
    pub fn claim_if_stale(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let live = self.live();
        if now.signed_duration_since(live.last_seen) <= threshold {
            return None;
        }
        if !self.claim_finalization() {
            return None;
        }
        Some(live.last_seen)
    }

    /// Freezes the terminal values after a successful claim. The winning
    /// trigger's final name is offered at the trigger's own timestamp.
    pub fn seal(
        &self,
        trigger: Trigger,
        end_time: DateTime<Utc>,
        final_name: Option<&str>,
    ) -> Completion {
        let mut live = self.live();
        if let Some(existing) = live.completion.as_ref() {
            return existing.clone();
        }
        if let Some(name) = final_name {
            live.name.offer(name, end_time);
        }
        let completion = Completion {
            trigger,
            end_time,
            duration_minutes: duration_minutes(self.join_time, end_time),
            final_display_name: live.name.as_str().to_string(),
        };
        live.completion = Some(completion.clone());
        completion
    }

    pub fn mark_persisted(&self) -> bool {
        self.write_failed.store(false, Ordering::Release);
        self.persisted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_write_failed(&self) {
        self.write_failed.store(true, Ordering::Release);
    }

    /// Serializes durable writes for this session without blocking.
    pub fn try_persist_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.persist_guard.try_lock().ok()
    }

    pub fn view(&self) -> SessionView {
        let live = self.live();
        SessionView {
            session_key: self.session_key.clone(),
            user_id: self.user_id.clone(),
            meeting_id: self.meeting_id.clone(),
            role: self.role,
            record_id: self.record_id,
            join_time: self.join_time,
            last_seen: live.last_seen,
            display_name: live.name.as_str().to_string(),
            finalized: self.is_finalized(),
        }
    }

    fn live(&self) -> MutexGuard<'_, LiveState> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Snapshot of a live session for IPC responses.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_key: String,
    pub user_id: String,
    pub meeting_id: String,
    pub role: Role,
    pub record_id: i64,
    pub join_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub display_name: String,
    pub finalized: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    admission: Mutex<()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held across record creation and `register` by session starts, and
    /// across the check-then-finalize of an orphaned record by the monitor.
    pub fn admission(&self) -> MutexGuard<'_, ()> {
        self.admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, new: NewSession) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&new.session_key) {
            let session_key = new.session_key.clone();
            return Err(if existing.is_finalized() {
                RegistryError::PendingFinalize { session_key }
            } else {
                RegistryError::AlreadyActive { session_key }
            });
        }

        let session = Arc::new(Session::new(new));
        sessions.insert(session.session_key.clone(), Arc::clone(&session));
        tracing::debug!(
            session_key = %session.session_key,
            meeting_id = %session.meeting_id,
            role = session.role.as_str(),
            live_sessions = sessions.len(),
            "Session registered"
        );
        Ok(session)
    }

    pub fn lookup(&self, session_key: &str) -> Option<Arc<Session>> {
        self.sessions().get(session_key).cloned()
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.sessions().contains_key(session_key)
    }

    /// Only the reconciler calls this, after the terminal write succeeded.
    pub fn remove(&self, session_key: &str) -> Option<Arc<Session>> {
        self.sessions().remove(session_key)
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }

    pub fn meeting_sessions(&self, meeting_id: &str) -> Vec<Arc<Session>> {
        self.sessions()
            .values()
            .filter(|session| session.meeting_id == meeting_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::thread;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn new_session(key: &str, meeting_id: &str, role: Role) -> NewSession {
        NewSession {
            session_key: key.to_string(),
            user_id: "user-1".to_string(),
            meeting_id: meeting_id.to_string(),
            role,
            join_time: t0(),
            display_name: "Meeting".to_string(),
            record_id: 1,
        }
    }

    #[test]
    fn register_rejects_active_duplicate() {
        let registry = SessionRegistry::new();
        registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("first register");
        let err = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect_err("duplicate");
        assert_eq!(
            err,
            RegistryError::AlreadyActive {
                session_key: "conn-1".to_string()
            }
        );
    }

    #[test]
    fn register_reports_pending_finalize() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");
        assert!(session.claim_finalization());
        let err = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect_err("pending");
        assert!(matches!(err, RegistryError::PendingFinalize { .. }));
    }

    #[test]
    fn lookup_unknown_key_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn touch_keeps_last_seen_monotonic_and_name_ordered() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Participant))
            .expect("register");

        let t1 = t0() + Duration::seconds(10);
        let t2 = t0() + Duration::seconds(20);
        session.touch(t2, Some("Second"));
        session.touch(t1, Some("First"));

        assert_eq!(session.display_name(), "Second");
        assert_eq!(session.last_seen(), t2);
    }

    #[test]
    fn late_name_after_newer_heartbeat_still_applies() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");

        session.touch(t0() + Duration::seconds(30), None);
        session.touch(t0() + Duration::seconds(10), Some("Standup"));

        assert_eq!(session.display_name(), "Standup");
        assert_eq!(session.last_seen(), t0() + Duration::seconds(30));
    }

    #[test]
    fn finalized_session_ignores_touches() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");
        assert!(session.claim_finalization());

        let outcome = session.touch(t0() + Duration::minutes(5), Some("Late"));
        assert_eq!(outcome, TouchOutcome::Finalized);
        assert_eq!(session.display_name(), "Meeting");
        assert_eq!(session.last_seen(), t0());
    }

    #[test]
    fn claim_finalization_has_one_winner_across_threads() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || session.claim_finalization())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn claim_if_stale_respects_threshold() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");
        session.touch(t0() + Duration::minutes(1), None);

        let threshold = Duration::minutes(5);
        assert_eq!(
            session.claim_if_stale(threshold, t0() + Duration::minutes(6)),
            None
        );
        assert!(!session.is_finalized());
        assert_eq!(
            session.claim_if_stale(threshold, t0() + Duration::minutes(7)),
            Some(t0() + Duration::minutes(1))
        );
        assert!(session.is_finalized());
    }

    #[test]
    fn seal_applies_final_name_and_freezes() {
        let registry = SessionRegistry::new();
        let session = registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");
        assert!(session.claim_finalization());

        let end = t0() + Duration::seconds(150);
        let completion = session.seal(Trigger::ExplicitEnd, end, Some("Retro"));
        assert_eq!(completion.duration_minutes, 3);
        assert_eq!(completion.final_display_name, "Retro");

        let again = session.seal(Trigger::Disconnect, end + Duration::minutes(9), None);
        assert_eq!(again, completion);
    }

    #[test]
    fn meeting_sessions_filters_by_meeting() {
        let registry = SessionRegistry::new();
        registry
            .register(new_session("conn-1", "m-1", Role::Host))
            .expect("register");
        registry
            .register(new_session("conn-2", "m-1", Role::Participant))
            .expect("register");
        registry
            .register(new_session("conn-3", "m-2", Role::Participant))
            .expect("register");

        assert_eq!(registry.meeting_sessions("m-1").len(), 2);
        assert_eq!(registry.len(), 3);
        assert!(registry.remove("conn-3").is_some());
        assert!(!registry.contains("conn-3"));
    }
}
