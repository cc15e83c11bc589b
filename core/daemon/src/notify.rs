//! Outbound "activity completed" notifications.
//!
//! Delivery is fire-and-forget from the reconciler's point of view: a failed
//! notification is logged and never rolls back the durable record.

use meetlog_protocol::Role;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::Db;
use crate::error::NotifyError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCompleted {
    pub record_id: i64,
    pub user_id: String,
    pub meeting_id: String,
    pub final_display_name: String,
    pub duration_minutes: i64,
    pub role: Role,
    pub completed_at: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &ActivityCompleted) -> Result<(), NotifyError>;
}

/// Per-user outbox table drained by the push layer via `get_notifications`.
pub struct OutboxNotifier {
    db: Arc<Db>,
}

impl OutboxNotifier {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, event: &ActivityCompleted) -> Result<(), NotifyError> {
        if event.user_id.trim().is_empty() {
            return Err(NotifyError::Rejected("notification has no recipient".to_string()));
        }
        let payload = serde_json::to_string(event)?;
        self.db
            .enqueue_notification(&event.user_id, event.record_id, &payload)?;
        tracing::debug!(
            user_id = %event.user_id,
            record_id = event.record_id,
            "Activity notification queued"
        );
        Ok(())
    }
}
