//! Sync audit log and last-run status.

use chrono::Utc;
use serde_json::json;

use super::{fields, to_record, DbError, EntityKind, SyncDb, SyncLogEntry, SyncRunStatus};

/// Id of the single tracker run-status row.
pub const TRACKER_RUN_ID: &str = "tracker";

impl SyncDb {
    /// Append an audit entry. Never fails the caller; a write error is logged.
    #[allow(clippy::too_many_arguments)]
    pub fn log_sync(
        &self,
        user_key: &str,
        direction: &str,
        entity_type: &str,
        entity_id: Option<&str>,
        calendar_event_id: Option<&str>,
        status: &str,
        message: &str,
    ) {
        let entry = SyncLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_key: user_key.to_string(),
            direction: direction.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.unwrap_or_default().to_string(),
            calendar_event_id: calendar_event_id.unwrap_or_default().to_string(),
            status: status.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.insert(EntityKind::SyncLog, &entry) {
            log::warn!("Failed to write sync log entry: {}", e);
        }
    }

    pub fn list_sync_log(&self, user_key: &str) -> Result<Vec<SyncLogEntry>, DbError> {
        self.find_rows(EntityKind::SyncLog, fields([("userKey", json!(user_key))]))
    }

    pub fn get_run_status(&self) -> Result<Option<SyncRunStatus>, DbError> {
        self.find_one(EntityKind::SyncRuns, fields([("id", json!(TRACKER_RUN_ID))]))
    }

    /// Upsert the last-run row.
    pub fn save_run_status(&self, status: &SyncRunStatus) -> Result<(), DbError> {
        let mut record = to_record(status)?;
        // Absent optionals must clear the previous run's values.
        record.entry("summary").or_insert(serde_json::Value::Null);
        record.entry("error").or_insert(serde_json::Value::Null);
        if !self.patch(EntityKind::SyncRuns, &status.id, record.clone())? {
            self.store.create(EntityKind::SyncRuns, record)?;
        }
        Ok(())
    }
}
