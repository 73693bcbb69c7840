//! Tracker mirror rows.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{fields, to_record, DbError, EntityKind, ExternalMirrorRecord, Record, SyncDb};

impl SyncDb {
    /// The full mirror snapshot, in first-seen order.
    pub fn list_mirror(&self) -> Result<Vec<ExternalMirrorRecord>, DbError> {
        self.find_rows(EntityKind::TrackerMirror, Record::new())
    }

    pub fn insert_mirror(&self, row: &ExternalMirrorRecord) -> Result<(), DbError> {
        self.insert(EntityKind::TrackerMirror, row)
    }

    /// Overwrite every field of an existing mirror row.
    pub fn replace_mirror(&self, row: &ExternalMirrorRecord) -> Result<bool, DbError> {
        self.patch(EntityKind::TrackerMirror, &row.id, to_record(row)?)
    }

    /// Flag a row as no longer present in the external view.
    pub fn mark_mirror_out_of_view(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        self.patch(
            EntityKind::TrackerMirror,
            id,
            fields([("outOfView", json!(true)), ("lastSyncAt", json!(at))]),
        )
    }
}
