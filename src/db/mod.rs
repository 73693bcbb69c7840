//! Typed access to the record store.
//!
//! `SyncDb` wraps any `RecordStore` and converts between JSON records and the
//! row types in `types.rs`. The store has no indexes or transactions, so every
//! lookup here is an exact-match `find` followed by client-side filtering.
//! Rows that fail to decode are skipped with a warning rather than failing
//! the whole listing.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub mod mirror;
pub mod settings;
pub mod store;
pub mod sync_log;
pub mod tasks;
pub mod types;

pub use store::{Record, RecordStore, SqliteRecordStore};
pub use types::*;

#[derive(Clone)]
pub struct SyncDb {
    store: Arc<dyn RecordStore>,
}

impl SyncDb {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Borrow the underlying store for ad-hoc access.
    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    fn insert<T: Serialize>(&self, kind: EntityKind, row: &T) -> Result<(), DbError> {
        self.store.create(kind, to_record(row)?)?;
        Ok(())
    }

    fn find_rows<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        filter: Record,
    ) -> Result<Vec<T>, DbError> {
        let records = self.store.find(kind, &filter)?;
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            match from_record::<T>(record) {
                Ok(row) => rows.push(row),
                Err(e) => log::warn!("Skipping undecodable {} row {}: {}", kind.as_str(), id, e),
            }
        }
        Ok(rows)
    }

    fn find_one<T: DeserializeOwned>(
        &self,
        kind: EntityKind,
        filter: Record,
    ) -> Result<Option<T>, DbError> {
        match self.store.find(kind, &filter)?.into_iter().next() {
            Some(record) => Ok(Some(from_record(record)?)),
            None => Ok(None),
        }
    }

    fn patch(&self, kind: EntityKind, id: &str, fields: Record) -> Result<bool, DbError> {
        self.store.update(kind, id, fields)
    }
}

/// Serialize a row into a record.
pub fn to_record<T: Serialize>(row: &T) -> Result<Record, DbError> {
    match serde_json::to_value(row)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::NotAnObject(other.to_string())),
    }
}

/// Deserialize a row from a record.
pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T, DbError> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Build a filter (or partial update) from `(field, value)` pairs.
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Record {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

// =============================================================================
// Shared test utilities
// =============================================================================
