//! Keyed record store.
//!
//! Records are JSON objects grouped by `EntityKind` and keyed by their `id`
//! field. The store offers exact-match filtering only: no compound queries,
//! no transactions across calls, no secondary indexes. Callers scan and
//! filter client-side when they need more.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection};
use serde_json::Value;

use super::types::{DbError, EntityKind};

/// One stored record.
pub type Record = serde_json::Map<String, Value>;

/// Storage collaborator consumed by the sync engine.
pub trait RecordStore: Send + Sync {
    /// Insert a new record. The record must carry a string `id`.
    fn create(&self, kind: EntityKind, record: Record) -> Result<Record, DbError>;

    /// All records of `kind` whose fields equal every entry of `filter`,
    /// in insertion order. An empty filter returns every record.
    fn find(&self, kind: EntityKind, filter: &Record) -> Result<Vec<Record>, DbError>;

    /// Merge `fields` into the record with this id. Returns false if absent.
    fn update(&self, kind: EntityKind, id: &str, fields: Record) -> Result<bool, DbError>;

    /// Remove the record with this id. Returns false if absent.
    fn delete(&self, kind: EntityKind, id: &str) -> Result<bool, DbError>;
}

/// SQLite-backed record store. One table, JSON bodies, filters evaluated
/// with `json_extract`.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the store at `~/.routine-sync/routine.db`.
    pub fn open() -> Result<Self, DbError> {
        Self::open_at(Self::default_path()?)
    }

    /// Open a store at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn)?;

        log::debug!("Record store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolve the default database path.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".routine-sync").join("routine.db"))
    }

    /// Open the store at `path` when given, else at the default location.
    pub fn open_configured(path: Option<&Path>) -> Result<Self, DbError> {
        match path {
            Some(p) => Self::open_at(p.to_path_buf()),
            None => Self::open(),
        }
    }

    fn read_body(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<Record>, DbError> {
        let mut stmt = conn.prepare("SELECT body FROM records WHERE kind = ?1 AND id = ?2")?;
        let mut rows = stmt.query(params![kind.as_str(), id])?;
        match rows.next()? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(parse_body(&body)?))
            }
            None => Ok(None),
        }
    }
}

fn parse_body(body: &str) -> Result<Record, DbError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::NotAnObject(other.to_string())),
    }
}

/// Field names become JSON paths; anything outside `[A-Za-z0-9_]` is rejected
/// so a filter can never address a nested or quoted path.
fn json_path(field: &str) -> Option<String> {
    if !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(format!("$.{}", field))
    } else {
        None
    }
}

/// Map a JSON value to what `json_extract` yields for it.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

impl RecordStore for SqliteRecordStore {
    fn create(&self, kind: EntityKind, record: Record) -> Result<Record, DbError> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or(DbError::MissingId)?
            .to_string();
        let body = serde_json::to_string(&record)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (kind, id, body) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), id, body],
        )?;
        Ok(record)
    }

    fn find(&self, kind: EntityKind, filter: &Record) -> Result<Vec<Record>, DbError> {
        let mut sql = String::from("SELECT body FROM records WHERE kind = ?1");
        let mut bind: Vec<SqlValue> = vec![SqlValue::Text(kind.as_str().to_string())];

        for (field, value) in filter {
            let Some(path) = json_path(field) else {
                log::warn!("Ignoring unsupported filter field '{}'", field);
                return Ok(Vec::new());
            };
            bind.push(SqlValue::Text(path));
            let path_idx = bind.len();
            if value.is_null() {
                sql.push_str(&format!(" AND json_extract(body, ?{}) IS NULL", path_idx));
            } else {
                bind.push(to_sql_value(value));
                sql.push_str(&format!(
                    " AND json_extract(body, ?{}) = ?{}",
                    path_idx,
                    bind.len()
                ));
            }
        }
        sql.push_str(" ORDER BY seq");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let bodies = stmt.query_map(rusqlite::params_from_iter(bind.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for body in bodies {
            records.push(parse_body(&body?)?);
        }
        Ok(records)
    }

    fn update(&self, kind: EntityKind, id: &str, fields: Record) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let Some(mut current) = Self::read_body(&conn, kind, id)? else {
            return Ok(false);
        };
        for (key, value) in fields {
            if key == "id" {
                continue;
            }
            current.insert(key, value);
        }
        let body = serde_json::to_string(&current)?;
        let changed = conn.execute(
            "UPDATE records SET body = ?1, updated_at = datetime('now')
             WHERE kind = ?2 AND id = ?3",
            params![body, kind.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM records WHERE kind = ?1 AND id = ?2",
            params![kind.as_str(), id],
        )?;
        Ok(changed > 0)
    }
}
