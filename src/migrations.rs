//! Record store schema upgrades.
//!
//! Each step is an embedded SQL file applied inside its own transaction
//! together with its `schema_version` row, so a failed step leaves the
//! database at the previous version. An existing database is copied to
//! `<db>.pre-migration.bak` before the first pending step runs.

use std::path::Path;

use rusqlite::{Connection, DatabaseName};

use crate::db::DbError;

/// `(version, sql)`, ascending.
const STEPS: &[(i32, &str)] = &[
    (1, include_str!("migrations/001_records.sql")),
    (2, include_str!("migrations/002_records_kind_index.sql")),
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

fn latest_known() -> i32 {
    STEPS.last().map_or(0, |(v, _)| *v)
}

fn applied_version(conn: &Connection) -> Result<i32, DbError> {
    conn.execute_batch(VERSION_TABLE)?;
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// A database written by a newer build must not be touched.
fn check_not_newer(applied: i32) -> Result<(), DbError> {
    let known = latest_known();
    if applied > known {
        return Err(DbError::Migration(format!(
            "database is at schema version {} but this build of routine-sync only knows up to {}; upgrade routine-sync",
            applied, known
        )));
    }
    Ok(())
}

fn snapshot(conn: &Connection) -> Result<(), DbError> {
    let Some(path) = conn.path().filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let target = format!("{}.pre-migration.bak", path);
    conn.backup(DatabaseName::Main, Path::new(&target), None)?;
    log::info!("Schema snapshot written to {}", target);
    Ok(())
}

fn apply(conn: &Connection, version: i32, sql: &str) -> Result<(), DbError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(sql)
        .map_err(|e| DbError::Migration(format!("step {} failed: {}", version, e)))?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    tx.commit()?;
    log::info!("Record store schema now at version {}", version);
    Ok(())
}

/// Bring the schema up to date. Returns how many steps ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, DbError> {
    let applied = applied_version(conn)?;
    check_not_newer(applied)?;

    let pending: Vec<_> = STEPS.iter().filter(|(v, _)| *v > applied).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if applied > 0 {
        snapshot(conn)?;
    }
    for (version, sql) in &pending {
        apply(conn, *version, sql)?;
    }
    Ok(pending.len())
}
