//! Projection of mirror rows into internal tasks.
//!
//! An internal task of tracker origin is linked to its mirror row by a tag
//! embedded in its description. `encode_link_tag` / `decode_link_tag` are
//! the only places that know the format.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use super::TrackerConfig;
use crate::db::{DbError, ExternalMirrorRecord, SyncDb, Task};
use crate::types::{Priority, TaskStatus};

fn link_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[tracker:([^\]\s]+)\]").expect("link tag regex"))
}

pub fn encode_link_tag(external_id: &str) -> String {
    format!("[tracker:{}]", external_id)
}

/// The external id a description links to, if any.
pub fn decode_link_tag(description: &str) -> Option<String> {
    link_tag_re()
        .captures(description)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Substring heuristic over free-form tracker statuses.
pub fn internal_status(external: &str) -> TaskStatus {
    let s = external.to_lowercase();
    if s.contains("complete") || s.contains("closed") {
        TaskStatus::Done
    } else if s.contains("progress") {
        TaskStatus::Doing
    } else {
        TaskStatus::Open
    }
}

/// Exact match on the tracker's priority vocabulary.
pub fn internal_priority(external: Option<&str>) -> Priority {
    match external.map(|p| p.trim().to_lowercase()).as_deref() {
        Some("urgent") => Priority::Urgent,
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Normal,
    }
}

/// Owner key for a mirror row: assignee email, then the username map, then
/// the fallback queue.
///
/// Two usernames mapped to the same email collapse onto one owner; that is
/// not detected here.
pub fn resolve_owner(row: &ExternalMirrorRecord, config: &TrackerConfig) -> String {
    if let Some(email) = row.assignees.iter().find_map(|a| a.email.as_deref()) {
        return email.to_lowercase();
    }
    let mapped = row.assignees.iter().find_map(|a| {
        a.username
            .as_deref()
            .and_then(|u| config.username_emails.get(u))
    });
    match mapped {
        Some(email) => email.to_lowercase(),
        None => config.fallback_owner.clone(),
    }
}

fn project_description(row: &ExternalMirrorRecord) -> String {
    if row.url.is_empty() {
        encode_link_tag(&row.id)
    } else {
        format!("{}\n\n{}", row.url, encode_link_tag(&row.id))
    }
}

/// Counters from one projection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Out-of-view rows, and rows outside the requested owner scope.
    pub skipped: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProjectionOutcome {
    pub fn synced(&self) -> usize {
        self.created + self.updated
    }
}

/// Index existing tasks by the external id their description links to.
/// With several tasks on one id, the earliest created wins.
fn linked_tasks(db: &SyncDb) -> Result<HashMap<String, Task>, DbError> {
    let mut linked: HashMap<String, Task> = HashMap::new();
    for task in db.list_all_tasks()? {
        let Some(external_id) = decode_link_tag(&task.description) else {
            continue;
        };
        match linked.get(&external_id) {
            Some(existing) => log::warn!(
                "Projection: tasks {} and {} both link to {}, keeping {}",
                existing.id,
                task.id,
                external_id,
                existing.id
            ),
            None => {
                linked.insert(external_id, task);
            }
        }
    }
    Ok(linked)
}

/// Create or refresh one internal task per in-view mirror row.
///
/// With `scope`, only rows resolving to that owner (or already linked to a
/// task of that owner) are projected.
pub fn project_into_internal_tasks(
    db: &SyncDb,
    config: &TrackerConfig,
    scope: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ProjectionOutcome, DbError> {
    let rows = db.list_mirror()?;
    let mut linked = linked_tasks(db)?;
    let mut outcome = ProjectionOutcome::default();

    for row in &rows {
        if row.out_of_view {
            log::debug!("Projection: skipping out-of-view row {}", row.id);
            outcome.skipped += 1;
            continue;
        }

        let owner = resolve_owner(row, config);
        let existing = linked.remove(&row.id);
        if let Some(scope) = scope {
            let in_scope = owner == scope
                || existing.as_ref().is_some_and(|t| t.user_key == scope);
            if !in_scope {
                if let Some(task) = existing {
                    linked.insert(row.id.clone(), task);
                }
                outcome.skipped += 1;
                continue;
            }
        }

        let result = match existing {
            Some(task) => refresh_task(db, config, row, task, &owner, now).map(|changed| {
                if changed {
                    outcome.updated += 1;
                } else {
                    outcome.unchanged += 1;
                }
            }),
            None => create_task(db, row, &owner, now).map(|_| outcome.created += 1),
        };

        if let Err(e) = result {
            log::warn!("Projection: failed on tracker task {}: {}", row.id, e);
            outcome.errors += 1;
            outcome.last_error = Some(format!("{}: {}", row.id, e));
        }
    }

    log::info!(
        "Projection: created={} updated={} unchanged={} skipped={} errors={}",
        outcome.created,
        outcome.updated,
        outcome.unchanged,
        outcome.skipped,
        outcome.errors
    );
    Ok(outcome)
}

fn create_task(
    db: &SyncDb,
    row: &ExternalMirrorRecord,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    db.ensure_user(owner)?;
    let mut task = Task::new(owner, &row.name);
    task.description = project_description(row);
    task.priority = internal_priority(row.priority.as_deref());
    task.status = internal_status(&row.status);
    task.due_date = row.due_date;
    task.tags = row.tags.clone();
    task.created_at = now;
    task.updated_at = now;
    db.insert_task(&task)?;
    log::debug!("Projection: created task {} for {} ({})", task.id, row.id, owner);
    Ok(())
}

/// Overwrite the tracker-owned fields. Returns whether anything changed.
fn refresh_task(
    db: &SyncDb,
    config: &TrackerConfig,
    row: &ExternalMirrorRecord,
    mut task: Task,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let before = task.clone();

    task.title = row.name.clone();
    task.description = project_description(row);
    task.priority = internal_priority(row.priority.as_deref());
    task.due_date = row.due_date;
    task.status = internal_status(&row.status);
    // A human may have claimed the task; only move it off the queue.
    if task.user_key == config.fallback_owner && owner != config.fallback_owner {
        db.ensure_user(owner)?;
        task.user_key = owner.to_string();
    }

    if task == before {
        return Ok(false);
    }
    task.updated_at = now;
    db.save_task(&task)?;
    Ok(true)
}
