//! Reconciliation of a full tracker fetch against the local mirror.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::client::ExternalTask;
use crate::db::{DbError, ExternalMirrorRecord, SyncDb};

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub out_of_view: usize,
}

/// Normalize an external task into its mirror row.
fn mirror_row(
    task: &ExternalTask,
    first_seen_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ExternalMirrorRecord {
    ExternalMirrorRecord {
        id: task.id.clone(),
        url: task.url.clone(),
        name: task.name.clone(),
        status: task.status.clone(),
        priority: task.priority.clone(),
        assignees: task.assignees.clone(),
        tags: task.tags.clone(),
        due_date: task.due_date(),
        start_date: task.start_date(),
        date_created: task.date_created,
        date_updated: task.date_updated,
        list_id: task.list_id.clone(),
        folder_id: task.folder_id.clone(),
        space_id: task.space_id.clone(),
        out_of_view: false,
        first_seen_at,
        last_sync_at: now,
    }
}

/// Apply a complete fetch to the mirror.
///
/// `fetched` must be the whole view, never a partial page set: every mirror
/// row not present in it is flagged out of view. Rows are overwritten in
/// place or inserted; nothing is ever deleted.
pub fn reconcile(
    db: &SyncDb,
    fetched: &[ExternalTask],
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, DbError> {
    let snapshot = db.list_mirror()?;
    let mut known: HashMap<String, DateTime<Utc>> = snapshot
        .iter()
        .map(|row| (row.id.clone(), row.first_seen_at))
        .collect();

    let mut outcome = ReconcileOutcome {
        fetched: fetched.len(),
        ..Default::default()
    };
    let mut seen: HashSet<&str> = HashSet::with_capacity(fetched.len());

    for task in fetched {
        if task.id.is_empty() {
            log::warn!("Reconcile: skipping tracker task without id ({:?})", task.name);
            continue;
        }
        if !seen.insert(task.id.as_str()) {
            log::debug!("Reconcile: task {} appeared twice in one fetch", task.id);
        }

        match known.get(&task.id) {
            Some(first_seen_at) => {
                let row = mirror_row(task, *first_seen_at, now);
                if db.replace_mirror(&row)? {
                    outcome.updated += 1;
                } else {
                    log::warn!("Reconcile: mirror row {} vanished, re-inserting", task.id);
                    db.insert_mirror(&row)?;
                    outcome.inserted += 1;
                }
            }
            None => {
                db.insert_mirror(&mirror_row(task, now, now))?;
                known.insert(task.id.clone(), now);
                outcome.inserted += 1;
            }
        }
    }

    for row in snapshot.iter().filter(|r| !seen.contains(r.id.as_str())) {
        if !row.out_of_view {
            log::info!("Reconcile: {} ({}) dropped out of view", row.id, row.name);
        }
        if db.mark_mirror_out_of_view(&row.id, now)? {
            outcome.out_of_view += 1;
        }
    }

    log::info!(
        "Reconcile: fetched={} inserted={} updated={} outOfView={}",
        outcome.fetched,
        outcome.inserted,
        outcome.updated,
        outcome.out_of_view
    );
    Ok(outcome)
}
