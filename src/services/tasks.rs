// Task lifecycle service.
// Create/update/delete with the recurrence hooks and the delete cascade.

use chrono::{NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::types::{opt_date, opt_hhmm};
use crate::db::{ChecklistItem, SyncDb, Task};
use crate::error::SyncError;
use crate::recurrence::{self, MaterializeOutcome};
use crate::types::{Priority, RecurrenceConfig, TaskStatus};

const MAX_TITLE_LEN: usize = 280;

/// Fields of a new task.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default, with = "opt_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, with = "opt_hhmm")]
    pub due_time: Option<NaiveTime>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurrence_type: Option<String>,
    #[serde(default)]
    pub recurrence_days: Option<Value>,
    #[serde(default, with = "opt_hhmm")]
    pub recurrence_time: Option<NaiveTime>,
    #[serde(default, with = "opt_date")]
    pub recurrence_start_date: Option<NaiveDate>,
    #[serde(default, with = "opt_date")]
    pub recurrence_end_date: Option<NaiveDate>,
}

/// Partial update. `clear_*` flags win over the matching value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default, with = "opt_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub clear_due_date: bool,
    #[serde(default, with = "opt_hhmm")]
    pub due_time: Option<NaiveTime>,
    #[serde(default)]
    pub clear_due_time: bool,
    pub status: Option<TaskStatus>,
    pub tags: Option<Vec<String>>,
    pub is_recurring: Option<bool>,
    pub recurrence_type: Option<String>,
    pub recurrence_days: Option<Value>,
    #[serde(default, with = "opt_hhmm")]
    pub recurrence_time: Option<NaiveTime>,
    #[serde(default)]
    pub clear_recurrence_time: bool,
    #[serde(default, with = "opt_date")]
    pub recurrence_start_date: Option<NaiveDate>,
    #[serde(default, with = "opt_date")]
    pub recurrence_end_date: Option<NaiveDate>,
    #[serde(default)]
    pub clear_recurrence_end_date: bool,
}

/// A written task plus what the recurrence hook did, if it ran.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChange {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materialized: Option<MaterializeOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub id: String,
    pub checklist_items: usize,
    pub instances: usize,
}

fn validate_title(title: &str) -> Result<String, SyncError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Invalid("title must not be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_TITLE_LEN {
        return Err(SyncError::Invalid(format!(
            "title must be at most {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(trimmed.to_string())
}

/// Run the materializer after a template changed. Failures are reported in
/// the outcome, never to the caller.
fn rematerialize(db: &SyncDb, owner: &str, horizon_days: u32) -> MaterializeOutcome {
    match recurrence::materialize_for_owner(db, owner, horizon_days) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::warn!("Recurrence materialization for {} failed: {}", owner, e);
            MaterializeOutcome {
                failed: 1,
                last_error: Some(e.to_string()),
                ..Default::default()
            }
        }
    }
}

pub fn create_task(
    db: &SyncDb,
    horizons: &RecurrenceConfig,
    owner: &str,
    draft: TaskDraft,
) -> Result<TaskChange, SyncError> {
    let title = validate_title(&draft.title)?;
    let mut task = Task::new(owner, &title);
    task.description = draft.description;
    task.priority = draft.priority.unwrap_or_default();
    task.due_date = draft.due_date;
    task.due_time = draft.due_time;
    task.status = draft.status.unwrap_or_default();
    task.tags = draft.tags;
    task.is_recurring = draft.is_recurring;
    task.recurrence_type = draft.recurrence_type.filter(|t| !t.trim().is_empty());
    task.recurrence_days = draft.recurrence_days;
    task.recurrence_time = draft.recurrence_time;
    task.recurrence_start_date = draft.recurrence_start_date;
    task.recurrence_end_date = draft.recurrence_end_date;

    db.insert_task(&task)?;
    log::debug!("Created task {} for {}", task.id, owner);

    let materialized = task
        .is_template()
        .then(|| rematerialize(db, owner, horizons.edit_horizon_days));
    Ok(TaskChange { task, materialized })
}

/// The fields whose change re-runs materialization.
type RecurrenceKey<'a> = (
    bool,
    Option<&'a str>,
    Option<&'a Value>,
    Option<NaiveTime>,
    Option<NaiveDate>,
    Option<NaiveDate>,
);

fn recurrence_key(task: &Task) -> RecurrenceKey<'_> {
    (
        task.is_recurring,
        task.recurrence_type.as_deref(),
        task.recurrence_days.as_ref(),
        task.recurrence_time,
        task.recurrence_start_date,
        task.recurrence_end_date,
    )
}

pub fn update_task(
    db: &SyncDb,
    horizons: &RecurrenceConfig,
    owner: &str,
    id: &str,
    patch: TaskPatch,
) -> Result<TaskChange, SyncError> {
    let before = db
        .get_task(owner, id)?
        .ok_or_else(|| SyncError::NotFound(format!("task {}", id)))?;
    let mut task = before.clone();

    if let Some(title) = patch.title {
        task.title = validate_title(&title)?;
    }
    if let Some(description) = patch.description {
        task.description = description;
    }
    if let Some(priority) = patch.priority {
        task.priority = priority;
    }
    if patch.clear_due_date {
        task.due_date = None;
    } else if let Some(d) = patch.due_date {
        task.due_date = Some(d);
    }
    if patch.clear_due_time {
        task.due_time = None;
    } else if let Some(t) = patch.due_time {
        task.due_time = Some(t);
    }
    if let Some(status) = patch.status {
        task.status = status;
    }
    if let Some(tags) = patch.tags {
        task.tags = tags;
    }
    if let Some(recurring) = patch.is_recurring {
        if recurring && task.is_instance() {
            return Err(SyncError::Invalid(
                "an instance of a recurring task cannot itself recur".to_string(),
            ));
        }
        task.is_recurring = recurring;
    }
    if let Some(kind) = patch.recurrence_type {
        task.recurrence_type = Some(kind).filter(|t| !t.trim().is_empty());
    }
    if let Some(days) = patch.recurrence_days {
        task.recurrence_days = Some(days);
    }
    if patch.clear_recurrence_time {
        task.recurrence_time = None;
    } else if let Some(t) = patch.recurrence_time {
        task.recurrence_time = Some(t);
    }
    if let Some(d) = patch.recurrence_start_date {
        task.recurrence_start_date = Some(d);
    }
    if patch.clear_recurrence_end_date {
        task.recurrence_end_date = None;
    } else if let Some(d) = patch.recurrence_end_date {
        task.recurrence_end_date = Some(d);
    }

    let recurrence_changed = recurrence_key(&task) != recurrence_key(&before);
    task.updated_at = Utc::now();
    if !db.save_task(&task)? {
        return Err(SyncError::NotFound(format!("task {}", id)));
    }

    let materialized = (recurrence_changed && task.is_template())
        .then(|| rematerialize(db, owner, horizons.edit_horizon_days));
    Ok(TaskChange { task, materialized })
}

/// Delete a task with its checklist and, for a template, its instances.
///
/// Dependents go first so a retry after a partial failure still finds the
/// task and finishes the job.
pub fn delete_task(db: &SyncDb, owner: &str, id: &str) -> Result<DeleteOutcome, SyncError> {
    let task = db
        .get_task(owner, id)?
        .ok_or_else(|| SyncError::NotFound(format!("task {}", id)))?;
    let mut outcome = DeleteOutcome {
        id: task.id.clone(),
        ..Default::default()
    };

    for instance in db.list_instances(owner, &task.id)? {
        if db.delete_task_row(&instance.id)? {
            outcome.instances += 1;
        }
    }
    for item in db.list_checklist(owner, &task.id)? {
        if db.delete_checklist_item(&item.id)? {
            outcome.checklist_items += 1;
        }
    }
    db.delete_task_row(&task.id)?;

    log::info!(
        "Deleted task {} ({} checklist item(s), {} instance(s))",
        task.id,
        outcome.checklist_items,
        outcome.instances
    );
    Ok(outcome)
}

pub fn add_checklist_item(
    db: &SyncDb,
    owner: &str,
    task_id: &str,
    text: &str,
) -> Result<ChecklistItem, SyncError> {
    if db.get_task(owner, task_id)?.is_none() {
        return Err(SyncError::NotFound(format!("task {}", task_id)));
    }
    let item = ChecklistItem {
        id: uuid::Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        user_key: owner.to_string(),
        text: text.to_string(),
        done: false,
        created_at: Utc::now(),
    };
    db.insert_checklist_item(&item)?;
    Ok(item)
}
