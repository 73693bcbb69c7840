//! Shared type definitions for the database layer.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Priority, SyncDirection, SyncSummary, TaskStatus, RunStage};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Record is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("Record has no id field")]
    MissingId,
}

/// Entity kinds held by the record store. Each maps to one logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Users,
    Tasks,
    TaskChecklist,
    Settings,
    SyncLog,
    TrackerMirror,
    SyncRuns,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Users => "USERS",
            EntityKind::Tasks => "TASKS",
            EntityKind::TaskChecklist => "TASK_CHECKLIST",
            EntityKind::Settings => "SETTINGS",
            EntityKind::SyncLog => "SYNC_LOG",
            EntityKind::TrackerMirror => "TRACKER_MIRROR",
            EntityKind::SyncRuns => "SYNC_RUNS",
        }
    }
}

// ---------------------------------------------------------------------------
// Lenient civil date/time encoding
// ---------------------------------------------------------------------------

/// Stored dates are `YYYY-MM-DD`; blank strings read back as `None`.
pub(crate) mod opt_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&d.format("%Y-%m-%d").to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => {
                let date_part = s.get(..10).unwrap_or(s);
                NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
        }
    }
}

/// Stored times are `HH:MM`; `HH:MM:SS` is accepted on read.
pub(crate) mod opt_hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&t.format("%H:%M").to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Optional strings where a blank value means "absent".
pub(crate) mod opt_blank {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.filter(|s| !s.trim().is_empty()))
    }
}

fn lenient_priority<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Priority, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.map(|p| Priority::parse(&p)).unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A row from `TASKS`.
///
/// A task is a template (`is_recurring`, no `template_task_id`), an instance
/// (`template_task_id` set) or a plain task (neither).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub user_key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Priority,
    #[serde(default, with = "opt_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, with = "opt_hhmm")]
    pub due_time: Option<NaiveTime>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Back-reference owned by the calendar bridge.
    #[serde(default, deserialize_with = "opt_blank::deserialize")]
    pub calendar_event_id: Option<String>,
    #[serde(default)]
    pub calendar_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default, deserialize_with = "opt_blank::deserialize")]
    pub recurrence_type: Option<String>,
    /// Raw weekday set as stored (array of ISO weekdays, or a JSON string of one).
    #[serde(default)]
    pub recurrence_days: Option<serde_json::Value>,
    #[serde(default, with = "opt_hhmm")]
    pub recurrence_time: Option<NaiveTime>,
    #[serde(default, with = "opt_date")]
    pub recurrence_start_date: Option<NaiveDate>,
    #[serde(default, with = "opt_date")]
    pub recurrence_end_date: Option<NaiveDate>,
    /// Back-reference owned by the recurrence materializer.
    #[serde(default, deserialize_with = "opt_blank::deserialize")]
    pub template_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A blank plain task with fresh id and timestamps.
    pub fn new(user_key: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_key: user_key.to_string(),
            title: title.to_string(),
            description: String::new(),
            priority: Priority::Normal,
            due_date: None,
            due_time: None,
            status: TaskStatus::Open,
            tags: Vec::new(),
            calendar_event_id: None,
            calendar_updated_at: None,
            is_recurring: false,
            recurrence_type: None,
            recurrence_days: None,
            recurrence_time: None,
            recurrence_start_date: None,
            recurrence_end_date: None,
            template_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_template(&self) -> bool {
        self.is_recurring && self.template_task_id.is_none()
    }

    pub fn is_instance(&self) -> bool {
        self.template_task_id.is_some()
    }
}

/// A row from `TASK_CHECKLIST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub task_id: String,
    pub user_key: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

/// A row from `USERS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Same as `user_key`; the store keys every record by `id`.
    pub id: String,
    pub user_key: String,
    #[serde(default)]
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Per-owner calendar sync configuration, a row from `SETTINGS` keyed by user key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncSettings {
    pub id: String,
    pub user_key: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    #[serde(default)]
    pub enable_sync: bool,
    #[serde(default = "default_event_duration")]
    pub default_event_duration_min: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_direction: SyncDirection,
    #[serde(default)]
    pub allow_import_all: bool,
    #[serde(default = "default_event_hour")]
    pub default_event_hour: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

fn default_event_duration() -> u32 {
    60
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_event_hour() -> String {
    "09:00".to_string()
}

impl UserSyncSettings {
    pub fn defaults_for(user_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: user_key.to_string(),
            user_key: user_key.to_string(),
            calendar_id: default_calendar_id(),
            enable_sync: false,
            default_event_duration_min: default_event_duration(),
            timezone: default_timezone(),
            last_sync_at: None,
            sync_direction: SyncDirection::Both,
            allow_import_all: false,
            default_event_hour: default_event_hour(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The owner's timezone, falling back to UTC for unknown names.
    pub fn tz(&self) -> chrono_tz::Tz {
        match self.timezone.parse::<chrono_tz::Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                log::warn!(
                    "Unknown timezone '{}' for {}, using UTC",
                    self.timezone,
                    self.user_key
                );
                chrono_tz::UTC
            }
        }
    }
}

/// One assignee as seen on the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorAssignee {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// A row from `TRACKER_MIRROR`: last-known state of one external task.
///
/// Owned exclusively by reconciliation. Never deleted; a task that drops out
/// of the fetched view is flagged `out_of_view`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMirrorRecord {
    /// External task id.
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub assignees: Vec<MirrorAssignee>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "opt_date")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, with = "opt_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub list_id: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub out_of_view: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_sync_at: DateTime<Utc>,
}

/// A row from `SYNC_LOG`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: String,
    pub user_key: String,
    pub direction: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub calendar_event_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Last-run metadata for the tracker sync, a single row in `SYNC_RUNS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunStatus {
    pub id: String,
    pub last_run_at: DateTime<Utc>,
    pub success: bool,
    pub stage: RunStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}
