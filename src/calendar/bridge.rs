//! Task <-> calendar event bridge.
//!
//! Exported events carry a fixed marker in their description so an import
//! can tell managed events from foreign ones. The task keeps the event id in
//! `calendarEventId`; that field is only written here.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{CalendarEvent, CalendarService, EventDraft, EventTiming};
use crate::db::{fields, Record, SyncDb, Task, UserSyncSettings};
use crate::error::SyncError;
use crate::types::{CalendarWindow, SyncDirection};

/// Marks an event as owned by this engine.
pub const SYNC_MARKER: &str = "[ROUTINE_APP_SYNC]";
pub const TITLE_PREFIX: &str = "[Task] ";

// ============================================================================
// Event format
// ============================================================================

/// Event description for a task: id/priority header, body, marker.
pub fn event_description(task: &Task) -> String {
    let mut out = format!("ID: {}\nPriority: {}\n", task.id, task.priority);
    if !task.description.is_empty() {
        out.push('\n');
        out.push_str(&task.description);
    }
    out.push_str("\n\n");
    out.push_str(SYNC_MARKER);
    out
}

pub fn is_managed(event: &CalendarEvent) -> bool {
    event.description.contains(SYNC_MARKER)
}

pub fn strip_title_prefix(title: &str) -> String {
    title
        .strip_prefix(TITLE_PREFIX)
        .unwrap_or(title)
        .trim()
        .to_string()
}

/// Undo `event_description`: drop the marker and the id/priority header.
pub fn strip_managed_description(description: &str) -> String {
    let without_marker = description.replace(SYNC_MARKER, "");
    let mut lines = without_marker.lines().peekable();
    if lines.peek().is_some_and(|l| l.starts_with("ID: ")) {
        lines.next();
        if lines.peek().is_some_and(|l| l.starts_with("Priority: ")) {
            lines.next();
        }
    }
    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

/// Resolve a civil date/time in `tz`. Times inside a DST gap move forward
/// to the first valid instant.
fn local_to_utc(tz: chrono_tz::Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt.with_timezone(&Utc);
        }
        candidate += Duration::minutes(30);
    }
    naive.and_utc()
}

pub fn build_event_draft(
    task: &Task,
    settings: &UserSyncSettings,
) -> Result<EventDraft, SyncError> {
    let day = task
        .due_date
        .ok_or_else(|| SyncError::MissingDueDate(task.id.clone()))?;
    let timing = match task.due_time {
        Some(time) => {
            let start = local_to_utc(settings.tz(), day.and_time(time));
            let minutes = i64::from(settings.default_event_duration_min.max(1));
            EventTiming::Timed {
                start,
                end: start + Duration::minutes(minutes),
            }
        }
        None => EventTiming::all_day(day),
    };
    Ok(EventDraft {
        title: format!("{}{}", TITLE_PREFIX, task.title),
        description: event_description(task),
        timing,
        time_zone: settings.tz().name().to_string(),
    })
}

/// Civil due date/time of an event in the owner's zone.
fn event_due(event: &CalendarEvent, tz: chrono_tz::Tz) -> (NaiveDate, Option<NaiveTime>) {
    match &event.timing {
        EventTiming::AllDay { start, .. } => (*start, None),
        EventTiming::Timed { start, .. } => {
            let local = start.with_timezone(&tz);
            (local.date_naive(), Some(local.time()))
        }
    }
}

/// `[now - pastDays, now + futureDays]`, rejected when it leaves the
/// representable range.
pub fn window_bounds(
    window: CalendarWindow,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), SyncError> {
    let start = now.checked_sub_signed(Duration::days(i64::from(window.past_days)));
    let end = now.checked_add_signed(Duration::days(i64::from(window.future_days)));
    start.zip(end).ok_or_else(|| {
        SyncError::Invalid(format!(
            "calendar window of {} past / {} future days is out of range",
            window.past_days, window.future_days
        ))
    })
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub event_id: String,
    pub event_link: Option<String>,
    /// False when an existing event was updated in place.
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSyncResult {
    pub mode: SyncDirection,
    pub exported: usize,
    pub export_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl CalendarSyncResult {
    pub fn synced(&self) -> usize {
        self.exported
            + self
                .import
                .as_ref()
                .map(|i| i.imported + i.updated)
                .unwrap_or(0)
    }

    pub fn errors(&self) -> usize {
        self.export_errors
            + self.import.as_ref().map(|i| i.errors).unwrap_or(0)
            + usize::from(self.import_error.is_some())
    }
}

/// Partial settings update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub calendar_id: Option<String>,
    pub enable_sync: Option<bool>,
    pub default_event_duration_min: Option<u32>,
    pub timezone: Option<String>,
    pub sync_direction: Option<SyncDirection>,
    pub allow_import_all: Option<bool>,
    pub default_event_hour: Option<String>,
}

impl SettingsPatch {
    fn into_record(self) -> Record {
        let mut record = Record::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(v) = value {
                record.insert(key.to_string(), v);
            }
        };
        put("calendarId", self.calendar_id.map(Value::from));
        put("enableSync", self.enable_sync.map(Value::from));
        put(
            "defaultEventDurationMin",
            self.default_event_duration_min.map(Value::from),
        );
        put("timezone", self.timezone.map(Value::from));
        put("syncDirection", self.sync_direction.map(|d| json!(d)));
        put("allowImportAll", self.allow_import_all.map(Value::from));
        put("defaultEventHour", self.default_event_hour.map(Value::from));
        record
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Clone)]
pub struct CalendarBridge {
    db: SyncDb,
    calendar: Arc<dyn CalendarService>,
}

impl CalendarBridge {
    pub fn new(db: SyncDb, calendar: Arc<dyn CalendarService>) -> Self {
        Self { db, calendar }
    }

    /// Settings of an owner, created with defaults on first access.
    pub fn get_settings(&self, user_key: &str) -> Result<UserSyncSettings, SyncError> {
        get_or_create_settings(&self.db, user_key)
    }

    pub fn update_settings(
        &self,
        user_key: &str,
        patch: SettingsPatch,
    ) -> Result<UserSyncSettings, SyncError> {
        update_settings(&self.db, user_key, patch)
    }

    /// Create or refresh the event of one task.
    pub async fn export_task(
        &self,
        user_key: &str,
        task_id: &str,
    ) -> Result<ExportResult, SyncError> {
        let settings = self.get_settings(user_key)?;
        if !settings.enable_sync {
            return Err(SyncError::SyncDisabled);
        }
        let result = self.export_with_settings(user_key, task_id, &settings).await;
        match &result {
            Ok(export) => self.db.log_sync(
                user_key,
                "EXPORT",
                "TASK",
                Some(task_id),
                Some(&export.event_id),
                "SUCCESS",
                if export.created { "Task exported" } else { "Event updated" },
            ),
            Err(e) => self.db.log_sync(
                user_key,
                "EXPORT",
                "TASK",
                Some(task_id),
                None,
                "ERROR",
                &e.to_string(),
            ),
        }
        result
    }

    async fn export_with_settings(
        &self,
        user_key: &str,
        task_id: &str,
        settings: &UserSyncSettings,
    ) -> Result<ExportResult, SyncError> {
        let task = self
            .db
            .get_task(user_key, task_id)?
            .ok_or_else(|| SyncError::NotFound(format!("task {}", task_id)))?;
        if task.is_template() {
            return Err(SyncError::NotExportable(task.id));
        }
        let draft = build_event_draft(&task, settings)?;

        let mut created = false;
        let event = match task.calendar_event_id.as_deref() {
            Some(event_id) => {
                match self
                    .calendar
                    .update_event(&settings.calendar_id, event_id, &draft)
                    .await?
                {
                    Some(event) => event,
                    None => {
                        log::info!(
                            "Event {} of task {} is gone, creating a new one",
                            event_id,
                            task.id
                        );
                        created = true;
                        self.calendar
                            .create_event(&settings.calendar_id, &draft)
                            .await?
                    }
                }
            }
            None => {
                created = true;
                self.calendar
                    .create_event(&settings.calendar_id, &draft)
                    .await?
            }
        };

        let now = Utc::now();
        self.db.update_task_fields(
            &task.id,
            fields([
                ("calendarEventId", json!(event.id)),
                ("calendarUpdatedAt", json!(now)),
                ("updatedAt", json!(now)),
            ]),
        )?;

        Ok(ExportResult {
            event_id: event.id,
            event_link: event.html_link,
            created,
        })
    }

    pub fn unlink_task(&self, user_key: &str, task_id: &str) -> Result<Task, SyncError> {
        unlink_task(&self.db, user_key, task_id)
    }

    /// Pull events of the window into tasks.
    pub async fn import_events(
        &self,
        user_key: &str,
        window: CalendarWindow,
        now: DateTime<Utc>,
    ) -> Result<ImportResult, SyncError> {
        let settings = self.get_settings(user_key)?;
        if !settings.enable_sync {
            return Err(SyncError::SyncDisabled);
        }
        self.import_with_settings(user_key, &settings, window, now)
            .await
            .inspect_err(|e| {
                self.db
                    .log_sync(user_key, "IMPORT", "", None, None, "ERROR", &e.to_string())
            })
    }

    async fn import_with_settings(
        &self,
        user_key: &str,
        settings: &UserSyncSettings,
        window: CalendarWindow,
        now: DateTime<Utc>,
    ) -> Result<ImportResult, SyncError> {
        let (start, end) = window_bounds(window, now)?;
        let events = self
            .calendar
            .list_events(&settings.calendar_id, start, end)
            .await?;

        let mut result = ImportResult {
            total: events.len(),
            ..Default::default()
        };
        let tz = settings.tz();

        for event in &events {
            if !is_managed(event) && !settings.allow_import_all {
                result.skipped += 1;
                continue;
            }
            match self.import_one(user_key, event, tz, now) {
                Ok(ImportAction::Created(task_id)) => {
                    result.imported += 1;
                    self.db.log_sync(
                        user_key,
                        "IMPORT",
                        "TASK",
                        Some(&task_id),
                        Some(&event.id),
                        "SUCCESS",
                        "Task created from event",
                    );
                }
                Ok(ImportAction::Updated(task_id)) => {
                    result.updated += 1;
                    self.db.log_sync(
                        user_key,
                        "IMPORT",
                        "TASK",
                        Some(&task_id),
                        Some(&event.id),
                        "SUCCESS",
                        "Task updated from event",
                    );
                }
                Err(e) => {
                    log::warn!("Import of event {} for {} failed: {}", event.id, user_key, e);
                    result.errors += 1;
                    self.db.log_sync(
                        user_key,
                        "IMPORT",
                        "EVENT",
                        None,
                        Some(&event.id),
                        "ERROR",
                        &e.to_string(),
                    );
                }
            }
        }

        log::info!(
            "Calendar import for {}: imported={} updated={} skipped={} errors={} total={}",
            user_key,
            result.imported,
            result.updated,
            result.skipped,
            result.errors,
            result.total
        );
        Ok(result)
    }

    fn import_one(
        &self,
        user_key: &str,
        event: &CalendarEvent,
        tz: chrono_tz::Tz,
        now: DateTime<Utc>,
    ) -> Result<ImportAction, SyncError> {
        let title = strip_title_prefix(&event.title);
        let description = strip_managed_description(&event.description);
        let (due_date, due_time) = event_due(event, tz);

        let existing = self.db.find_tasks_by_event(user_key, &event.id)?;
        if let Some(task) = existing.into_iter().next() {
            // Only the fields the event owns; status, priority and tags stay local.
            self.db.update_task_fields(
                &task.id,
                fields([
                    ("title", json!(title)),
                    ("description", json!(description)),
                    ("dueDate", json!(due_date.format("%Y-%m-%d").to_string())),
                    (
                        "dueTime",
                        json!(due_time.map(|t| t.format("%H:%M").to_string())),
                    ),
                    ("calendarUpdatedAt", json!(now)),
                    ("updatedAt", json!(now)),
                ]),
            )?;
            return Ok(ImportAction::Updated(task.id));
        }

        let mut task = Task::new(user_key, &title);
        task.description = description;
        task.due_date = Some(due_date);
        task.due_time = due_time;
        task.calendar_event_id = Some(event.id.clone());
        task.calendar_updated_at = Some(now);
        task.created_at = now;
        task.updated_at = now;
        self.db.insert_task(&task)?;
        Ok(ImportAction::Created(task.id))
    }

    /// Export then import, per `mode` (the owner's direction when absent).
    pub async fn sync_calendar(
        &self,
        user_key: &str,
        mode: Option<SyncDirection>,
        window: CalendarWindow,
        now: DateTime<Utc>,
    ) -> Result<CalendarSyncResult, SyncError> {
        let settings = self.get_settings(user_key)?;
        if !settings.enable_sync {
            return Err(SyncError::SyncDisabled);
        }
        let mode = mode.unwrap_or(settings.sync_direction);
        let mut result = CalendarSyncResult {
            mode,
            ..Default::default()
        };

        if mode.exports() {
            let candidates: Vec<Task> = self
                .db
                .list_tasks(user_key)?
                .into_iter()
                .filter(|t| {
                    t.due_date.is_some()
                        && !t.is_template()
                        && (t.calendar_event_id.is_some() || !t.status.is_completed())
                })
                .collect();
            for task in candidates {
                match self.export_task(user_key, &task.id).await {
                    Ok(_) => result.exported += 1,
                    Err(e) => {
                        log::warn!("Export of task {} failed: {}", task.id, e);
                        result.export_errors += 1;
                    }
                }
            }
        }

        if mode.imports() {
            match self.import_events(user_key, window, now).await {
                Ok(import) => result.import = Some(import),
                Err(e) => {
                    log::warn!("Calendar import for {} failed: {}", user_key, e);
                    result.import_error = Some(e.to_string());
                }
            }
        }

        self.db.update_settings(
            user_key,
            fields([("lastSyncAt", json!(now)), ("updatedAt", json!(now))]),
        )?;
        result.last_sync_at = Some(now);
        Ok(result)
    }
}

enum ImportAction {
    Created(String),
    Updated(String),
}

/// Forget the event link of a task. The event itself is left alone, so no
/// calendar access is needed.
pub fn unlink_task(db: &SyncDb, user_key: &str, task_id: &str) -> Result<Task, SyncError> {
    let mut task = db
        .get_task(user_key, task_id)?
        .ok_or_else(|| SyncError::NotFound(format!("task {}", task_id)))?;
    let previous = task.calendar_event_id.take();
    if previous.is_some() || task.calendar_updated_at.is_some() {
        task.calendar_updated_at = None;
        task.updated_at = Utc::now();
        db.update_task_fields(
            &task.id,
            fields([
                ("calendarEventId", Value::Null),
                ("calendarUpdatedAt", Value::Null),
                ("updatedAt", json!(task.updated_at)),
            ]),
        )?;
    }
    db.log_sync(
        user_key,
        "UNLINK",
        "TASK",
        Some(task_id),
        previous.as_deref(),
        "SUCCESS",
        "Task unlinked",
    );
    Ok(task)
}

/// Settings of an owner, created with defaults on first access.
pub fn get_or_create_settings(db: &SyncDb, user_key: &str) -> Result<UserSyncSettings, SyncError> {
    if let Some(settings) = db.get_settings(user_key)? {
        return Ok(settings);
    }
    let settings = UserSyncSettings::defaults_for(user_key);
    db.insert_settings(&settings)?;
    log::info!("Created default calendar settings for {}", user_key);
    Ok(settings)
}

/// Apply a partial update; creates the row with defaults first if absent.
pub fn update_settings(
    db: &SyncDb,
    user_key: &str,
    patch: SettingsPatch,
) -> Result<UserSyncSettings, SyncError> {
    get_or_create_settings(db, user_key)?;
    let mut record = patch.into_record();
    record.insert("updatedAt".to_string(), json!(Utc::now()));
    db.update_settings(user_key, record)?;
    db.get_settings(user_key)?
        .ok_or_else(|| SyncError::NotFound(format!("settings of {}", user_key)))
}
