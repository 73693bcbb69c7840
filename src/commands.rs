//! Public operation surface.
//!
//! Every operation returns an `ApiResponse` envelope; errors never escape as
//! panics or raw `Err` values. Owners are identified by their user key.

use std::time::Instant;

use chrono::Utc;

use crate::calendar::bridge::{
    self, CalendarSyncResult, ExportResult, ImportResult, SettingsPatch,
};
use crate::db::{ChecklistItem, SyncLogEntry, SyncRunStatus, Task, UserSyncSettings};
use crate::error::{ApiResponse, SyncError};
use crate::orchestrator::{self, MirrorPage, MirrorQuery};
use crate::services::session::{self, SessionInfo};
use crate::services::tasks::{self, DeleteOutcome, TaskChange, TaskDraft, TaskPatch};
use crate::state::AppState;
use crate::types::{CalendarWindow, SyncDirection, SyncSummary};

// =============================================================================
// Session and tasks
// =============================================================================

pub fn start_session(state: &AppState, owner: &str) -> ApiResponse<SessionInfo> {
    let started = Instant::now();
    let horizons = state.config().recurrence;
    let result = session::start_session(&state.db, &horizons, owner);
    ApiResponse::from_result("startSession", started, result)
}

pub fn list_tasks(state: &AppState, owner: &str) -> ApiResponse<Vec<Task>> {
    let started = Instant::now();
    let result = state.db.list_tasks(owner).map_err(SyncError::from);
    ApiResponse::from_result("listTasks", started, result)
}

pub fn create_task(state: &AppState, owner: &str, draft: TaskDraft) -> ApiResponse<TaskChange> {
    let started = Instant::now();
    let horizons = state.config().recurrence;
    let result = tasks::create_task(&state.db, &horizons, owner, draft);
    ApiResponse::from_result("createTask", started, result)
}

pub fn update_task(
    state: &AppState,
    owner: &str,
    id: &str,
    patch: TaskPatch,
) -> ApiResponse<TaskChange> {
    let started = Instant::now();
    let horizons = state.config().recurrence;
    let result = tasks::update_task(&state.db, &horizons, owner, id, patch);
    ApiResponse::from_result("updateTask", started, result)
}

pub fn delete_task(state: &AppState, owner: &str, id: &str) -> ApiResponse<DeleteOutcome> {
    let started = Instant::now();
    let result = tasks::delete_task(&state.db, owner, id);
    ApiResponse::from_result("deleteTask", started, result)
}

pub fn add_checklist_item(
    state: &AppState,
    owner: &str,
    task_id: &str,
    text: &str,
) -> ApiResponse<ChecklistItem> {
    let started = Instant::now();
    let result = tasks::add_checklist_item(&state.db, owner, task_id, text);
    ApiResponse::from_result("addChecklistItem", started, result)
}

// =============================================================================
// Calendar
// =============================================================================

pub fn get_calendar_settings(state: &AppState, owner: &str) -> ApiResponse<UserSyncSettings> {
    let started = Instant::now();
    let result = bridge::get_or_create_settings(&state.db, owner);
    ApiResponse::from_result("getCalendarSettings", started, result)
}

pub fn update_calendar_settings(
    state: &AppState,
    owner: &str,
    patch: SettingsPatch,
) -> ApiResponse<UserSyncSettings> {
    let started = Instant::now();
    let result = bridge::update_settings(&state.db, owner, patch);
    ApiResponse::from_result("updateCalendarSettings", started, result)
}

pub async fn export_task(state: &AppState, owner: &str, task_id: &str) -> ApiResponse<ExportResult> {
    let started = Instant::now();
    let result = match state.bridge() {
        Ok(bridge) => bridge.export_task(owner, task_id).await,
        Err(e) => Err(e),
    };
    ApiResponse::from_result("exportTask", started, result)
}

pub fn unlink_task(state: &AppState, owner: &str, task_id: &str) -> ApiResponse<Task> {
    let started = Instant::now();
    let result = bridge::unlink_task(&state.db, owner, task_id);
    ApiResponse::from_result("unlinkTask", started, result)
}

/// Import events of `window`, the configured window when absent.
pub async fn import_calendar_events(
    state: &AppState,
    owner: &str,
    window: Option<CalendarWindow>,
) -> ApiResponse<ImportResult> {
    let started = Instant::now();
    let window = window.unwrap_or_else(|| state.config().calendar.window());
    let result = match state.bridge() {
        Ok(bridge) => bridge.import_events(owner, window, Utc::now()).await,
        Err(e) => Err(e),
    };
    ApiResponse::from_result("importCalendarEvents", started, result)
}

/// Export and/or import per `mode`, the owner's direction when absent.
pub async fn sync_calendar(
    state: &AppState,
    owner: &str,
    mode: Option<SyncDirection>,
    window: Option<CalendarWindow>,
) -> ApiResponse<CalendarSyncResult> {
    let started = Instant::now();
    let window = window.unwrap_or_else(|| state.config().calendar.window());
    let result = match state.bridge() {
        Ok(bridge) => bridge.sync_calendar(owner, mode, window, Utc::now()).await,
        Err(e) => Err(e),
    };
    ApiResponse::from_result("syncCalendar", started, result)
}

pub fn list_sync_log(state: &AppState, owner: &str) -> ApiResponse<Vec<SyncLogEntry>> {
    let started = Instant::now();
    let result = state.db.list_sync_log(owner).map_err(SyncError::from);
    ApiResponse::from_result("listSyncLog", started, result)
}

// =============================================================================
// Tracker sync
// =============================================================================

/// Run a full sync now and return its counters.
pub async fn trigger_sync(state: &AppState) -> ApiResponse<SyncSummary> {
    let started = Instant::now();
    let result = orchestrator::run_sync(state).await;
    ApiResponse::from_result("triggerSync", started, result)
}

/// Ask the background poller to run as soon as possible.
pub fn request_sync(state: &AppState) -> ApiResponse<()> {
    let started = Instant::now();
    state.sync_wake.notify_one();
    ApiResponse::from_result("requestSync", started, Ok(()))
}

pub fn get_sync_status(state: &AppState) -> ApiResponse<Option<SyncRunStatus>> {
    let started = Instant::now();
    let result = orchestrator::get_sync_status(&state.db);
    ApiResponse::from_result("getSyncStatus", started, result)
}

pub fn list_mirrored_tasks(state: &AppState, params: &MirrorQuery) -> ApiResponse<MirrorPage> {
    let started = Instant::now();
    let tracker = state.config().tracker;
    let result = orchestrator::list_mirrored_tasks(&state.db, &tracker, params);
    ApiResponse::from_result("listMirroredTasks", started, result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::calendar::fake::FakeCalendar;
    use crate::db::test_utils::test_db;
    use crate::state::RunContext;
    use crate::types::Config;
    use chrono::NaiveDate;

    fn state(with_calendar: bool) -> AppState {
        let calendar: Option<Arc<dyn crate::calendar::CalendarService>> = if with_calendar {
            Some(Arc::new(FakeCalendar::new()))
        } else {
            None
        };
        AppState::with_parts(test_db(), Config::default(), RunContext::default(), calendar)
    }

    #[test]
    fn test_task_lifecycle_through_envelopes() {
        let state = state(false);
        let session = start_session(&state, "a@x.com");
        assert!(session.ok);
        assert!(session.data.unwrap().created_user);

        let created = create_task(
            &state,
            "a@x.com",
            TaskDraft {
                title: "Call bank".to_string(),
                ..Default::default()
            },
        );
        assert!(created.ok);
        let id = created.data.unwrap().task.id;

        let item = add_checklist_item(&state, "a@x.com", &id, "Find account number");
        assert!(item.ok);

        let deleted = delete_task(&state, "a@x.com", &id);
        assert_eq!(deleted.data.unwrap().checklist_items, 1);
        assert!(list_tasks(&state, "a@x.com").data.unwrap().is_empty());

        let again = delete_task(&state, "a@x.com", &id);
        assert!(!again.ok);
        assert_eq!(again.meta.fn_name, "deleteTask");
        assert!(again.error.unwrap().starts_with("Not found"));
    }

    #[tokio::test]
    async fn test_export_without_calendar_credential_is_an_error_envelope() {
        let state = state(false);
        let response = export_task(&state, "a@x.com", "t1").await;
        assert!(!response.ok);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["errorInfo"]["kind"], "fatal");
    }

    #[tokio::test]
    async fn test_export_then_sync_calendar() {
        let state = state(true);
        let settings = update_calendar_settings(
            &state,
            "a@x.com",
            SettingsPatch {
                enable_sync: Some(true),
                ..Default::default()
            },
        );
        assert!(settings.data.unwrap().enable_sync);

        let created = create_task(
            &state,
            "a@x.com",
            TaskDraft {
                title: "Renew passport".to_string(),
                due_date: NaiveDate::from_ymd_opt(2026, 6, 1),
                ..Default::default()
            },
        );
        let id = created.data.unwrap().task.id;

        let exported = export_task(&state, "a@x.com", &id).await;
        assert!(exported.ok, "{:?}", exported.error);

        let synced = sync_calendar(&state, "a@x.com", Some(SyncDirection::ExportOnly), None).await;
        let synced = synced.data.unwrap();
        assert_eq!(synced.exported, 1);
        assert!(synced.last_sync_at.is_some());

        let unlinked = unlink_task(&state, "a@x.com", &id);
        assert!(unlinked.data.unwrap().calendar_event_id.is_none());
        assert!(list_sync_log(&state, "a@x.com").data.unwrap().len() >= 3);
    }

    #[test]
    fn test_unlink_needs_no_calendar_credential() {
        let state = state(false);
        let mut task = Task::new("a@x.com", "Pay rent");
        task.calendar_event_id = Some("evt-1".to_string());
        state.db.insert_task(&task).unwrap();

        let unlinked = unlink_task(&state, "a@x.com", &task.id);
        assert!(unlinked.ok, "{:?}", unlinked.error);
        assert!(unlinked.data.unwrap().calendar_event_id.is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_window_is_an_error_envelope() {
        let state = state(true);
        update_calendar_settings(
            &state,
            "a@x.com",
            SettingsPatch {
                enable_sync: Some(true),
                ..Default::default()
            },
        );
        let window = CalendarWindow {
            past_days: u32::MAX,
            future_days: u32::MAX,
        };

        let imported = import_calendar_events(&state, "a@x.com", Some(window)).await;
        assert!(!imported.ok);
        assert!(imported.error.unwrap().contains("out of range"));

        let synced =
            sync_calendar(&state, "a@x.com", Some(SyncDirection::ImportOnly), Some(window)).await;
        assert!(synced.ok);
        assert!(synced.data.unwrap().import_error.is_some());
    }

    #[test]
    fn test_status_before_any_run_is_empty() {
        let state = state(false);
        let status = get_sync_status(&state);
        assert!(status.ok);
        assert!(status.data.unwrap().is_none());
        assert!(request_sync(&state).ok);
    }
}
