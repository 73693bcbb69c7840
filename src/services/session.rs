// Session service.
// Bootstraps an owner on first contact and keeps their recurring tasks topped up.

use serde::Serialize;

use crate::calendar::bridge::get_or_create_settings;
use crate::db::{SyncDb, UserSyncSettings};
use crate::error::SyncError;
use crate::recurrence::{self, MaterializeOutcome};
use crate::types::RecurrenceConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user_key: String,
    /// True when this call created the user row.
    pub created_user: bool,
    pub task_count: usize,
    pub settings: UserSyncSettings,
    pub materialized: MaterializeOutcome,
}

/// Start a session for `owner`.
///
/// Ensures the user and settings rows exist, then materializes recurring
/// instances over the session horizon. Materialization problems are logged
/// and reported in `materialized`; they never fail the session.
pub fn start_session(
    db: &SyncDb,
    horizons: &RecurrenceConfig,
    owner: &str,
) -> Result<SessionInfo, SyncError> {
    let owner = owner.trim();
    if owner.is_empty() {
        return Err(SyncError::Invalid("owner must not be empty".to_string()));
    }

    let created_user = db.ensure_user(owner)?;
    if created_user {
        log::info!("First session for {}", owner);
    }
    let settings = get_or_create_settings(db, owner)?;

    let materialized =
        match recurrence::materialize_for_owner(db, owner, horizons.session_horizon_days) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Session materialization for {} failed: {}", owner, e);
                MaterializeOutcome {
                    failed: 1,
                    last_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

    let task_count = db.list_tasks(owner)?.len();
    Ok(SessionInfo {
        user_key: owner.to_string(),
        created_user,
        task_count,
        settings,
        materialized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::Task;
    use serde_json::json;

    #[test]
    fn test_first_session_creates_user_and_settings() {
        let db = test_db();
        let info = start_session(&db, &RecurrenceConfig::default(), "a@x.com").unwrap();
        assert!(info.created_user);
        assert_eq!(info.task_count, 0);
        assert!(!info.settings.enable_sync);
        assert!(db.get_settings("a@x.com").unwrap().is_some());

        let again = start_session(&db, &RecurrenceConfig::default(), "a@x.com").unwrap();
        assert!(!again.created_user);
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_session_materializes_over_session_horizon() {
        let db = test_db();
        let mut template = Task::new("a@x.com", "Stretch");
        template.is_recurring = true;
        template.recurrence_type = Some("DAILY".to_string());
        db.insert_task(&template).unwrap();

        let info = start_session(&db, &RecurrenceConfig::default(), "a@x.com").unwrap();
        // [today, today + 14]
        assert_eq!(info.materialized.created, 15);
        assert_eq!(info.task_count, 16);

        let again = start_session(&db, &RecurrenceConfig::default(), "a@x.com").unwrap();
        assert_eq!(again.materialized.created, 0);
    }

    #[test]
    fn test_bad_template_does_not_fail_session() {
        let db = test_db();
        let mut template = Task::new("a@x.com", "Odd");
        template.is_recurring = true;
        template.recurrence_type = Some("MONTHLY".to_string());
        template.recurrence_days = Some(json!([1]));
        db.insert_task(&template).unwrap();

        let info = start_session(&db, &RecurrenceConfig::default(), "a@x.com").unwrap();
        assert_eq!(info.materialized.failed, 1);
        assert!(info.materialized.last_error.is_some());
    }

    #[test]
    fn test_blank_owner_rejected() {
        let db = test_db();
        assert!(matches!(
            start_session(&db, &RecurrenceConfig::default(), "  "),
            Err(SyncError::Invalid(_))
        ));
    }
}
