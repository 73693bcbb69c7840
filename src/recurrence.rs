//! Recurring task materialization.
//!
//! A template (`isRecurring`, no `templateTaskId`) is expanded into one
//! instance per matching day of a rolling horizon. The pair
//! (templateTaskId, dueDate) identifies an instance; an existing instance is
//! never recreated or touched, so expansion is additive and safe to repeat.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::db::{SyncDb, Task};
use crate::error::SyncError;
use crate::types::TaskStatus;

/// How a template repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Daily,
    /// ISO weekday numbers, 1 = Monday ... 7 = Sunday.
    Weekly(BTreeSet<u32>),
}

impl Recurrence {
    pub fn matches(&self, day: NaiveDate) -> bool {
        match self {
            Recurrence::Daily => true,
            Recurrence::Weekly(days) => days.contains(&day.weekday().number_from_monday()),
        }
    }
}

/// Weekday set as stored: an array of numbers (or numeric strings), or a
/// string holding such an array.
fn parse_weekdays(raw: Option<&Value>) -> Result<BTreeSet<u32>, String> {
    let value = match raw {
        None | Some(Value::Null) => return Err("no weekdays".to_string()),
        Some(Value::String(s)) if s.trim().is_empty() => return Err("no weekdays".to_string()),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .map_err(|e| format!("weekdays {:?} are not JSON: {}", s, e))?,
        Some(other) => other.clone(),
    };
    let Value::Array(items) = value else {
        return Err(format!("weekdays must be a list, got {}", value));
    };

    let mut days = BTreeSet::new();
    for item in &items {
        let n = match item {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match n {
            Some(n @ 1..=7) => {
                days.insert(n as u32);
            }
            _ => return Err(format!("invalid weekday {}", item)),
        }
    }
    if days.is_empty() {
        return Err("no weekdays".to_string());
    }
    Ok(days)
}

/// Read the recurrence descriptor of a template.
pub fn parse_recurrence(template: &Task) -> Result<Recurrence, SyncError> {
    let malformed = |reason: String| SyncError::MalformedRecurrence {
        template_id: template.id.clone(),
        reason,
    };
    // Rows written before types existed only knew weekly repetition.
    let kind = template
        .recurrence_type
        .as_deref()
        .unwrap_or("WEEKLY")
        .trim()
        .to_uppercase();
    match kind.as_str() {
        "DAILY" => Ok(Recurrence::Daily),
        "WEEKLY" => parse_weekdays(template.recurrence_days.as_ref())
            .map(Recurrence::Weekly)
            .map_err(malformed),
        other => Err(malformed(format!("unknown recurrence type {:?}", other))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeOutcome {
    pub templates: usize,
    pub created: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn new_instance(template: &Task, day: NaiveDate) -> Task {
    let mut instance = Task::new(&template.user_key, &template.title);
    instance.description = template.description.clone();
    instance.priority = template.priority;
    instance.tags = template.tags.clone();
    instance.due_date = Some(day);
    instance.due_time = template.recurrence_time;
    instance.status = TaskStatus::Open;
    instance.template_task_id = Some(template.id.clone());
    instance
}

/// Last day of the horizon starting at `today`.
fn horizon_end(today: NaiveDate, horizon_days: u32) -> Result<NaiveDate, SyncError> {
    today
        .checked_add_signed(Duration::days(i64::from(horizon_days)))
        .ok_or_else(|| {
            SyncError::Invalid(format!(
                "recurrence horizon of {} days from {} is out of range",
                horizon_days, today
            ))
        })
}

/// Days of `[today, last]` a template wants an instance on.
fn due_days(
    template: &Task,
    recurrence: &Recurrence,
    today: NaiveDate,
    last: NaiveDate,
) -> Vec<NaiveDate> {
    let first = template
        .recurrence_start_date
        .map_or(today, |start| start.max(today));
    let last = template.recurrence_end_date.map_or(last, |end| end.min(last));

    first
        .iter_days()
        .take_while(|d| *d <= last)
        .filter(|d| recurrence.matches(*d))
        .collect()
}

/// Ensure every template of `owner` has its instances within the horizon.
///
/// A bad template is logged and counted; the others still expand.
pub fn materialize(
    db: &SyncDb,
    owner: &str,
    today: NaiveDate,
    horizon_days: u32,
) -> Result<MaterializeOutcome, SyncError> {
    let last = horizon_end(today, horizon_days)?;
    let tasks = db.list_tasks(owner)?;

    let mut existing: HashMap<&str, HashSet<NaiveDate>> = HashMap::new();
    for task in &tasks {
        if let (Some(template_id), Some(due)) = (task.template_task_id.as_deref(), task.due_date) {
            existing.entry(template_id).or_default().insert(due);
        }
    }

    let mut outcome = MaterializeOutcome::default();
    for template in tasks.iter().filter(|t| t.is_template()) {
        outcome.templates += 1;
        let have = existing.get(template.id.as_str());
        match expand_template(db, template, have, today, last) {
            Ok(created) => outcome.created += created,
            Err(e) => {
                log::warn!("Skipping recurring template {}: {}", template.id, e);
                outcome.failed += 1;
                outcome.last_error = Some(e.to_string());
            }
        }
    }

    if outcome.created > 0 || outcome.failed > 0 {
        log::info!(
            "Materialized {} instance(s) for {} from {} template(s), {} failed",
            outcome.created,
            owner,
            outcome.templates,
            outcome.failed
        );
    }
    Ok(outcome)
}

fn expand_template(
    db: &SyncDb,
    template: &Task,
    have: Option<&HashSet<NaiveDate>>,
    today: NaiveDate,
    last: NaiveDate,
) -> Result<usize, SyncError> {
    let recurrence = parse_recurrence(template)?;
    let mut created = 0;
    for day in due_days(template, &recurrence, today, last) {
        if have.is_some_and(|h| h.contains(&day)) {
            continue;
        }
        db.insert_task(&new_instance(template, day))?;
        created += 1;
    }
    Ok(created)
}

/// Today's date in the owner's timezone (UTC without settings).
pub fn owner_today(db: &SyncDb, owner: &str) -> Result<NaiveDate, SyncError> {
    let now = Utc::now();
    Ok(match db.get_settings(owner)? {
        Some(settings) => now.with_timezone(&settings.tz()).date_naive(),
        None => now.date_naive(),
    })
}

/// Materialize from the owner's current date.
pub fn materialize_for_owner(
    db: &SyncDb,
    owner: &str,
    horizon_days: u32,
) -> Result<MaterializeOutcome, SyncError> {
    let today = owner_today(db, owner)?;
    materialize(db, owner, today, horizon_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::types::Priority;
    use chrono::NaiveTime;
    use serde_json::json;

    /// 2026-05-04 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 4).unwrap()
    }

    fn template(db: &SyncDb, owner: &str, kind: &str, days: Value) -> Task {
        let mut t = Task::new(owner, "Gym");
        t.description = "Leg day".to_string();
        t.priority = Priority::High;
        t.tags = vec!["health".to_string()];
        t.is_recurring = true;
        t.recurrence_type = Some(kind.to_string());
        t.recurrence_days = Some(days);
        t.recurrence_time = NaiveTime::from_hms_opt(7, 30, 0);
        db.insert_task(&t).unwrap();
        t
    }

    fn instances(db: &SyncDb, owner: &str, template_id: &str) -> Vec<Task> {
        db.list_instances(owner, template_id).unwrap()
    }

    #[test]
    fn test_weekly_expansion_is_idempotent() {
        let db = test_db();
        let t = template(&db, "a@x.com", "WEEKLY", json!([1, 3]));

        let first = materialize(&db, "a@x.com", monday(), 14).unwrap();
        // Mondays 4/11/18 and Wednesdays 6/13.
        assert_eq!(first.created, 5);
        let after_first = instances(&db, "a@x.com", &t.id).len();

        let second = materialize(&db, "a@x.com", monday(), 14).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(instances(&db, "a@x.com", &t.id).len(), after_first);
    }

    #[test]
    fn test_instance_copies_template_fields() {
        let db = test_db();
        let t = template(&db, "a@x.com", "WEEKLY", json!("[3]"));
        materialize(&db, "a@x.com", monday(), 7).unwrap();

        let made = instances(&db, "a@x.com", &t.id);
        assert_eq!(made.len(), 1);
        let inst = &made[0];
        assert_eq!(inst.due_date, NaiveDate::from_ymd_opt(2026, 5, 6));
        assert_eq!(inst.due_time, NaiveTime::from_hms_opt(7, 30, 0));
        assert_eq!(inst.title, "Gym");
        assert_eq!(inst.description, "Leg day");
        assert_eq!(inst.priority, Priority::High);
        assert_eq!(inst.tags, vec!["health".to_string()]);
        assert_eq!(inst.status, TaskStatus::Open);
        assert!(!inst.is_recurring);
        assert!(inst.is_instance());
    }

    #[test]
    fn test_malformed_template_does_not_block_others() {
        let db = test_db();
        template(&db, "a@x.com", "WEEKLY", json!("not json"));
        template(&db, "a@x.com", "MONTHLY", json!([1]));
        let good = template(&db, "a@x.com", "DAILY", Value::Null);

        let outcome = materialize(&db, "a@x.com", monday(), 2).unwrap();
        assert_eq!(outcome.templates, 3);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.created, 3);
        assert_eq!(instances(&db, "a@x.com", &good.id).len(), 3);
    }

    #[test]
    fn test_out_of_range_horizon_is_rejected() {
        let db = test_db();
        template(&db, "a@x.com", "DAILY", Value::Null);
        assert!(matches!(
            materialize(&db, "a@x.com", monday(), u32::MAX),
            Err(SyncError::Invalid(_))
        ));
        assert_eq!(db.list_tasks("a@x.com").unwrap().len(), 1);
    }

    #[test]
    fn test_start_and_end_dates_clip_the_horizon() {
        let db = test_db();
        let mut t = template(&db, "a@x.com", "DAILY", Value::Null);
        t.recurrence_start_date = NaiveDate::from_ymd_opt(2026, 5, 6);
        t.recurrence_end_date = NaiveDate::from_ymd_opt(2026, 5, 8);
        db.save_task(&t).unwrap();

        materialize(&db, "a@x.com", monday(), 30).unwrap();
        let mut days: Vec<_> = instances(&db, "a@x.com", &t.id)
            .into_iter()
            .filter_map(|i| i.due_date)
            .collect();
        days.sort();
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2026, 5, 6).unwrap(),
                NaiveDate::from_ymd_opt(2026, 5, 7).unwrap(),
                NaiveDate::from_ymd_opt(2026, 5, 8).unwrap(),
            ]
        );
    }

    #[test]
    fn test_existing_instance_is_not_overwritten() {
        let db = test_db();
        let t = template(&db, "a@x.com", "WEEKLY", json!([1]));
        materialize(&db, "a@x.com", monday(), 0).unwrap();

        let mut inst = instances(&db, "a@x.com", &t.id).remove(0);
        inst.status = TaskStatus::Done;
        inst.title = "Gym (skipped warmup)".to_string();
        db.save_task(&inst).unwrap();

        materialize(&db, "a@x.com", monday(), 0).unwrap();
        let made = instances(&db, "a@x.com", &t.id);
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].status, TaskStatus::Done);
        assert_eq!(made[0].title, "Gym (skipped warmup)");
    }

    #[test]
    fn test_other_owners_templates_are_ignored() {
        let db = test_db();
        template(&db, "b@x.com", "DAILY", Value::Null);
        let outcome = materialize(&db, "a@x.com", monday(), 5).unwrap();
        assert_eq!(outcome.templates, 0);
        assert!(db.list_tasks("a@x.com").unwrap().is_empty());
    }

    #[test]
    fn test_weekday_parsing() {
        assert_eq!(
            parse_weekdays(Some(&json!(["1", 7]))).unwrap(),
            BTreeSet::from([1, 7])
        );
        assert!(parse_weekdays(Some(&json!([0]))).is_err());
        assert!(parse_weekdays(Some(&json!([]))).is_err());
        assert!(parse_weekdays(Some(&json!(""))).is_err());
        assert!(parse_weekdays(None).is_err());
    }
}
