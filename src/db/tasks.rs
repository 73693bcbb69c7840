//! Task and checklist rows.

use serde_json::json;

use super::{fields, to_record, ChecklistItem, DbError, EntityKind, Record, SyncDb, Task};

impl SyncDb {
    pub fn insert_task(&self, task: &Task) -> Result<(), DbError> {
        self.insert(EntityKind::Tasks, task)
    }

    /// Fetch one task, scoped to its owner.
    pub fn get_task(&self, user_key: &str, id: &str) -> Result<Option<Task>, DbError> {
        self.find_one(
            EntityKind::Tasks,
            fields([("id", json!(id)), ("userKey", json!(user_key))]),
        )
    }

    /// Every task owned by `user_key`, in creation order.
    pub fn list_tasks(&self, user_key: &str) -> Result<Vec<Task>, DbError> {
        self.find_rows(EntityKind::Tasks, fields([("userKey", json!(user_key))]))
    }

    /// Every task regardless of owner. Used where ownership can move
    /// (tracker projection).
    pub fn list_all_tasks(&self) -> Result<Vec<Task>, DbError> {
        self.find_rows(EntityKind::Tasks, Record::new())
    }

    /// Tasks of one owner linked to a calendar event.
    pub fn find_tasks_by_event(
        &self,
        user_key: &str,
        event_id: &str,
    ) -> Result<Vec<Task>, DbError> {
        self.find_rows(
            EntityKind::Tasks,
            fields([
                ("calendarEventId", json!(event_id)),
                ("userKey", json!(user_key)),
            ]),
        )
    }

    /// Instances generated from one template.
    pub fn list_instances(&self, user_key: &str, template_id: &str) -> Result<Vec<Task>, DbError> {
        self.find_rows(
            EntityKind::Tasks,
            fields([
                ("templateTaskId", json!(template_id)),
                ("userKey", json!(user_key)),
            ]),
        )
    }

    /// Apply a partial update. Returns false if the task no longer exists.
    pub fn update_task_fields(&self, id: &str, patch: Record) -> Result<bool, DbError> {
        self.patch(EntityKind::Tasks, id, patch)
    }

    /// Write every field of `task` back to its row.
    pub fn save_task(&self, task: &Task) -> Result<bool, DbError> {
        self.patch(EntityKind::Tasks, &task.id, to_record(task)?)
    }

    pub fn delete_task_row(&self, id: &str) -> Result<bool, DbError> {
        self.store.delete(EntityKind::Tasks, id)
    }

    pub fn insert_checklist_item(&self, item: &ChecklistItem) -> Result<(), DbError> {
        self.insert(EntityKind::TaskChecklist, item)
    }

    pub fn list_checklist(
        &self,
        user_key: &str,
        task_id: &str,
    ) -> Result<Vec<ChecklistItem>, DbError> {
        self.find_rows(
            EntityKind::TaskChecklist,
            fields([("taskId", json!(task_id)), ("userKey", json!(user_key))]),
        )
    }

    pub fn delete_checklist_item(&self, id: &str) -> Result<bool, DbError> {
        self.store.delete(EntityKind::TaskChecklist, id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};

    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_task_round_trip_through_store() {
        let db = test_db();
        let mut task = Task::new("a@x.com", "Pay rent");
        task.due_date = NaiveDate::from_ymd_opt(2026, 5, 1);
        task.tags = vec!["home".to_string()];
        db.insert_task(&task).unwrap();

        let loaded = db.get_task("a@x.com", &task.id).unwrap().unwrap();
        assert_eq!(loaded, task);
        assert!(db.get_task("b@x.com", &task.id).unwrap().is_none());
    }

    #[test]
    fn test_find_by_event_is_owner_scoped() {
        let db = test_db();
        let mut mine = Task::new("a@x.com", "Mine");
        mine.calendar_event_id = Some("ev1".to_string());
        let mut theirs = Task::new("b@x.com", "Theirs");
        theirs.calendar_event_id = Some("ev1".to_string());
        db.insert_task(&mine).unwrap();
        db.insert_task(&theirs).unwrap();

        let found = db.find_tasks_by_event("a@x.com", "ev1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, mine.id);
    }

    #[test]
    fn test_update_fields_and_save() {
        let db = test_db();
        let mut task = Task::new("a@x.com", "Draft");
        db.insert_task(&task).unwrap();

        assert!(db
            .update_task_fields(&task.id, fields([("title", json!("Final"))]))
            .unwrap());
        assert_eq!(db.get_task("a@x.com", &task.id).unwrap().unwrap().title, "Final");

        task.title = "Saved".to_string();
        task.updated_at = Utc::now();
        assert!(db.save_task(&task).unwrap());
        assert_eq!(db.get_task("a@x.com", &task.id).unwrap().unwrap().title, "Saved");
    }
}
