//! Per-owner settings and the user registry.

use chrono::Utc;
use serde_json::json;

use super::{fields, DbError, EntityKind, Record, SyncDb, User, UserSyncSettings};

impl SyncDb {
    pub fn get_settings(&self, user_key: &str) -> Result<Option<UserSyncSettings>, DbError> {
        self.find_one(EntityKind::Settings, fields([("userKey", json!(user_key))]))
    }

    pub fn insert_settings(&self, settings: &UserSyncSettings) -> Result<(), DbError> {
        self.insert(EntityKind::Settings, settings)
    }

    /// Patch the settings row of an owner. Returns false if it does not exist.
    pub fn update_settings(&self, user_key: &str, patch: Record) -> Result<bool, DbError> {
        self.patch(EntityKind::Settings, user_key, patch)
    }

    /// Owners with a settings row that enables calendar sync.
    pub fn list_sync_enabled_settings(&self) -> Result<Vec<UserSyncSettings>, DbError> {
        self.find_rows(EntityKind::Settings, fields([("enableSync", json!(true))]))
    }

    /// Register an owner if unknown. Returns true when a row was created.
    pub fn ensure_user(&self, user_key: &str) -> Result<bool, DbError> {
        let existing: Option<User> =
            self.find_one(EntityKind::Users, fields([("userKey", json!(user_key))]))?;
        if existing.is_some() {
            return Ok(false);
        }
        let user = User {
            id: user_key.to_string(),
            user_key: user_key.to_string(),
            email: if user_key.contains('@') {
                user_key.to_string()
            } else {
                String::new()
            },
            created_at: Utc::now(),
        };
        self.insert(EntityKind::Users, &user)?;
        Ok(true)
    }

    pub fn list_users(&self) -> Result<Vec<User>, DbError> {
        self.find_rows(EntityKind::Users, Record::new())
    }
}
