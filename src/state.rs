use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::calendar::{CalendarBridge, CalendarService, GoogleCalendarClient};
use crate::db::{SqliteRecordStore, SyncDb};
use crate::error::SyncError;
use crate::types::Config;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_VAR: &str = "ROUTINE_SYNC_CONFIG";
pub const TRACKER_TOKEN_VAR: &str = "ROUTINE_SYNC_TRACKER_TOKEN";
pub const CALENDAR_TOKEN_VAR: &str = "ROUTINE_SYNC_CALENDAR_TOKEN";

// =============================================================================
// Secrets
// =============================================================================

/// Source of credentials. Read once at process start.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Credentials passed explicitly into each run.
#[derive(Clone, Default)]
pub struct RunContext {
    pub tracker_token: Option<String>,
    pub calendar_token: Option<String>,
}

impl RunContext {
    pub fn from_secrets(secrets: &dyn SecretStore) -> Self {
        let read = |name: &str| secrets.get(name).filter(|v| !v.trim().is_empty());
        Self {
            tracker_token: read(TRACKER_TOKEN_VAR),
            calendar_token: read(CALENDAR_TOKEN_VAR),
        }
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("tracker_token", &self.tracker_token.as_ref().map(|_| "<set>"))
            .field("calendar_token", &self.calendar_token.as_ref().map(|_| "<set>"))
            .finish()
    }
}

// =============================================================================
// Application state
// =============================================================================

/// Process-wide state shared by the poller and the command surface.
pub struct AppState {
    pub db: SyncDb,
    pub config: RwLock<Config>,
    pub context: RunContext,
    /// Absent when no calendar credential is configured.
    pub calendar: Option<Arc<dyn CalendarService>>,
    /// Wakes the sync poller ahead of its next scheduled run.
    pub sync_wake: Notify,
}

impl AppState {
    /// Open the database and build the clients from `config` and `secrets`.
    pub fn new(config: Config, secrets: &dyn SecretStore) -> Result<Self, SyncError> {
        let db_path = config.db_path.as_deref().map(std::path::Path::new);
        let store = SqliteRecordStore::open_configured(db_path)?;
        let context = RunContext::from_secrets(secrets);

        let calendar: Option<Arc<dyn CalendarService>> = match context.calendar_token.as_deref() {
            Some(token) => Some(Arc::new(GoogleCalendarClient::new(
                &config.calendar.base_url,
                token,
                config.tracker.retry.clone(),
            ))),
            None => {
                log::info!("No calendar credential set; calendar sync disabled for this process");
                None
            }
        };
        if context.tracker_token.is_none() && config.tracker.enabled {
            log::warn!("Tracker sync is enabled but {} is not set", TRACKER_TOKEN_VAR);
        }

        Ok(Self::with_parts(
            SyncDb::new(Arc::new(store)),
            config,
            context,
            calendar,
        ))
    }

    pub fn with_parts(
        db: SyncDb,
        config: Config,
        context: RunContext,
        calendar: Option<Arc<dyn CalendarService>>,
    ) -> Self {
        Self {
            db,
            config: RwLock::new(config),
            context,
            calendar,
            sync_wake: Notify::new(),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn bridge(&self) -> Result<CalendarBridge, SyncError> {
        self.calendar
            .clone()
            .map(|calendar| CalendarBridge::new(self.db.clone(), calendar))
            .ok_or_else(|| SyncError::MissingCredential("calendar access token".to_string()))
    }
}

// =============================================================================
// Config file
// =============================================================================

/// Config file path: `$ROUTINE_SYNC_CONFIG`, else ~/.routine-sync/config.json
pub fn config_path() -> Result<PathBuf, SyncError> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_VAR) {
        if !explicit.trim().is_empty() {
            return Ok(PathBuf::from(explicit));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::Config("could not find home directory".to_string()))?;
    Ok(home.join(".routine-sync").join("config.json"))
}

/// Load configuration. A missing file yields the defaults.
pub fn load_config() -> Result<Config, SyncError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &std::path::Path) -> Result<Config, SyncError> {
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| SyncError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Reload configuration from disk into `state`.
pub fn reload_config(state: &AppState) -> Result<Config, SyncError> {
    let config = load_config()?;
    *state.config.write() = config.clone();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::db::test_utils::test_db;

    struct MapSecrets(HashMap<&'static str, &'static str>);

    impl SecretStore for MapSecrets {
        fn get(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    #[test]
    fn test_run_context_ignores_blank_secrets() {
        let secrets = MapSecrets(HashMap::from([
            (TRACKER_TOKEN_VAR, "pk_123"),
            (CALENDAR_TOKEN_VAR, "  "),
        ]));
        let context = RunContext::from_secrets(&secrets);
        assert_eq!(context.tracker_token.as_deref(), Some("pk_123"));
        assert!(context.calendar_token.is_none());
        assert!(!format!("{:?}", context).contains("pk_123"));
    }

    #[test]
    fn test_load_config_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json")).unwrap();
        assert!(!config.tracker.enabled);
        assert_eq!(config.calendar.future_days, 30);
    }

    #[test]
    fn test_load_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"tracker": {"enabled": true, "viewId": "v9"}, "calendar": {"pastDays": 3}}"#,
        )
        .unwrap();
        let config = load_config_from(&path).unwrap();
        assert!(config.tracker.enabled);
        assert_eq!(config.tracker.view_id, "v9");
        assert_eq!(config.calendar.past_days, 3);
        assert_eq!(config.calendar.future_days, 30);
    }

    #[test]
    fn test_load_config_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_bridge_requires_calendar() {
        let state = AppState::with_parts(test_db(), Config::default(), RunContext::default(), None);
        assert!(matches!(
            state.bridge(),
            Err(SyncError::MissingCredential(_))
        ));
    }
}
