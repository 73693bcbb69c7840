use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::tracker::TrackerConfig;

/// Configuration stored in ~/.routine-sync/config.json
///
/// Every field has a default so an empty `{}` file (or no file) is valid.
/// Credentials never live here; see `state::SecretStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Explicit database path. Defaults to `~/.routine-sync/routine.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub recurrence: RecurrenceConfig,
}

/// Calendar service endpoint and the default import window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarConfig {
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    #[serde(default = "default_past_days")]
    pub past_days: u32,
    #[serde(default = "default_future_days")]
    pub future_days: u32,
}

fn default_calendar_base_url() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}

fn default_past_days() -> u32 {
    7
}

fn default_future_days() -> u32 {
    30
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            base_url: default_calendar_base_url(),
            past_days: default_past_days(),
            future_days: default_future_days(),
        }
    }
}

impl CalendarConfig {
    pub fn window(&self) -> CalendarWindow {
        CalendarWindow {
            past_days: self.past_days,
            future_days: self.future_days,
        }
    }
}

/// Fixed materialization horizons. Session start looks two weeks ahead,
/// template edits look a month ahead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceConfig {
    #[serde(default = "default_session_horizon")]
    pub session_horizon_days: u32,
    #[serde(default = "default_edit_horizon")]
    pub edit_horizon_days: u32,
}

fn default_session_horizon() -> u32 {
    14
}

fn default_edit_horizon() -> u32 {
    30
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            session_horizon_days: default_session_horizon(),
            edit_horizon_days: default_edit_horizon(),
        }
    }
}

// =============================================================================
// Task vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Lenient parse used for stored rows; unknown labels fall back to normal.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "low" => Priority::Low,
            "medium" => Priority::Medium,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status. The three native states plus any label an external source
/// brought along, preserved verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[default]
    Open,
    Doing,
    Done,
    Other(String),
}

impl TaskStatus {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "" | "open" => TaskStatus::Open,
            "doing" => TaskStatus::Doing,
            "done" | "completed" => TaskStatus::Done,
            _ => TaskStatus::Other(label.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Other(label) => label,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(label
            .map(|l| TaskStatus::from_label(&l))
            .unwrap_or_default())
    }
}

/// Which way calendar sync flows for an owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    ExportOnly,
    ImportOnly,
    #[default]
    Both,
}

impl SyncDirection {
    pub fn exports(&self) -> bool {
        matches!(self, SyncDirection::ExportOnly | SyncDirection::Both)
    }

    pub fn imports(&self) -> bool {
        matches!(self, SyncDirection::ImportOnly | SyncDirection::Both)
    }
}

/// Calendar import window relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarWindow {
    pub past_days: u32,
    pub future_days: u32,
}

impl Default for CalendarWindow {
    fn default() -> Self {
        CalendarConfig::default().window()
    }
}

// =============================================================================
// Orchestrator run vocabulary
// =============================================================================

/// Stage reached by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    #[default]
    Fetching,
    Reconciling,
    Projecting,
    Materializing,
    CalendarSync,
    Done,
    Failed,
}

/// Counters reported by a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// External tasks returned by the fetch.
    pub fetched: usize,
    /// Mirror rows overwritten in place.
    pub updated: usize,
    /// Mirror rows created.
    pub inserted: usize,
    /// Mirror rows flagged out of view in this pass.
    pub out_of_view: usize,
    /// Internal tasks created or updated by projection.
    pub synced: usize,
    /// Mirror rows skipped by projection.
    pub skipped: usize,
    /// Recurring instances created.
    #[serde(default)]
    pub materialized: usize,
    /// Tasks exported plus events imported or updated across owners.
    #[serde(default)]
    pub calendar_synced: usize,
    /// Per-item failures in the non-fatal stages.
    pub errors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncSummary {
    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.db_path.is_none());
        assert_eq!(config.calendar.past_days, 7);
        assert_eq!(config.calendar.future_days, 30);
        assert_eq!(config.recurrence.session_horizon_days, 14);
        assert_eq!(config.recurrence.edit_horizon_days, 30);
        assert!(!config.tracker.enabled);
    }

    #[test]
    fn test_priority_parse_is_lenient() {
        assert_eq!(Priority::parse("URGENT"), Priority::Urgent);
        assert_eq!(Priority::parse(" low "), Priority::Low);
        assert_eq!(Priority::parse("p1"), Priority::Normal);
        assert_eq!(Priority::parse(""), Priority::Normal);
    }

    #[test]
    fn test_task_status_preserves_external_labels() {
        assert_eq!(TaskStatus::from_label("Doing"), TaskStatus::Doing);
        assert_eq!(TaskStatus::from_label("completed"), TaskStatus::Done);
        let other = TaskStatus::from_label("blocked on review");
        assert_eq!(other.as_str(), "blocked on review");

        let json = serde_json::to_string(&other).unwrap();
        assert_eq!(json, "\"blocked on review\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, other);
        let null: TaskStatus = serde_json::from_str("null").unwrap();
        assert_eq!(null, TaskStatus::Open);
    }

    #[test]
    fn test_sync_direction_wire_format() {
        let dir: SyncDirection = serde_json::from_str("\"EXPORT_ONLY\"").unwrap();
        assert!(dir.exports());
        assert!(!dir.imports());
        assert_eq!(serde_json::to_string(&SyncDirection::Both).unwrap(), "\"BOTH\"");
    }
}
