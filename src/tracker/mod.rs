//! Third-party task tracker integration.
//!
//! Pulls every task behind a tracker view, mirrors it locally and projects
//! the mirror into internal tasks:
//!
//! - client: paginated fetch with bounded retry
//! - sync: reconciliation of a full fetch against the mirror snapshot
//! - projection: mirror rows -> internal tasks
//! - poller: fixed-interval background loop

pub mod client;
pub mod poller;
pub mod projection;
pub mod sync;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use crate::retry::RetryPolicy;

/// Tracker integration configuration stored in ~/.routine-sync/config.json.
///
/// The API token is not part of it; it comes from the secret store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub view_id: String,
    #[serde(default = "default_include_closed")]
    pub include_closed: bool,
    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: u32,
    /// Hard ceiling on pages per fetch, for providers that never send an empty page.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Owner key for tasks nobody could be resolved for.
    #[serde(default = "default_fallback_owner")]
    pub fallback_owner: String,
    /// Tracker username -> internal email.
    #[serde(default)]
    pub username_emails: HashMap<String, String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_base_url() -> String {
    "https://api.clickup.com/api/v2".to_string()
}

fn default_include_closed() -> bool {
    true
}

fn default_poll_interval_minutes() -> u32 {
    60
}

fn default_max_pages() -> u32 {
    100
}

fn default_fallback_owner() -> String {
    "tracker-queue".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_base_url(),
            view_id: String::new(),
            include_closed: default_include_closed(),
            poll_interval_minutes: default_poll_interval_minutes(),
            max_pages: default_max_pages(),
            fallback_owner: default_fallback_owner(),
            username_emails: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_config_partial_json() {
        let json = r#"{
            "enabled": true,
            "viewId": "abc-123",
            "usernameEmails": {"jdoe": "jane@x.com"},
            "retry": {"maxAttempts": 3}
        }"#;
        let config: TrackerConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.view_id, "abc-123");
        assert_eq!(config.fallback_owner, "tracker-queue");
        assert_eq!(config.max_pages, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(config.username_emails["jdoe"], "jane@x.com");
    }
}
