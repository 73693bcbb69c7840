//! Calendar integration.
//!
//! Modules:
//! - google: REST client for a Google Calendar v3 compatible service
//! - bridge: task <-> event export/import and per-owner settings

pub mod bridge;
pub mod google;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::SyncError;

pub use bridge::CalendarBridge;
pub use google::GoogleCalendarClient;

/// When an event happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EventTiming {
    /// `end` is exclusive, as calendar services store it.
    AllDay { start: NaiveDate, end: NaiveDate },
    Timed {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl EventTiming {
    pub fn all_day(day: NaiveDate) -> Self {
        EventTiming::AllDay {
            start: day,
            end: day.succ_opt().unwrap_or(day),
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTiming::AllDay { .. })
    }
}

/// Fields written to the calendar on create/update.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub timing: EventTiming,
    /// IANA zone name sent alongside timed events.
    pub time_zone: String,
}

/// An event as read back from the calendar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub description: String,
    pub timing: EventTiming,
    pub html_link: Option<String>,
}

/// The calendar operations the bridge depends on.
///
/// `update_event` and `get_event` return `Ok(None)` when the event no longer
/// exists so callers can fall back to creating a new one.
#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn create_event(
        &self,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<CalendarEvent, SyncError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<Option<CalendarEvent>, SyncError>;

    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<CalendarEvent>, SyncError>;

    /// Events overlapping `[start, end)`, recurring events expanded.
    async fn list_events(
        &self,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, SyncError>;
}

/// In-memory calendar used by tests across the crate.
#[cfg(test)]
pub mod fake {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeCalendar {
        events: Mutex<BTreeMap<String, CalendarEvent>>,
        next_id: Mutex<u32>,
        pub fail_list: Mutex<bool>,
    }

    impl FakeCalendar {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<CalendarEvent> {
            self.events.lock().values().cloned().collect()
        }

        pub fn event(&self, id: &str) -> Option<CalendarEvent> {
            self.events.lock().get(id).cloned()
        }

        pub fn remove(&self, id: &str) {
            self.events.lock().remove(id);
        }

        /// Put a foreign (or hand-made) event on the calendar.
        pub fn insert(&self, event: CalendarEvent) {
            self.events.lock().insert(event.id.clone(), event);
        }

        fn materialize(id: String, draft: &EventDraft) -> CalendarEvent {
            CalendarEvent {
                html_link: Some(format!("https://calendar.test/event?eid={}", id)),
                id,
                title: draft.title.clone(),
                description: draft.description.clone(),
                timing: draft.timing.clone(),
            }
        }
    }

    fn starts_in(timing: &EventTiming, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let at = match timing {
            EventTiming::AllDay { start, .. } => start.and_hms_opt(0, 0, 0).map(|d| d.and_utc()),
            EventTiming::Timed { start, .. } => Some(*start),
        };
        at.is_some_and(|at| at >= from && at < to)
    }

    #[async_trait]
    impl CalendarService for FakeCalendar {
        async fn create_event(
            &self,
            _calendar_id: &str,
            draft: &EventDraft,
        ) -> Result<CalendarEvent, SyncError> {
            let id = {
                let mut next = self.next_id.lock();
                *next += 1;
                format!("ev{}", *next)
            };
            let event = Self::materialize(id, draft);
            self.insert(event.clone());
            Ok(event)
        }

        async fn update_event(
            &self,
            _calendar_id: &str,
            event_id: &str,
            draft: &EventDraft,
        ) -> Result<Option<CalendarEvent>, SyncError> {
            let mut events = self.events.lock();
            if !events.contains_key(event_id) {
                return Ok(None);
            }
            let event = Self::materialize(event_id.to_string(), draft);
            events.insert(event_id.to_string(), event.clone());
            Ok(Some(event))
        }

        async fn get_event(
            &self,
            _calendar_id: &str,
            event_id: &str,
        ) -> Result<Option<CalendarEvent>, SyncError> {
            Ok(self.event(event_id))
        }

        async fn list_events(
            &self,
            _calendar_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<CalendarEvent>, SyncError> {
            if *self.fail_list.lock() {
                return Err(SyncError::Calendar("listing unavailable".to_string()));
            }
            Ok(self
                .events
                .lock()
                .values()
                .filter(|e| starts_in(&e.timing, start, end))
                .cloned()
                .collect())
        }
    }
}
