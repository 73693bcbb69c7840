//! Google Calendar API v3 client.
//!
//! Event insert/patch/get/list against `{base}/calendars/{calendarId}/events`,
//! authenticated with a bearer token. Requests go through `send_with_retry`,
//! which shares the retry loop used for the tracker.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{CalendarEvent, CalendarService, EventDraft, EventTiming};
use crate::error::SyncError;
use crate::retry::{with_retry, Attempt, FailureClass, RetryPolicy};

// ============================================================================
// API response types (deserialized from Google Calendar JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    #[serde(default)]
    items: Vec<GoogleEventRaw>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    start: Option<EventDateTime>,
    end: Option<EventDateTime>,
    #[serde(default)]
    html_link: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDateTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: String,
}

fn parse_timing(start: &EventDateTime, end: Option<&EventDateTime>) -> Option<EventTiming> {
    if let Some(raw) = start.date_time.as_deref() {
        let start = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
        let end = end
            .and_then(|e| e.date_time.as_deref())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(start);
        return Some(EventTiming::Timed { start, end });
    }
    let day = NaiveDate::parse_from_str(start.date.as_deref()?, "%Y-%m-%d").ok()?;
    let end = end
        .and_then(|e| e.date.as_deref())
        .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
        .unwrap_or_else(|| day.succ_opt().unwrap_or(day));
    Some(EventTiming::AllDay { start: day, end })
}

impl GoogleEventRaw {
    fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    /// None for cancelled events and events without a readable start.
    fn into_event(self) -> Option<CalendarEvent> {
        if self.is_cancelled() {
            return None;
        }
        let timing = match self.start.as_ref() {
            Some(start) => parse_timing(start, self.end.as_ref()),
            None => None,
        };
        let Some(timing) = timing else {
            log::warn!("Calendar event {} has no usable start, skipping", self.id);
            return None;
        };
        Some(CalendarEvent {
            id: self.id,
            title: self.summary.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            timing,
            html_link: self.html_link,
        })
    }
}

fn event_body(draft: &EventDraft) -> serde_json::Value {
    let (start, end) = match &draft.timing {
        EventTiming::AllDay { start, end } => (
            EventDateTime {
                date_time: None,
                date: Some(start.format("%Y-%m-%d").to_string()),
                time_zone: None,
            },
            EventDateTime {
                date_time: None,
                date: Some(end.format("%Y-%m-%d").to_string()),
                time_zone: None,
            },
        ),
        EventTiming::Timed { start, end } => (
            EventDateTime {
                date_time: Some(start.to_rfc3339()),
                date: None,
                time_zone: Some(draft.time_zone.clone()),
            },
            EventDateTime {
                date_time: Some(end.to_rfc3339()),
                date: None,
                time_zone: Some(draft.time_zone.clone()),
            },
        ),
    };
    json!({
        "summary": draft.title,
        "description": draft.description,
        "start": start,
        "end": end,
    })
}

// ============================================================================
// Retrying transport
// ============================================================================

/// Send a request, retrying 429/5xx/transport failures per `policy`.
/// Any other response is handed back for the caller to interpret.
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, SyncError> {
    with_retry(policy, "calendar", || {
        let cloned = request.try_clone();
        async move {
            let Some(cloned) = cloned else {
                return Err(SyncError::Calendar("request body cannot be replayed".into()));
            };
            let response = match cloned.send().await {
                Ok(response) => response,
                Err(err) => {
                    return Ok(Attempt::Retry {
                        class: FailureClass::Transport,
                        error: SyncError::TransientUpstream {
                            status: None,
                            message: err.to_string(),
                        },
                        retry_after: None,
                    })
                }
            };
            let status = response.status();
            let class = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                FailureClass::RateLimited
            } else if status.is_server_error() {
                FailureClass::ServerError
            } else {
                return Ok(Attempt::Done(response));
            };
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(Attempt::Retry {
                class,
                error: error_from_response(response).await,
                retry_after,
            })
        }
    })
    .await
}

async fn error_from_response(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GoogleErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SyncError::TransientUpstream {
            status: Some(status.as_u16()),
            message,
        }
    } else {
        SyncError::UpstreamClient {
            status: status.as_u16(),
            message,
        }
    }
}

fn is_gone(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE
}

// ============================================================================
// Client
// ============================================================================

pub struct GoogleCalendarClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    policy: RetryPolicy,
}

impl GoogleCalendarClient {
    pub fn new(base_url: &str, access_token: &str, policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            policy,
        }
    }

    /// `{base}/calendars/{calendarId}/events[/{eventId}]`, segments percent-encoded.
    fn events_url(&self, calendar_id: &str, event_id: Option<&str>) -> Result<Url, SyncError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SyncError::Calendar(format!("bad calendar base url: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncError::Calendar("calendar base url cannot be a base".into()))?;
            segments.pop_if_empty().push("calendars").push(calendar_id).push("events");
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    /// Decode a single event. `None` when the provider reports it deleted;
    /// a PATCH against a deleted event still answers 200 with
    /// `status: "cancelled"`.
    async fn read_event(response: reqwest::Response) -> Result<Option<CalendarEvent>, SyncError> {
        let raw: GoogleEventRaw = response
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("calendar event: {}", e)))?;
        if raw.is_cancelled() {
            return Ok(None);
        }
        let id = raw.id.clone();
        raw.into_event()
            .map(Some)
            .ok_or_else(|| SyncError::Decode(format!("calendar event {} has no start", id)))
    }
}

#[async_trait]
impl CalendarService for GoogleCalendarClient {
    async fn create_event(
        &self,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> Result<CalendarEvent, SyncError> {
        let url = self.events_url(calendar_id, None)?;
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&event_body(draft));
        let response = send_with_retry(request, &self.policy).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Self::read_event(response)
            .await?
            .ok_or_else(|| SyncError::Calendar("created event came back cancelled".into()))
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        draft: &EventDraft,
    ) -> Result<Option<CalendarEvent>, SyncError> {
        let url = self.events_url(calendar_id, Some(event_id))?;
        let request = self
            .client
            .patch(url)
            .bearer_auth(&self.access_token)
            .json(&event_body(draft));
        let response = send_with_retry(request, &self.policy).await?;
        if is_gone(response.status()) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Self::read_event(response).await
    }

    async fn get_event(
        &self,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<Option<CalendarEvent>, SyncError> {
        let url = self.events_url(calendar_id, Some(event_id))?;
        let request = self.client.get(url).bearer_auth(&self.access_token);
        let response = send_with_retry(request, &self.policy).await?;
        if is_gone(response.status()) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Self::read_event(response).await
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, SyncError> {
        let url = self.events_url(calendar_id, None)?;
        let time_min = start.to_rfc3339();
        let time_max = end.to_rfc3339();

        let mut all_events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(url.clone())
                .bearer_auth(&self.access_token)
                .query(&[
                    ("timeMin", time_min.as_str()),
                    ("timeMax", time_max.as_str()),
                    ("singleEvents", "true"),
                    ("orderBy", "startTime"),
                    ("maxResults", "250"),
                ]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = send_with_retry(request, &self.policy).await?;
            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }
            let body: EventListResponse = response
                .json()
                .await
                .map_err(|e| SyncError::Decode(format!("calendar event list: {}", e)))?;

            all_events.extend(body.items.into_iter().filter_map(GoogleEventRaw::into_event));

            match body.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        log::debug!(
            "Calendar {}: {} event(s) between {} and {}",
            calendar_id,
            all_events.len(),
            time_min,
            time_max
        );
        Ok(all_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GoogleCalendarClient {
        GoogleCalendarClient::new(
            &server.uri(),
            "cal-token",
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
        )
    }

    fn draft_all_day() -> EventDraft {
        EventDraft {
            title: "[Task] Pay rent".to_string(),
            description: "body".to_string(),
            timing: EventTiming::all_day(NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()),
            time_zone: "UTC".to_string(),
        }
    }

    #[test]
    fn test_event_body_shapes() {
        let body = event_body(&draft_all_day());
        assert_eq!(body["start"]["date"], "2026-05-01");
        assert_eq!(body["end"]["date"], "2026-05-02");
        assert!(body["start"].get("dateTime").is_none());

        let start = DateTime::parse_from_rfc3339("2026-05-01T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let timed = EventDraft {
            timing: EventTiming::Timed {
                start,
                end: start + chrono::Duration::minutes(45),
            },
            time_zone: "Europe/Lisbon".to_string(),
            ..draft_all_day()
        };
        let body = event_body(&timed);
        assert_eq!(body["start"]["timeZone"], "Europe/Lisbon");
        assert_eq!(body["end"]["dateTime"], "2026-05-01T13:15:00+00:00");
    }

    #[tokio::test]
    async fn test_create_event_posts_to_calendar_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendars/me@x.com/events"))
            .and(header("authorization", "Bearer cal-token"))
            .and(body_partial_json(json!({"summary": "[Task] Pay rent"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc",
                "summary": "[Task] Pay rent",
                "htmlLink": "https://calendar/abc",
                "start": {"date": "2026-05-01"},
                "end": {"date": "2026-05-02"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let event = client(&server)
            .create_event("me@x.com", &draft_all_day())
            .await
            .unwrap();
        assert_eq!(event.id, "abc");
        assert!(event.timing.is_all_day());
        assert_eq!(event.html_link.as_deref(), Some("https://calendar/abc"));
    }

    #[tokio::test]
    async fn test_update_missing_event_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/calendars/primary/events/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "message": "Not Found"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let updated = client(&server)
            .update_event("primary", "gone", &draft_all_day())
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_update_of_cancelled_event_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/calendars/primary/events/old"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "old", "status": "cancelled"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let updated = client(&server)
            .update_event("primary", "old", &draft_all_day())
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_with_provider_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": {"code": 503, "message": "Backend Error"}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server)
            .create_event("primary", &draft_all_day())
            .await
            .unwrap_err();
        match err {
            SyncError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("Backend Error"), "{}", last_error);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_events_follows_page_tokens_and_drops_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "b", "summary": "B", "start": {"dateTime": "2026-05-02T09:00:00-03:00"},
                     "end": {"dateTime": "2026-05-02T10:00:00-03:00"}},
                    {"id": "c", "status": "cancelled"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(query_param("singleEvents", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "a", "summary": "A", "start": {"date": "2026-05-01"}}],
                "nextPageToken": "p2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let start = Utc::now();
        let events = client(&server)
            .list_events("primary", start, start + chrono::Duration::days(30))
            .await
            .unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        match &events[1].timing {
            EventTiming::Timed { start, .. } => {
                assert_eq!(start.to_rfc3339(), "2026-05-02T12:00:00+00:00")
            }
            other => panic!("expected timed event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events/abc"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc", "summary": "A", "start": {"date": "2026-05-01"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let event = client(&server).get_event("primary", "abc").await.unwrap();
        assert_eq!(event.map(|e| e.id), Some("abc".to_string()));
    }

    #[tokio::test]
    async fn test_client_error_surfaces_google_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": 403, "message": "Insufficient Permission"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .create_event("primary", &draft_all_day())
            .await
            .unwrap_err();
        match err {
            SyncError::UpstreamClient { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Insufficient Permission");
            }
            other => panic!("expected UpstreamClient, got {:?}", other),
        }
    }
}
