//! REST client for the tracker's view-tasks endpoint.
//!
//! `GET {base}/view/{view_id}/task?page=N&include_closed=bool`, pages start
//! at 0 and the provider signals the end with an empty page. Auth is the
//! raw API token in the `Authorization` header.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::TrackerConfig;
use crate::db::MirrorAssignee;
use crate::error::SyncError;
use crate::retry::{with_retry, Attempt, FailureClass, RetryPolicy};

/// A tracker task, normalized from the provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTask {
    pub id: String,
    pub url: String,
    pub name: String,
    pub status: String,
    pub priority: Option<String>,
    pub assignees: Vec<MirrorAssignee>,
    pub tags: Vec<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub date_created: Option<DateTime<Utc>>,
    pub date_updated: Option<DateTime<Utc>>,
    pub list_id: Option<String>,
    pub folder_id: Option<String>,
    pub space_id: Option<String>,
}

impl ExternalTask {
    /// A minimal task; handy for callers building fixtures by hand.
    pub fn new(id: &str, name: &str, status: &str) -> Self {
        Self {
            id: id.to_string(),
            url: String::new(),
            name: name.to_string(),
            status: status.to_string(),
            priority: None,
            assignees: Vec::new(),
            tags: Vec::new(),
            due_at: None,
            start_at: None,
            date_created: None,
            date_updated: None,
            list_id: None,
            folder_id: None,
            space_id: None,
        }
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_at.map(|d| d.date_naive())
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.start_at.map(|d| d.date_naive())
    }
}

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TaskPage {
    #[serde(default)]
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<RawStatus>,
    #[serde(default)]
    priority: Option<RawPriority>,
    #[serde(default)]
    assignees: Vec<RawAssignee>,
    #[serde(default)]
    tags: Vec<RawTag>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    due_date: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    start_date: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    date_created: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    date_updated: Option<String>,
    #[serde(default)]
    list: Option<RawRef>,
    #[serde(default)]
    folder: Option<RawRef>,
    #[serde(default)]
    space: Option<RawRef>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawPriority {
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAssignee {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    id: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    err: Option<String>,
    #[serde(default, rename = "ECODE")]
    ecode: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Ok(None),
    }
}

/// Provider timestamps are unix milliseconds, as strings.
fn parse_millis(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

impl From<RawTask> for ExternalTask {
    fn from(raw: RawTask) -> Self {
        ExternalTask {
            id: raw.id,
            url: raw.url.unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
            status: raw.status.map(|s| s.status).unwrap_or_default(),
            priority: raw
                .priority
                .and_then(|p| p.priority)
                .filter(|p| !p.is_empty()),
            assignees: raw
                .assignees
                .into_iter()
                .map(|a| MirrorAssignee {
                    id: a.id,
                    username: a.username.filter(|u| !u.is_empty()),
                    email: a.email.filter(|e| !e.is_empty()),
                })
                .collect(),
            tags: raw
                .tags
                .into_iter()
                .map(|t| t.name)
                .filter(|t| !t.is_empty())
                .collect(),
            due_at: parse_millis(raw.due_date.as_deref()),
            start_at: parse_millis(raw.start_date.as_deref()),
            date_created: parse_millis(raw.date_created.as_deref()),
            date_updated: parse_millis(raw.date_updated.as_deref()),
            list_id: raw.list.and_then(|r| r.id),
            folder_id: raw.folder.and_then(|r| r.id),
            space_id: raw.space.and_then(|r| r.id),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct TrackerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
    max_pages: u32,
}

impl TrackerClient {
    pub fn new(config: &TrackerConfig, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            policy: config.retry.clone(),
            max_pages: config.max_pages.max(1),
        }
    }

    /// Fetch every task behind a view.
    ///
    /// Either the complete set is returned or an error; pages fetched before
    /// a terminal failure are dropped.
    pub async fn fetch_all(
        &self,
        view_id: &str,
        include_closed: bool,
    ) -> Result<Vec<ExternalTask>, SyncError> {
        if self.api_key.trim().is_empty() {
            return Err(SyncError::MissingCredential("tracker API token".to_string()));
        }
        if view_id.trim().is_empty() {
            return Err(SyncError::UpstreamClient {
                status: 400,
                message: "no tracker view configured".to_string(),
            });
        }

        let mut all = Vec::new();
        for page in 0..self.max_pages {
            let tasks = self.fetch_page(view_id, include_closed, page).await?;
            if tasks.is_empty() {
                log::info!(
                    "Tracker fetch: view {} complete after {} page(s), {} task(s)",
                    view_id,
                    page,
                    all.len()
                );
                return Ok(all);
            }
            log::debug!("Tracker fetch: page {} returned {} task(s)", page, tasks.len());
            all.extend(tasks);
        }

        log::warn!(
            "Tracker fetch: hit page ceiling ({}) for view {}, stopping with {} task(s)",
            self.max_pages,
            view_id,
            all.len()
        );
        Ok(all)
    }

    async fn fetch_page(
        &self,
        view_id: &str,
        include_closed: bool,
        page: u32,
    ) -> Result<Vec<ExternalTask>, SyncError> {
        let url = format!("{}/view/{}/task", self.base_url, view_id);
        let query = [
            ("page", page.to_string()),
            ("include_closed", include_closed.to_string()),
        ];
        let body = self.get_with_retry(&url, &query).await?;
        let parsed: TaskPage = serde_json::from_str(&body)
            .map_err(|e| SyncError::Decode(format!("tracker page {}: {}", page, e)))?;
        Ok(parsed.tasks.into_iter().map(ExternalTask::from).collect())
    }

    /// GET with the bounded retry policy. Returns the body of a 2xx response.
    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, SyncError> {
        with_retry(&self.policy, "tracker", || {
            let sent = self
                .client
                .get(url)
                .header(reqwest::header::AUTHORIZATION, self.api_key.as_str())
                .query(query)
                .send();
            async move { classify(sent.await).await }
        })
        .await
    }
}

/// Sort one response into a body, a retryable failure, or a terminal error.
async fn classify(
    sent: Result<reqwest::Response, reqwest::Error>,
) -> Result<Attempt<String>, SyncError> {
    let resp = match sent {
        Ok(resp) => resp,
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

    let status = resp.status();
    if status.is_success() {
        return Ok(match resp.text().await {
            Ok(body) => Attempt::Done(body),
            Err(e) => Attempt::Retry {
                class: FailureClass::Transport,
                error: SyncError::TransientUpstream {
                    status: Some(status.as_u16()),
                    message: format!("failed to read body: {}", e),
                },
                retry_after: None,
            },
        });
    }

    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let text = resp.text().await.unwrap_or_default();
    let class = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        FailureClass::RateLimited
    } else if status.is_server_error() {
        FailureClass::ServerError
    } else {
        return Err(SyncError::UpstreamClient {
            status: status.as_u16(),
            message: provider_message(&text),
        });
    };
    Ok(Attempt::Retry {
        class,
        error: SyncError::TransientUpstream {
            status: Some(status.as_u16()),
            message: provider_message(&text),
        },
        retry_after: (class == FailureClass::RateLimited)
            .then_some(retry_after)
            .flatten(),
    })
}

/// Prefer the provider's `err` field; fall back to the raw body.
fn provider_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { err: Some(err), ecode }) => match ecode {
            Some(code) => format!("{} ({})", err, code),
            None => err,
        },
        _ => body.chars().take(500).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str, max_attempts: u32) -> TrackerConfig {
        TrackerConfig {
            enabled: true,
            base_url: base_url.to_string(),
            view_id: "v1".to_string(),
            max_pages: 10,
            retry: RetryPolicy {
                max_attempts,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..TrackerConfig::default()
        }
    }

    fn page_of(ids: &[&str]) -> serde_json::Value {
        let tasks: Vec<_> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "name": format!("Task {}", id),
                    "url": format!("https://tracker.example/t/{}", id),
                    "status": {"status": "to do"},
                    "priority": null,
                    "assignees": [],
                    "tags": []
                })
            })
            .collect();
        json!({ "tasks": tasks })
    }

    #[test]
    fn test_raw_task_normalization() {
        let raw = json!({
            "id": "T1",
            "name": "Ship it",
            "url": "https://tracker.example/t/T1",
            "status": {"status": "in progress", "color": "#fff"},
            "priority": {"priority": "urgent", "color": "red"},
            "assignees": [{"id": 42, "username": "ann", "email": "a@x.com"}],
            "tags": [{"name": "ops"}],
            "due_date": "1767312000000",
            "start_date": null,
            "date_created": "1767225600000",
            "date_updated": 1767225600000i64,
            "list": {"id": "L1"},
            "folder": {"id": "F1"},
            "space": {"id": 7}
        });
        let task: ExternalTask = serde_json::from_value::<RawTask>(raw).unwrap().into();
        assert_eq!(task.id, "T1");
        assert_eq!(task.status, "in progress");
        assert_eq!(task.priority.as_deref(), Some("urgent"));
        assert_eq!(task.assignees[0].id.as_deref(), Some("42"));
        assert_eq!(task.assignees[0].email.as_deref(), Some("a@x.com"));
        assert_eq!(task.tags, vec!["ops".to_string()]);
        assert_eq!(task.due_date(), NaiveDate::from_ymd_opt(2026, 1, 2));
        assert!(task.start_at.is_none());
        assert!(task.date_updated.is_some());
        assert_eq!(task.space_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_provider_message_prefers_err_field() {
        assert_eq!(
            provider_message(r#"{"err":"Token invalid","ECODE":"OAUTH_025"}"#),
            "Token invalid (OAUTH_025)"
        );
        assert_eq!(provider_message("plain text"), "plain text");
    }

    #[tokio::test]
    async fn test_fetch_all_walks_pages_until_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "0"))
            .and(query_param("include_closed", "true"))
            .and(header("authorization", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&["A", "B"])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&["C"])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&[])))
            .expect(1)
            .mount(&server)
            .await;

        let client = TrackerClient::new(&config(&server.uri(), 3), "tok");
        let tasks = client.fetch_all("v1", true).await.unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_fetch_all_stops_at_page_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&["X"])))
            .expect(3)
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri(), 3);
        cfg.max_pages = 3;
        let client = TrackerClient::new(&cfg, "tok");
        let tasks = client.fetch_all("v1", true).await.unwrap();
        assert_eq!(tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_fails_after_exactly_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({"err": "Rate limit"})))
            .expect(4)
            .mount(&server)
            .await;

        let client = TrackerClient::new(&config(&server.uri(), 4), "tok");
        let err = client.fetch_all("v1", true).await.unwrap_err();
        match err {
            SyncError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("Rate limit"), "{}", last_error);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        // `expect(4)` is verified when the server drops.
    }

    #[tokio::test]
    async fn test_server_error_recovers_within_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&["A"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&[])))
            .mount(&server)
            .await;

        let client = TrackerClient::new(&config(&server.uri(), 3), "tok");
        let tasks = client.fetch_all("v1", true).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"err": "Token invalid", "ECODE": "OAUTH_025"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = TrackerClient::new(&config(&server.uri(), 5), "tok");
        let err = client.fetch_all("v1", true).await.unwrap_err();
        match err {
            SyncError::UpstreamClient { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Token invalid (OAUTH_025)");
            }
            other => panic!("expected UpstreamClient, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_mid_pagination_discards_partial_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_of(&["A"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/view/v1/task"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TrackerClient::new(&config(&server.uri(), 2), "tok");
        assert!(matches!(
            client.fetch_all("v1", true).await,
            Err(SyncError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    /// Serve canned raw HTTP responses, one connection each, in order.
    fn raw_server(responses: Vec<&'static str>) -> (String, std::thread::JoinHandle<usize>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut served = 0;
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                stream.write_all(response.as_bytes()).unwrap();
                served += 1;
            }
            served
        });
        (base, handle)
    }

    #[tokio::test]
    async fn test_truncated_body_is_retried_as_transport_failure() {
        let (base, handle) = raw_server(vec![
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{\"tasks\"",
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 12\r\nConnection: close\r\n\r\n{\"tasks\":[]}",
        ]);

        let client = TrackerClient::new(&config(&base, 3), "tok");
        let tasks = client.fetch_all("v1", true).await.unwrap();
        assert!(tasks.is_empty());
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_token_is_fatal_before_any_request() {
        let client = TrackerClient::new(&config("http://127.0.0.1:9", 3), "  ");
        assert!(matches!(
            client.fetch_all("v1", true).await,
            Err(SyncError::MissingCredential(_))
        ));
    }
}
