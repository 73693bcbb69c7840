//! Sync orchestrator.
//!
//! One run walks `Fetching -> Reconciling -> Projecting -> Materializing ->
//! CalendarSync -> Done`. A fetch or reconcile failure ends the run as
//! `Failed` and leaves the mirror untouched by this run. Failures in the
//! later stages are counted in the summary; the run still succeeds and
//! nothing is rolled back, since every stage is idempotent and the next run
//! converges.
//!
//! The timer loop and manual triggers share `run_sync`. Runs may overlap;
//! there is no lock.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::CalendarBridge;
use crate::db::sync_log::TRACKER_RUN_ID;
use crate::db::{ExternalMirrorRecord, SyncDb, SyncRunStatus};
use crate::error::SyncError;
use crate::recurrence;
use crate::state::AppState;
use crate::tracker::client::TrackerClient;
use crate::tracker::projection::{internal_status, project_into_internal_tasks, resolve_owner};
use crate::tracker::sync::reconcile;
use crate::tracker::TrackerConfig;
use crate::types::{Config, RunStage, SyncSummary, TaskStatus};

/// Owner key used for run-level sync log entries.
const RUN_LOG_OWNER: &str = "system";

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

struct Run {
    started: Instant,
    now: DateTime<Utc>,
    stage: RunStage,
    summary: SyncSummary,
}

impl Run {
    fn begin() -> Self {
        log::info!("Sync run: starting");
        Self {
            started: Instant::now(),
            now: Utc::now(),
            stage: RunStage::Fetching,
            summary: SyncSummary::default(),
        }
    }

    fn enter(&mut self, stage: RunStage) {
        log::info!("Sync run: {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Persist the outcome and write the run's sync log line.
    fn finish(mut self, db: &SyncDb, error: Option<&SyncError>) -> SyncSummary {
        let failed_at = self.stage;
        let success = error.is_none();
        self.enter(if success { RunStage::Done } else { RunStage::Failed });

        let status = SyncRunStatus {
            id: TRACKER_RUN_ID.to_string(),
            last_run_at: self.now,
            success,
            stage: self.stage,
            summary: success.then(|| self.summary.clone()),
            error: error.map(|e| format!("{:?}: {}", failed_at, e)),
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        if let Err(e) = db.save_run_status(&status) {
            log::warn!("Sync run: failed to persist run status: {}", e);
        }

        let message = match error {
            None => format!(
                "fetched={} inserted={} updated={} outOfView={} synced={} skipped={} materialized={} calendar={} errors={}",
                self.summary.fetched,
                self.summary.inserted,
                self.summary.updated,
                self.summary.out_of_view,
                self.summary.synced,
                self.summary.skipped,
                self.summary.materialized,
                self.summary.calendar_synced,
                self.summary.errors
            ),
            Some(e) => e.to_string(),
        };
        db.log_sync(
            RUN_LOG_OWNER,
            "TRACKER",
            "run",
            None,
            None,
            if success { "SUCCESS" } else { "ERROR" },
            &message,
        );
        log::info!(
            "Sync run: finished in {}ms ({})",
            status.duration_ms,
            message
        );
        self.summary
    }
}

/// Run every stage once.
pub async fn run_sync(state: &AppState) -> Result<SyncSummary, SyncError> {
    let config = state.config();
    let db = &state.db;
    let mut run = Run::begin();

    if config.tracker.enabled {
        let fetched = match fetch(state, &config).await {
            Ok(tasks) => tasks,
            Err(e) => {
                log::warn!("Sync run: fetch failed: {}", e);
                run.finish(db, Some(&e));
                return Err(e);
            }
        };
        run.summary.fetched = fetched.len();

        run.enter(RunStage::Reconciling);
        match reconcile(db, &fetched, run.now) {
            Ok(outcome) => {
                run.summary.inserted = outcome.inserted;
                run.summary.updated = outcome.updated;
                run.summary.out_of_view = outcome.out_of_view;
            }
            Err(e) => {
                let e = SyncError::from(e);
                log::warn!("Sync run: reconciliation failed: {}", e);
                run.finish(db, Some(&e));
                return Err(e);
            }
        }

        run.enter(RunStage::Projecting);
        match project_into_internal_tasks(db, &config.tracker, None, run.now) {
            Ok(outcome) => {
                run.summary.synced = outcome.synced();
                run.summary.skipped = outcome.skipped;
                if outcome.errors > 0 {
                    run.summary.errors += outcome.errors;
                    run.summary.last_error = outcome.last_error;
                }
            }
            Err(e) => {
                log::warn!("Sync run: projection failed: {}", e);
                run.summary.record_error(format!("projection: {}", e));
            }
        }
    } else {
        log::info!("Sync run: tracker disabled, skipping fetch");
    }

    run.enter(RunStage::Materializing);
    materialize_all(db, &config, &mut run.summary);

    run.enter(RunStage::CalendarSync);
    sync_calendars(state, &config, run.now, &mut run.summary).await;

    Ok(run.finish(db, None))
}

async fn fetch(
    state: &AppState,
    config: &Config,
) -> Result<Vec<crate::tracker::client::ExternalTask>, SyncError> {
    let token = state
        .context
        .tracker_token
        .as_deref()
        .ok_or_else(|| SyncError::MissingCredential("tracker API token".to_string()))?;
    let client = TrackerClient::new(&config.tracker, token);
    client
        .fetch_all(&config.tracker.view_id, config.tracker.include_closed)
        .await
}

fn materialize_all(db: &SyncDb, config: &Config, summary: &mut SyncSummary) {
    let users = match db.list_users() {
        Ok(users) => users,
        Err(e) => {
            log::warn!("Sync run: could not list users for materialization: {}", e);
            summary.record_error(format!("materialization: {}", e));
            return;
        }
    };
    for user in users {
        match recurrence::materialize_for_owner(
            db,
            &user.user_key,
            config.recurrence.session_horizon_days,
        ) {
            Ok(outcome) => {
                summary.materialized += outcome.created;
                if outcome.failed > 0 {
                    summary.errors += outcome.failed;
                    summary.last_error = outcome.last_error;
                }
            }
            Err(e) => {
                log::warn!("Sync run: materialization for {} failed: {}", user.user_key, e);
                summary.record_error(format!("materialization for {}: {}", user.user_key, e));
            }
        }
    }
}

async fn sync_calendars(
    state: &AppState,
    config: &Config,
    now: DateTime<Utc>,
    summary: &mut SyncSummary,
) {
    let owners = match state.db.list_sync_enabled_settings() {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Sync run: could not list calendar settings: {}", e);
            summary.record_error(format!("calendar: {}", e));
            return;
        }
    };
    if owners.is_empty() {
        return;
    }
    let bridge: CalendarBridge = match state.bridge() {
        Ok(bridge) => bridge,
        Err(e) => {
            log::warn!(
                "Sync run: {} owner(s) have calendar sync on but {}",
                owners.len(),
                e
            );
            summary.record_error(format!("calendar: {}", e));
            return;
        }
    };

    for settings in owners {
        match bridge
            .sync_calendar(&settings.user_key, None, config.calendar.window(), now)
            .await
        {
            Ok(result) => {
                summary.calendar_synced += result.synced();
                let errors = result.errors();
                if errors > 0 {
                    summary.errors += errors;
                    summary.last_error = result
                        .import_error
                        .clone()
                        .or_else(|| Some(format!("calendar sync for {}", settings.user_key)));
                }
            }
            Err(e) => {
                log::warn!("Sync run: calendar sync for {} failed: {}", settings.user_key, e);
                summary.record_error(format!("calendar for {}: {}", settings.user_key, e));
            }
        }
    }
}

/// Last persisted run, if any run has happened.
pub fn get_sync_status(db: &SyncDb) -> Result<Option<SyncRunStatus>, SyncError> {
    Ok(db.get_run_status()?)
}

// =============================================================================
// Mirror listing
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorQuery {
    #[serde(default)]
    pub query: Option<String>,
    /// `open`, `doing` or `done`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub include_out_of_view: bool,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredTask {
    #[serde(flatten)]
    pub record: ExternalMirrorRecord,
    /// Owner the row projects to.
    pub owner: String,
    pub internal_status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorPage {
    pub items: Vec<MirroredTask>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

fn matches_text(row: &ExternalMirrorRecord, needle: &str) -> bool {
    let hit = |s: &str| s.to_lowercase().contains(needle);
    hit(&row.name)
        || hit(&row.id)
        || row.tags.iter().any(|t| hit(t))
        || row.assignees.iter().any(|a| {
            a.email.as_deref().is_some_and(hit) || a.username.as_deref().is_some_and(hit)
        })
}

/// Filtered, paged view of the mirror, sorted by name.
pub fn list_mirrored_tasks(
    db: &SyncDb,
    tracker: &TrackerConfig,
    params: &MirrorQuery,
) -> Result<MirrorPage, SyncError> {
    let bucket = match params.status.as_deref().map(|s| s.trim().to_lowercase()) {
        None => None,
        Some(s) if s.is_empty() => None,
        Some(s) => match s.as_str() {
            "open" => Some(TaskStatus::Open),
            "doing" => Some(TaskStatus::Doing),
            "done" => Some(TaskStatus::Done),
            _ => {
                return Err(SyncError::Invalid(format!(
                    "status must be open, doing or done, got {}",
                    s
                )))
            }
        },
    };
    let needle = params
        .query
        .as_deref()
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());
    let owner = params
        .owner
        .as_deref()
        .map(|o| o.trim().to_lowercase())
        .filter(|o| !o.is_empty());
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let mut items: Vec<MirroredTask> = db
        .list_mirror()?
        .into_iter()
        .filter(|row| params.include_out_of_view || !row.out_of_view)
        .filter(|row| needle.as_deref().map_or(true, |n| matches_text(row, n)))
        .map(|record| MirroredTask {
            owner: resolve_owner(&record, tracker),
            internal_status: internal_status(&record.status),
            record,
        })
        .filter(|item| bucket.as_ref().map_or(true, |b| &item.internal_status == b))
        .filter(|item| {
            owner
                .as_deref()
                .map_or(true, |o| item.owner.to_lowercase() == o)
        })
        .collect();
    items.sort_by(|a, b| {
        a.record
            .name
            .to_lowercase()
            .cmp(&b.record.name.to_lowercase())
            .then_with(|| a.record.id.cmp(&b.record.id))
    });

    let total = items.len();
    let offset = (page as usize - 1).saturating_mul(page_size as usize);
    let items = items
        .into_iter()
        .skip(offset)
        .take(page_size as usize)
        .collect();
    Ok(MirrorPage {
        items,
        total,
        page,
        page_size,
    })
}
