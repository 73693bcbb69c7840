//! Background sync poller.
//!
//! Sleeps through a startup delay, then runs the orchestrator every
//! `pollIntervalMinutes`. `AppState::sync_wake` cuts any wait short. A run
//! with the tracker disabled still materializes and syncs calendars.

use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

const STARTUP_DELAY: Duration = Duration::from_secs(60);

pub async fn run_sync_poller(state: Arc<AppState>) {
    tokio::select! {
        _ = tokio::time::sleep(STARTUP_DELAY) => {},
        _ = state.sync_wake.notified() => {
            log::info!("Sync poller: woken during startup delay");
        },
    }

    loop {
        match crate::orchestrator::run_sync(&state).await {
            Ok(summary) => log::info!(
                "Sync poller: run complete, {} fetched, {} synced, {} error(s)",
                summary.fetched,
                summary.synced,
                summary.errors
            ),
            Err(e) => log::warn!("Sync poller: run failed: {}", e),
        }

        let poll_interval = state.config.read().tracker.poll_interval_minutes;

        // Sleep until next poll or manual wake
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(u64::from(poll_interval.max(1)) * 60)) => {},
            _ = state.sync_wake.notified() => {
                log::info!("Sync poller: woken by manual sync signal");
            },
        }
    }
}
