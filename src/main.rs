//! routine-sync command line.
//!
//! Usage:
//!   routine-sync serve             run the background sync loop
//!   routine-sync sync              run one sync now, print the summary
//!   routine-sync status            print the last run
//!   routine-sync session <owner>   start a session (materialize recurring tasks)
//!   routine-sync calendar <owner>  run one calendar sync for an owner

use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;

use routine_sync_lib::commands;
use routine_sync_lib::error::ApiResponse;
use routine_sync_lib::state::{load_config, AppState, EnvSecretStore};
use routine_sync_lib::tracker::poller::run_sync_poller;

const USAGE: &str = "usage: routine-sync <serve|sync|status|session <owner>|calendar <owner>>";

fn print<T: Serialize>(response: &ApiResponse<T>) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.ok)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        bail!(USAGE);
    };
    let owner_arg = || {
        args.get(1)
            .map(String::as_str)
            .with_context(|| format!("{} needs an owner\n{}", command, USAGE))
    };

    let config = load_config().context("Failed to load routine-sync config")?;
    let state = Arc::new(
        AppState::new(config, &EnvSecretStore).context("Failed to open routine-sync state")?,
    );

    let ok = match command {
        "serve" => {
            log::info!("Starting sync poller");
            run_sync_poller(state).await;
            true
        }
        "sync" => print(&commands::trigger_sync(&state).await)?,
        "status" => print(&commands::get_sync_status(&state))?,
        "session" => print(&commands::start_session(&state, owner_arg()?))?,
        "calendar" => print(&commands::sync_calendar(&state, owner_arg()?, None, None).await)?,
        other => bail!("unknown command {}\n{}", other, USAGE),
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
