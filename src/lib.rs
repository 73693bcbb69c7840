//! Task sync engine.
//!
//! Mirrors a third-party tracker view into local tasks, keeps tasks and
//! calendar events in step, and expands recurring task templates into dated
//! instances. `commands` is the public surface; `orchestrator` sequences a
//! full run.

pub mod calendar;
pub mod commands;
pub mod db;
pub mod error;
mod migrations;
pub mod orchestrator;
pub mod recurrence;
pub mod retry;
pub mod services;
pub mod state;
pub mod tracker;
pub mod types;
