//! Business logic shared by the command surface and the CLI.

pub mod session;
pub mod tasks;
