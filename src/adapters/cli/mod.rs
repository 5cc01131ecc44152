//! CLI adapter.

mod commands;

pub use commands::{BotsCmd, CliApp, Command, RunCmd, StatusCmd, ValidateCmd};
