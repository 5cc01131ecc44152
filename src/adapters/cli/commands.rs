//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "botfleet", about = "Multi-bot futures trading orchestrator", version)]
pub struct CliApp {
    /// Info-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug-level logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the configured bots until interrupted
    Run(RunCmd),
    /// Show account balance and runtime status of each bot
    Status(StatusCmd),
    /// List configured bots and their lifetime stats
    Bots(BotsCmd),
    /// Validate the configuration file and exit
    ValidateConfig(ValidateCmd),
}

#[derive(Debug, Args)]
pub struct RunCmd {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    /// Paper trading mode - orders never leave the process
    #[arg(long)]
    pub paper: bool,
}

#[derive(Debug, Args)]
pub struct StatusCmd {
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Debug, Args)]
pub struct BotsCmd {
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Debug, Args)]
pub struct ValidateCmd {
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_paper() {
        let app = CliApp::parse_from(["botfleet", "run", "--paper", "-c", "my.toml"]);
        match app.command {
            Command::Run(cmd) => {
                assert!(cmd.paper);
                assert_eq!(cmd.config, "my.toml");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_status_defaults() {
        let app = CliApp::parse_from(["botfleet", "status"]);
        match app.command {
            Command::Status(cmd) => assert_eq!(cmd.config, "config.toml"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_verbose_flag() {
        let app = CliApp::parse_from(["botfleet", "-v", "bots"]);
        assert!(app.verbose);
    }
}
