use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "herald",
    about = "Chat-platform command gateway with a sandboxed script runner",
    version
)]
pub struct Cli {
    /// Path to the herald TOML configuration file.
    #[arg(long, env = "HERALD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Serve inbound chat events as newline-delimited JSON until EOF.
    Serve {
        /// Overrides the configured state directory.
        #[arg(long, env = "HERALD_STATE_DIR")]
        state_dir: Option<PathBuf>,
        /// Event source: a file path, or '-' for stdin.
        #[arg(long, default_value = "-")]
        events: String,
    },
    /// Validate the configuration and report the effective settings.
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::{Cli, CliCommand};
    use clap::Parser;

    #[test]
    fn unit_serve_defaults_to_stdin_events() {
        let cli = Cli::try_parse_from(["herald", "serve"]).expect("parse");
        match cli.command {
            CliCommand::Serve { events, state_dir } => {
                assert_eq!(events, "-");
                assert_eq!(state_dir, None);
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn unit_flags_are_accepted_in_any_position() {
        let cli = Cli::try_parse_from([
            "herald",
            "serve",
            "--events",
            "events.ndjson",
            "--config",
            "herald.toml",
        ])
        .expect("parse");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("herald.toml")));
        match cli.command {
            CliCommand::Serve { events, .. } => assert_eq!(events, "events.ndjson"),
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn unit_check_config_subcommand_parses() {
        let cli = Cli::try_parse_from(["herald", "check-config"]).expect("parse");
        assert!(matches!(cli.command, CliCommand::CheckConfig));
    }
}
