//! Command-line interface definition for Threadline
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to serve the HTTP API, ask a one-off question,
//! watch a conversation live and run a recovery sweep.

use clap::{Parser, Subcommand};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/threadline.yaml";

/// Threadline - chat backend with crash-safe streaming generation
///
/// Assistant answers are persisted fragment by fragment while they are
/// generated, so readers can follow them live and nothing is lost on a crash.
#[derive(Parser, Debug, Clone)]
#[command(name = "threadline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: Option<String>,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    pub storage_path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Threadline
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP API and the background recovery sweep
    Serve {
        /// Address to listen on (overrides server.bind_address)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Send one message and print the answer as it streams
    Ask {
        /// Continue an existing conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,

        /// Requester identity
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Message text
        message: String,
    },

    /// Follow a conversation's messages live
    Watch {
        /// Conversation to follow
        #[arg(long)]
        conversation: String,

        /// Requester identity
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Finalize orphaned in-flight messages left behind by a crash
    Recover {
        /// Only finalize messages untouched for at least this many seconds
        #[arg(long, default_value_t = 0)]
        min_age_seconds: u64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Configuration file path, falling back to the default location
    pub fn config_path(&self) -> &str {
        self.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH)
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some(DEFAULT_CONFIG_PATH.to_string()),
            storage_path: None,
            verbose: false,
            json_logs: false,
            command: Commands::Recover { min_age_seconds: 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config_path(), DEFAULT_CONFIG_PATH);
        assert!(!cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Recover { min_age_seconds: 0 }
        ));
    }

    #[test]
    fn test_cli_parse_serve_with_bind() {
        let cli = Cli::try_parse_from(["threadline", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Serve { bind } => assert_eq!(bind.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("Expected Serve, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_ask() {
        let cli = Cli::try_parse_from(["threadline", "ask", "hello there"]).unwrap();
        match cli.command {
            Commands::Ask {
                conversation,
                user,
                message,
            } => {
                assert!(conversation.is_none());
                assert_eq!(user, "local");
                assert_eq!(message, "hello there");
            }
            other => panic!("Expected Ask, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_ask_requires_message() {
        assert!(Cli::try_parse_from(["threadline", "ask"]).is_err());
    }

    #[test]
    fn test_cli_parse_watch_requires_conversation() {
        assert!(Cli::try_parse_from(["threadline", "watch"]).is_err());
        let cli =
            Cli::try_parse_from(["threadline", "watch", "--conversation", "01ABC", "-u", "bob"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Watch { ref conversation, ref user } if conversation == "01ABC" && user == "bob"
        ));
    }

    #[test]
    fn test_cli_parse_recover_min_age() {
        let cli = Cli::try_parse_from(["threadline", "recover", "--min-age-seconds", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Recover {
                min_age_seconds: 30
            }
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "threadline",
            "recover",
            "--verbose",
            "--json-logs",
            "--storage-path",
            "/tmp/t.db",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.storage_path.as_deref(), Some("/tmp/t.db"));
    }
}
