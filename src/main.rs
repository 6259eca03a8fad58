//! Threadline - chat backend with crash-safe streaming generation
//!
#![doc = "Threadline - chat backend with crash-safe streaming generation"]
#![doc = "Main entry point for the threadline binary."]

use anyhow::Result;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use threadline::cli::{Cli, Commands};
use threadline::commands;
use threadline::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config = Config::load(cli.config_path(), &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!("Starting server");
            commands::serve::run_serve(config).await
        }
        Commands::Ask {
            conversation,
            user,
            message,
        } => {
            if let Some(id) = &conversation {
                tracing::debug!("Continuing conversation: {}", id);
            }
            commands::ask::run_ask(config, conversation, user, message).await?;
            Ok(())
        }
        Commands::Watch { conversation, user } => {
            tracing::info!("Watching conversation {}", conversation);
            commands::watch::run_watch(config, conversation, user).await
        }
        Commands::Recover { min_age_seconds } => {
            commands::recover::run_recover(config, Duration::from_secs(min_age_seconds))?;
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose {
        "threadline=debug"
    } else {
        "threadline=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries command output.
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
