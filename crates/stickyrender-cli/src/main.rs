//! stickyrender - sticky render adaptor
//!
//! # Subcommands
//!
//! - `run`    - One-shot session: init, start, every task, stop, cleanup
//! - `daemon` - Background session controlled over a local socket
//! - `client` - Command channel stub, run inside the hosted application

use clap::Parser;
use std::io::IsTerminal;
use std::path::Path;
use stickyrender_core::config::LOG_LEVEL_ENV;
use stickyrender_core::AdaptorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod commands;
mod control;

use cli::{Cli, Commands, DaemonCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => commands::run::run(setup(config_path)?, args).await,
        Commands::Daemon(daemon) => {
            let config = setup(config_path)?;
            match daemon.command {
                DaemonCommands::Start(args) => commands::daemon::start(config_path, args).await,
                DaemonCommands::Serve(args) => commands::daemon::serve(config, args).await,
                DaemonCommands::Run(args) => commands::daemon::run(args).await,
                DaemonCommands::Cancel(args) => commands::daemon::cancel(args).await,
                DaemonCommands::Stop(args) => commands::daemon::stop(args).await,
            }
        }
        Commands::Client(args) => {
            // Shares the hosted application's stdout with the output monitor,
            // so no config and stderr-only logging.
            init_logging(&std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "warn".to_string()));
            commands::client::run(args).await
        }
    }
}

fn setup(config_path: Option<&Path>) -> anyhow::Result<AdaptorConfig> {
    let config = AdaptorConfig::load(config_path)?;
    init_logging(&config.log_level);
    Ok(config)
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr; stdout
/// carries the scheduler status lines.
fn init_logging(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .init();
}
