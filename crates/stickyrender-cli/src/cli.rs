//! CLI argument types
//!
//! Each subcommand maps to a module in [`crate::commands`].

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Keep a 3D application resident across render tasks
#[derive(Parser, Debug)]
#[command(name = "stickyrender", version, about)]
pub struct Cli {
    /// Adaptor config file (default: <config dir>/stickyrender/adaptor.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a whole session in one process: init, start, every task, stop, cleanup
    Run(RunArgs),
    /// Keep a session alive in the background and feed it tasks
    Daemon(DaemonArgs),
    /// Serve the command channel from inside the hosted application
    Client(ClientArgs),
}

/// Arguments for the `run` subcommand
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Init data as JSON, or @file
    #[arg(long)]
    pub init_data: String,

    /// Run data as JSON, or @file; repeat for several tasks
    #[arg(long = "run-data")]
    pub run_data: Vec<String>,

    /// Path mapping rules as JSON, or @file
    #[arg(long)]
    pub path_mapping: Option<String>,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommands,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Launch `daemon serve` in the background and wait until it is ready
    Start(DaemonStartArgs),
    /// Initialise, start and serve control requests in the foreground
    Serve(DaemonServeArgs),
    /// Run one task on a running daemon
    Run(DaemonRunArgs),
    /// Cancel the task currently running on a daemon
    Cancel(DaemonTargetArgs),
    /// Stop and clean up a running daemon
    Stop(DaemonStopArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DaemonServeArgs {
    /// Where to write the connection-info record
    #[arg(long)]
    pub connection_file: PathBuf,

    /// Init data as JSON, or @file
    #[arg(long)]
    pub init_data: String,

    /// Path mapping rules as JSON, or @file
    #[arg(long)]
    pub path_mapping: Option<String>,
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    #[command(flatten)]
    pub serve: DaemonServeArgs,

    /// Log file for the background process
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Seconds to wait for the daemon to become ready
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,
}

#[derive(Args, Debug)]
pub struct DaemonRunArgs {
    #[arg(long)]
    pub connection_file: PathBuf,

    /// Run data as JSON, or @file
    #[arg(long)]
    pub run_data: String,
}

#[derive(Args, Debug)]
pub struct DaemonTargetArgs {
    #[arg(long)]
    pub connection_file: PathBuf,
}

#[derive(Args, Debug)]
pub struct DaemonStopArgs {
    #[arg(long)]
    pub connection_file: PathBuf,

    /// Seconds to wait for the daemon to exit
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,
}

/// Arguments for the `client` subcommand
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Version reported by the simulated application
    #[arg(long, default_value = "2024")]
    pub host_version: String,

    /// Milliseconds between simulated progress lines
    #[arg(long, default_value_t = 0)]
    pub step_delay_ms: u64,
}
