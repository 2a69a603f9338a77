//! `client`: serve the command channel from inside the hosted application
//!
//! Runs the stub against the simulated scene host, writing the application's
//! console output to stdout where the adaptor's output monitor reads it.

use crate::cli::ClientArgs;
use anyhow::Result;
use std::time::Duration;
use stickyrender_core::{ClientStub, SimulatedHost, StubSettings};
use tracing::info;

pub async fn run(args: ClientArgs) -> Result<()> {
    let settings = StubSettings::from_env()?;
    let host = SimulatedHost::stdout()
        .with_version(args.host_version)
        .with_step_delay(Duration::from_millis(args.step_delay_ms));

    let end = ClientStub::new(settings, Box::new(host)).serve().await?;
    info!("Client stub finished: {:?}", end);
    Ok(())
}
