//! Adaptor lifecycle
//!
//! The external scheduler drives an adaptor through init, start, any number of
//! runs, stop and cleanup. [`run_lifecycle`] is a minimal driver for running
//! the whole sequence in one process.

use crate::error::Result;
use crate::types::{InitData, RunData};
use async_trait::async_trait;
use tracing::{info, warn};

/// Entry points called by the lifecycle driver.
///
/// All hooks take `&self` so `on_cancel` can be called while `on_run` is in
/// progress.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Accept and validate the session-wide data. Nothing is launched yet.
    async fn on_init(&self, init: InitData) -> Result<()>;

    /// Launch the hosted application and load the scene
    async fn on_start(&self) -> Result<()>;

    /// Render one task. Fails if `on_start` has not succeeded.
    async fn on_run(&self, run: RunData) -> Result<()>;

    /// End of the last task. Safe to call more than once.
    async fn on_stop(&self) -> Result<()>;

    /// Close the hosted application and release resources
    async fn on_cleanup(&self) -> Result<()>;

    /// Abort whatever is running as fast as possible
    async fn on_cancel(&self) -> Result<()>;
}

/// Drive `adaptor` through init, start, every run and stop. Cleanup always
/// runs; the first error wins.
pub async fn run_lifecycle(adaptor: &dyn Adaptor, init: InitData, runs: Vec<RunData>) -> Result<()> {
    let result = drive(adaptor, init, runs).await;
    let cleanup = adaptor.on_cleanup().await;

    match (result, cleanup) {
        (Err(e), Err(cleanup_err)) => {
            warn!("Cleanup after a failed session also failed: {}", cleanup_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), cleanup) => cleanup,
    }
}

async fn drive(adaptor: &dyn Adaptor, init: InitData, runs: Vec<RunData>) -> Result<()> {
    adaptor.on_init(init).await?;
    adaptor.on_start().await?;

    let total = runs.len();
    for (index, run) in runs.into_iter().enumerate() {
        info!("Running task {}/{} (frame {})", index + 1, total, run.frame);
        adaptor.on_run(run).await?;
    }

    adaptor.on_stop().await
}
