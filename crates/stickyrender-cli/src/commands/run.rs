//! `run`: a whole session in one process

use super::{parse_json_arg, parse_path_mapping};
use crate::cli::RunArgs;
use anyhow::{bail, Result};
use stickyrender_core::{run_lifecycle, Adaptor, AdaptorConfig, InitData, RenderAdaptor, RunData};
use tracing::{info, warn};

pub async fn run(config: AdaptorConfig, args: RunArgs) -> Result<()> {
    let init = InitData::from_value(parse_json_arg(&args.init_data)?)?;
    let runs = args
        .run_data
        .iter()
        .map(|arg| Ok(RunData::from_value(parse_json_arg(arg)?)?))
        .collect::<Result<Vec<_>>>()?;
    let mapper = parse_path_mapping(args.path_mapping.as_deref())?;

    info!("Starting session: {} task(s) with {}", runs.len(), init.renderer);
    let adaptor = RenderAdaptor::new(config).with_path_mapping(mapper);

    let lifecycle = run_lifecycle(&adaptor, init, runs);
    tokio::pin!(lifecycle);

    tokio::select! {
        result = &mut lifecycle => {
            result?;
            info!("Session finished");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling the session");
            adaptor.on_cancel().await?;
            if let Err(e) = lifecycle.await {
                warn!("Session ended after cancel: {}", e);
            }
            bail!("Interrupted")
        }
    }
}
