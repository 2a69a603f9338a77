//! `daemon`: a session that outlives the invocation that started it
//!
//! `serve` initialises and starts the adaptor, then listens on a private
//! control socket whose location and token go into the connection-info
//! record. `start`, `run`, `cancel` and `stop` are short-lived clients of it.

use super::{parse_json_arg, parse_path_mapping};
use crate::cli::{DaemonRunArgs, DaemonServeArgs, DaemonStartArgs, DaemonStopArgs, DaemonTargetArgs};
use crate::control::{ControlHandler, CANCEL, RUN, STOP};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use stickyrender_core::channel::{generate_token, serve_connection, ChannelListener};
use stickyrender_core::{
    Action, ActionArgs, Adaptor, AdaptorConfig, ChannelConnection, ConnectOptions, ConnectionInfo, HelloResult, InitData,
    RenderAdaptor, RunData, CHANNEL_PROTOCOL_VERSION,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_GRACE: Duration = Duration::from_secs(10);
/// Time open control connections get to finish after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn start(config_path: Option<&Path>, args: DaemonStartArgs) -> Result<()> {
    let connection_file = &args.serve.connection_file;
    ConnectionInfo::remove(connection_file)?;

    let exe = std::env::current_exe().context("Cannot locate the stickyrender executable")?;
    let mut command = std::process::Command::new(exe);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command
        .args(["daemon", "serve", "--connection-file"])
        .arg(connection_file)
        .arg("--init-data")
        .arg(&args.serve.init_data);
    if let Some(mapping) = &args.serve.path_mapping {
        command.arg("--path-mapping").arg(mapping);
    }

    let (stdout, stderr) = match &args.log_file {
        Some(path) => {
            let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            (Stdio::from(file.try_clone()?), Stdio::from(file))
        }
        None => (Stdio::null(), Stdio::null()),
    };
    command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().context("Failed to launch the daemon")?;
    info!("Launched daemon (pid {}), waiting for it to become ready", child.id());

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    loop {
        if let Ok(info) = ConnectionInfo::load(connection_file) {
            info!("Daemon ready on {}", info.socket_path.display());
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            bail!("Daemon exited before becoming ready ({})", status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            bail!("Daemon did not become ready within {}s", args.timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub async fn serve(config: AdaptorConfig, args: DaemonServeArgs) -> Result<()> {
    let init = InitData::from_value(parse_json_arg(&args.init_data)?)?;
    let mapper = parse_path_mapping(args.path_mapping.as_deref())?;
    let adaptor = Arc::new(RenderAdaptor::new(config).with_path_mapping(mapper));

    adaptor.on_init(init).await?;
    if let Err(e) = adaptor.on_start().await {
        if let Err(cleanup) = adaptor.on_cleanup().await {
            warn!("Cleanup after failed start also failed: {}", cleanup);
        }
        return Err(e.into());
    }

    let socket_dir = tempfile::Builder::new().prefix("stickyrender-control").tempdir()?;
    let socket_path = socket_dir.path().join("control.sock");
    let listener = ChannelListener::bind(&socket_path)?;
    let record = ConnectionInfo::new(&socket_path, generate_token());
    record.save(&args.connection_file)?;
    info!("Daemon listening on {}", socket_path.display());

    let (handler, mut shutdown) = ControlHandler::new(adaptor.clone());
    let handler = Arc::new(handler);
    let hello = HelloResult {
        protocol_version: CHANNEL_PROTOCOL_VERSION,
        host_version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
    };
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(transport) => {
                    let handler = handler.clone();
                    let token = record.token.clone();
                    let hello = hello.clone();
                    connections.spawn(async move {
                        match serve_connection(&transport, handler.as_ref(), Some(&token), &hello).await {
                            Ok(end) => debug!("Control connection ended: {:?}", end),
                            Err(e) => warn!("Control connection failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            },
            _ = shutdown.changed() => break,
            _ = interrupted() => {
                warn!("Interrupted; cancelling and cleaning up");
                adaptor.on_cancel().await?;
                if let Err(e) = adaptor.on_cleanup().await {
                    warn!("Cleanup failed: {}", e);
                }
                break;
            }
        }
    }

    // Let in-flight replies, such as the answer to `stop`, reach their peers
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("Dropping idle control connections");
    }
    ConnectionInfo::remove(&args.connection_file)?;
    info!("Daemon stopped");
    Ok(())
}

pub async fn run(args: DaemonRunArgs) -> Result<()> {
    let run = RunData::from_value(parse_json_arg(&args.run_data)?)?;
    let result = request(&args.connection_file, RUN, run.to_args()).await?;
    info!("Task finished: {}", result);
    Ok(())
}

pub async fn cancel(args: DaemonTargetArgs) -> Result<()> {
    request(&args.connection_file, CANCEL, ActionArgs::new()).await?;
    info!("Cancel requested");
    Ok(())
}

pub async fn stop(args: DaemonStopArgs) -> Result<()> {
    let result = request(&args.connection_file, STOP, ActionArgs::new()).await;

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    while args.connection_file.exists() {
        if Instant::now() >= deadline {
            bail!("Daemon did not exit within {}s", args.timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    result?;
    info!("Daemon stopped");
    Ok(())
}

/// Attach to the daemon named by `connection_file` and send one request
async fn request(connection_file: &Path, method: &str, args: ActionArgs) -> Result<Value> {
    let record = ConnectionInfo::load(connection_file)
        .with_context(|| format!("No daemon connection info at {}", connection_file.display()))?;
    let pid = record.pid;
    let options = ConnectOptions {
        startup_grace: CONNECT_GRACE,
        token: Some(record.token),
        ..Default::default()
    };

    let connection = ChannelConnection::connect_with_backoff(&record.socket_path, &options, || process_alive(pid)).await?;
    connection
        .send(&Action::new(method, args), None)
        .await
        .map_err(|e| anyhow!("{}", e))
}

#[cfg(unix)]
async fn interrupted() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn interrupted() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(4_000_000_000));
    }

    #[tokio::test]
    async fn test_request_without_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = request(&dir.path().join("missing.json"), RUN, ActionArgs::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No daemon connection info"));
    }
}
