//! Daemon control socket
//!
//! Same framing and handshake as the command channel. Methods:
//! - `run`    - params are run data; replies once the task has finished
//! - `cancel` - kill the hosted application to abort the current task
//! - `stop`   - stop and clean up, then shut the daemon down

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use stickyrender_core::channel::{Reply, RequestHandler};
use stickyrender_core::types::error_codes;
use stickyrender_core::{Adaptor, JsonRpcRequest, RunData};
use tokio::sync::watch;
use tracing::{info, warn};

pub const RUN: &str = "run";
pub const CANCEL: &str = "cancel";
pub const STOP: &str = "stop";

pub struct ControlHandler {
    adaptor: Arc<dyn Adaptor>,
    shutdown: watch::Sender<bool>,
}

impl ControlHandler {
    pub fn new(adaptor: Arc<dyn Adaptor>) -> (Self, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        (Self { adaptor, shutdown }, rx)
    }

    async fn run(&self, params: Option<Value>) -> Reply {
        let run = match RunData::from_value(params.unwrap_or_else(|| json!({}))) {
            Ok(run) => run,
            Err(e) => return Reply::error(error_codes::INVALID_PARAMS, e.to_string()),
        };
        let frame = run.frame;
        match self.adaptor.on_run(run).await {
            Ok(()) => Reply::ok(json!({ "frame": frame })),
            Err(e) => {
                warn!("Task for frame {} failed: {}", frame, e);
                Reply::error(error_codes::HANDLER_FAILED, e.to_string())
            }
        }
    }

    async fn stop(&self) -> Reply {
        let stopped = self.adaptor.on_stop().await;
        let cleaned = self.adaptor.on_cleanup().await;
        let _ = self.shutdown.send(true);

        match stopped.and(cleaned) {
            Ok(()) => Reply::ok(Value::Null).and_close(),
            Err(e) => Reply::error(error_codes::HANDLER_FAILED, e.to_string()).and_close(),
        }
    }
}

#[async_trait]
impl RequestHandler for ControlHandler {
    async fn handle(&self, request: JsonRpcRequest) -> Reply {
        info!("Control request '{}'", request.method);
        match request.method.as_str() {
            RUN => self.run(request.params).await,
            CANCEL => match self.adaptor.on_cancel().await {
                Ok(()) => Reply::ok(Value::Null),
                Err(e) => Reply::error(error_codes::HANDLER_FAILED, e.to_string()),
            },
            STOP => self.stop().await,
            other => Reply::error(error_codes::UNKNOWN_COMMAND, format!("Unknown command: {}", other)),
        }
    }
}
