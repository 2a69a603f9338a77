//! Dispatch loop
//!
//! The single consumer of the action queue. Pops one action at a time, sends
//! it over the command channel and resolves it with the response. A channel
//! failure trips the session's [`FatalLatch`] and terminates the hosted
//! application, which can no longer be driven.

use super::host_process::HostTerminator;
use crate::action::ActionQueue;
use crate::channel::ChannelConnection;
use crate::client::CLOSE;
use crate::types::ActionFailure;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Action that performs a render; it gets the render timeout
pub const START_RENDER: &str = "start_render";

/// First fatal cause of a session; later causes are ignored
#[derive(Clone)]
pub struct FatalLatch {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl FatalLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record `message` as the fatal cause. Returns false if already tripped.
    pub fn trip(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let tripped = self.tx.send_if_modified(|cause| {
            if cause.is_some() {
                return false;
            }
            *cause = Some(message.clone());
            true
        });
        if tripped {
            error!("Session failed: {}", message);
        }
        tripped
    }

    pub fn cause(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for FatalLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-action response timeouts; `None` waits forever
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTimeouts {
    pub default: Option<Duration>,
    pub render: Option<Duration>,
    pub close: Option<Duration>,
}

impl ActionTimeouts {
    pub fn for_action(&self, name: &str) -> Option<Duration> {
        match name {
            START_RENDER => self.render,
            CLOSE => self.close,
            _ => self.default,
        }
    }
}

pub struct DispatchLoop {
    queue: Arc<ActionQueue>,
    connection: Arc<ChannelConnection>,
    fatal: FatalLatch,
    timeouts: ActionTimeouts,
    host: Option<(HostTerminator, Duration)>,
}

impl DispatchLoop {
    pub fn new(queue: Arc<ActionQueue>, connection: Arc<ChannelConnection>, fatal: FatalLatch, timeouts: ActionTimeouts) -> Self {
        Self {
            queue,
            connection,
            fatal,
            timeouts,
            host: None,
        }
    }

    /// Terminate `host` with `grace` when the channel fails
    pub fn with_terminator(mut self, host: HostTerminator, grace: Duration) -> Self {
        self.host = Some((host, grace));
        self
    }

    /// Run until the queue is closed
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        while let Some(action) = self.queue.dequeue_blocking().await {
            let timeout = self.timeouts.for_action(&action.name);
            debug!("Dispatching action {} '{}' {}", action.id, action.name, action.args.to_json());

            let result = self.connection.send(&action, timeout).await;
            match &result {
                Ok(_) => debug!("Action {} '{}' done", action.id, action.name),
                Err(ActionFailure::Channel(e)) => {
                    self.fatal.trip(format!("Command channel failed during '{}': {}", action.name, e));
                    if let Some((host, grace)) = &self.host {
                        if host.is_running() {
                            warn!("Terminating the hosted application");
                            host.terminate(*grace);
                        }
                    }
                }
                Err(failure) => info!("Action '{}' failed: {}", action.name, failure),
            }
            self.queue.finish(action.id, result);
        }
        debug!("Dispatch loop finished");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::adaptor::host_process::{HostCommand, HostProcess};
    use crate::channel::{serve_connection, ChannelListener, ConnectOptions, Reply, RequestHandler};
    use crate::client::{ClientStub, StubSettings};
    use crate::error::ChannelError;
    use crate::monitor::{MonitorEvent, OutputMonitor, ProcessControl, RuleSet};
    use crate::render::SimulatedHost;
    use crate::types::{ActionArgs, ActionStatus, HelloResult, JsonRpcRequest, CHANNEL_PROTOCOL_VERSION};
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::sync::mpsc;

    fn options() -> ConnectOptions {
        ConnectOptions {
            startup_grace: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn connect(path: &Path) -> Arc<ChannelConnection> {
        Arc::new(ChannelConnection::connect_with_backoff(path, &options(), || true).await.unwrap())
    }

    #[test]
    fn test_timeouts_by_action() {
        let timeouts = ActionTimeouts {
            default: Some(Duration::from_secs(1)),
            render: None,
            close: Some(Duration::from_secs(3)),
        };
        assert_eq!(timeouts.for_action("scene_file"), Some(Duration::from_secs(1)));
        assert_eq!(timeouts.for_action(START_RENDER), None);
        assert_eq!(timeouts.for_action(CLOSE), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_latch_keeps_first_cause() {
        let latch = FatalLatch::new();
        let rx = latch.subscribe();
        assert!(latch.trip("first"));
        assert!(!latch.trip("second"));
        assert_eq!(latch.cause().as_deref(), Some("first"));
        assert_eq!(rx.borrow().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_actions_run_in_order_and_failures_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.sock");
        let settings = StubSettings {
            socket_path: path.clone(),
            token: None,
        };
        let stub = ClientStub::new(settings, Box::new(SimulatedHost::new(Box::new(std::io::sink()))));
        let server = tokio::spawn(stub.serve());

        let queue = Arc::new(ActionQueue::new());
        let latch = FatalLatch::new();
        let timeouts = ActionTimeouts {
            default: Some(Duration::from_secs(5)),
            render: None,
            close: Some(Duration::from_secs(5)),
        };
        let dispatch = DispatchLoop::new(queue.clone(), connect(&path).await, latch.clone(), timeouts).spawn();

        let set = queue
            .enqueue("set_renderer", ActionArgs::new().with("renderer", "arnold"))
            .unwrap();
        let bogus = queue.enqueue("fly", ActionArgs::new()).unwrap();
        let ping = queue.enqueue("ping", ActionArgs::new()).unwrap();
        let close = queue.enqueue(CLOSE, ActionArgs::new()).unwrap();

        assert!(set.wait().await.is_done());
        assert_eq!(bogus.wait().await.status, ActionStatus::Failed);
        assert_eq!(ping.wait().await.result, Some(serde_json::json!("pong")));
        assert!(close.wait().await.is_done());
        assert!(latch.cause().is_none());

        queue.close();
        dispatch.await.unwrap();
        server.await.unwrap().unwrap();
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _request: JsonRpcRequest) -> Reply {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timeout_trips_latch_and_wedges_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = ChannelListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            let hello = HelloResult {
                protocol_version: CHANNEL_PROTOCOL_VERSION,
                host_version: "test".to_string(),
                pid: 0,
            };
            let _ = serve_connection(&transport, &Silent, None, &hello).await;
        });

        let queue = Arc::new(ActionQueue::new());
        let latch = FatalLatch::new();
        let timeouts = ActionTimeouts {
            default: Some(Duration::from_millis(100)),
            render: None,
            close: None,
        };
        DispatchLoop::new(queue.clone(), connect(&path).await, latch.clone(), timeouts).spawn();

        let first = queue.enqueue("scene_file", ActionArgs::new()).unwrap();
        let second = queue.enqueue("project_path", ActionArgs::new()).unwrap();

        let outcome = first.wait().await;
        assert!(matches!(
            outcome.failure,
            Some(ActionFailure::Channel(ChannelError::Timeout { .. }))
        ));
        let outcome = second.wait().await;
        assert_eq!(outcome.failure, Some(ActionFailure::Channel(ChannelError::Wedged)));
        assert!(latch.cause().unwrap().contains("scene_file"));
    }

    fn sleeping_host() -> HostProcess {
        let (control, control_rx) = ProcessControl::new();
        let (tx, _rx) = mpsc::unbounded_channel::<MonitorEvent>();
        let monitor = Arc::new(OutputMonitor::new(RuleSet::new(), control, Arc::new(tx), 10));
        let command = HostCommand::new("/bin/sh").arg("-c").arg("exec sleep 30");
        HostProcess::spawn(&command, monitor, control_rx, Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_channel_failure_terminates_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = ChannelListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            let hello = HelloResult {
                protocol_version: CHANNEL_PROTOCOL_VERSION,
                host_version: "test".to_string(),
                pid: 0,
            };
            let _ = serve_connection(&transport, &Silent, None, &hello).await;
        });

        let host = sleeping_host();
        let queue = Arc::new(ActionQueue::new());
        let latch = FatalLatch::new();
        let timeouts = ActionTimeouts {
            default: None,
            render: Some(Duration::from_millis(200)),
            close: None,
        };
        DispatchLoop::new(queue.clone(), connect(&path).await, latch.clone(), timeouts)
            .with_terminator(host.terminator(), Duration::from_secs(1))
            .spawn();

        let render = queue
            .enqueue(START_RENDER, ActionArgs::new().with("frame", 1))
            .unwrap();
        assert_eq!(render.wait().await.status, ActionStatus::Failed);
        assert!(latch.cause().unwrap().contains("within 200ms"));

        let exit = host.wait_timeout(Duration::from_secs(10)).await;
        assert!(exit.is_some(), "hosted application still running after a channel failure");
        assert!(!host.is_running());
    }
}
