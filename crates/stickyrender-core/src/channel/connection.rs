//! Adaptor side of the command channel
//!
//! Connects to the stub inside the hosted application, performs the handshake,
//! then carries one request at a time.

use super::protocol::{ChannelMessage, ProtocolHandler};
use super::transport::LineTransport;
use crate::error::ChannelError;
use crate::types::{Action, ActionFailure, HelloResult, JsonRpcRequest, JsonRpcResponse};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How to establish the connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Total time the hosted application has to open the channel
    pub startup_grace: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub token: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            token: None,
        }
    }
}

/// Established command channel connection.
///
/// Strict request/response: the internal lock keeps at most one request
/// outstanding. After a request times out the connection is wedged and every
/// later send fails without touching the wire.
pub struct ChannelConnection {
    protocol: ProtocolHandler,
    transport: LineTransport,
    in_flight: Mutex<()>,
    wedged: AtomicBool,
    hello: HelloResult,
}

impl ChannelConnection {
    /// Connect with bounded exponential backoff, then perform the handshake.
    ///
    /// `host_alive` is polled between attempts so a hosted process that died
    /// during startup aborts the wait early.
    pub async fn connect_with_backoff<F>(path: &Path, options: &ConnectOptions, host_alive: F) -> Result<Self, ChannelError>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + options.startup_grace;
        let mut backoff = options.initial_backoff;
        let mut attempts = 0u32;

        let transport = loop {
            attempts += 1;
            match LineTransport::connect(path).await {
                Ok(transport) => break transport,
                Err(ChannelError::Unsupported) => return Err(ChannelError::Unsupported),
                Err(e) => {
                    if !host_alive() {
                        return Err(ChannelError::ConnectFailed(
                            "the hosted application exited before opening the command channel".to_string(),
                        ));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("Giving up after {} connection attempts: {}", attempts, e);
                        return Err(ChannelError::StartupTimeout {
                            secs: options.startup_grace.as_secs(),
                        });
                    }
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(options.max_backoff);
                }
            }
        };
        debug!("Command channel connected after {} attempt(s)", attempts);

        let protocol = ProtocolHandler::new();
        let request = protocol.create_hello_request(options.token.as_deref());
        let remaining = deadline.saturating_duration_since(Instant::now()).max(Duration::from_secs(1));

        let response = match tokio::time::timeout(remaining, Self::exchange(&transport, &protocol, request)).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(ChannelError::StartupTimeout {
                    secs: options.startup_grace.as_secs(),
                })
            }
        };
        let hello = protocol.parse_hello_response(&response)?;
        info!("Command channel ready (host version {}, pid {})", hello.host_version, hello.pid);

        Ok(Self {
            protocol,
            transport,
            in_flight: Mutex::new(()),
            wedged: AtomicBool::new(false),
            hello,
        })
    }

    /// Handshake result reported by the stub
    pub fn hello(&self) -> &HelloResult {
        &self.hello
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::SeqCst)
    }

    /// Send an action and wait for its response.
    ///
    /// Dispatch errors come back as [`ActionFailure::Dispatch`]; anything that
    /// breaks the channel comes back as [`ActionFailure::Channel`].
    pub async fn send(&self, action: &Action, timeout: Option<Duration>) -> Result<serde_json::Value, ActionFailure> {
        if self.is_wedged() {
            return Err(ActionFailure::Channel(ChannelError::Wedged));
        }

        let _guard = self.in_flight.lock().await;
        if self.is_wedged() {
            return Err(ActionFailure::Channel(ChannelError::Wedged));
        }

        let request = self.protocol.create_action_request(action);
        debug!("Sending action {} '{}' as request {:?}", action.id, action.name, request.id);

        let exchange = Self::exchange(&self.transport, &self.protocol, request);
        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(response) => response,
                Err(_) => {
                    warn!("Action '{}' timed out after {:?}; channel is now unusable", action.name, limit);
                    self.wedged.store(true, Ordering::SeqCst);
                    return Err(ActionFailure::Channel(ChannelError::Timeout {
                        action: action.name.clone(),
                        limit,
                    }));
                }
            },
            None => exchange.await,
        };

        let response = response.map_err(ActionFailure::Channel)?;
        self.protocol
            .parse_action_response(&action.name, response)
            .map_err(ActionFailure::Dispatch)
    }

    /// Write a request and read until its response arrives
    async fn exchange(
        transport: &LineTransport,
        protocol: &ProtocolHandler,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, ChannelError> {
        let seq = request
            .seq()
            .ok_or_else(|| ChannelError::InvalidMessage("Request missing ID".to_string()))?;
        transport.send_request(&request).await?;

        loop {
            let line = transport.recv_line().await.ok_or(ChannelError::Disconnected)?;
            let value = match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(v) => v,
                Err(e) => {
                    let snippet = line.chars().take(300).collect::<String>();
                    warn!("Ignoring non-JSON channel message ({}): {}", e, snippet);
                    continue;
                }
            };

            match protocol.parse_message(&value) {
                Ok(ChannelMessage::Response(response)) => match response.seq() {
                    Some(id) if id == seq => return Ok(response),
                    Some(id) if id < seq => {
                        debug!("Discarding stale response for request {}", id);
                    }
                    other => {
                        return Err(ChannelError::InvalidMessage(format!(
                            "Response id {:?} does not match request {}",
                            other, seq
                        )));
                    }
                },
                Ok(ChannelMessage::Request(request)) => {
                    warn!("Ignoring unexpected request '{}' from the stub", request.method);
                }
                Err(e) => {
                    warn!("Failed to parse channel message: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::types::{error_codes, ActionArgs};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Scripted peer: answers the handshake, then replies to each request with
    /// whatever the script returns. `None` means never answer.
    fn scripted_peer<F>(script: F) -> (LineTransport, tokio::task::JoinHandle<Vec<String>>)
    where
        F: Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + 'static,
    {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let client = LineTransport::new(cr, cw);
        let server = LineTransport::new(sr, sw);

        let task = tokio::spawn(async move {
            let protocol = ProtocolHandler::new();
            let mut seen = Vec::new();
            while let Some(line) = server.recv_line().await {
                let request: JsonRpcRequest = serde_json::from_str(&line).unwrap();
                seen.push(request.method.clone());
                let id = request.id.clone().unwrap();
                let response = if request.method == "hello" {
                    Some(protocol.create_result_response(
                        id,
                        json!({"protocolVersion": 1, "hostVersion": "2024", "pid": 7}),
                    ))
                } else {
                    script(&request)
                };
                if let Some(response) = response {
                    server.send_response(&response).await.unwrap();
                }
            }
            seen
        });
        (client, task)
    }

    async fn connected(client: LineTransport) -> ChannelConnection {
        let protocol = ProtocolHandler::new();
        let request = protocol.create_hello_request(None);
        let response = ChannelConnection::exchange(&client, &protocol, request).await.unwrap();
        let hello = protocol.parse_hello_response(&response).unwrap();
        ChannelConnection {
            protocol,
            transport: client,
            in_flight: Mutex::new(()),
            wedged: AtomicBool::new(false),
            hello,
        }
    }

    #[tokio::test]
    async fn test_send_returns_result() {
        let (client, _peer) = scripted_peer(|req| {
            Some(ProtocolHandler::new().create_result_response(req.id.clone().unwrap(), json!({"ok": true})))
        });
        let conn = connected(client).await;
        assert_eq!(conn.hello().host_version, "2024");

        let action = Action::new("ping", ActionArgs::new());
        let result = conn.send(&action, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_send_maps_dispatch_errors() {
        let (client, _peer) = scripted_peer(|req| {
            Some(ProtocolHandler::new().create_error_response(
                req.id.clone().unwrap(),
                error_codes::UNKNOWN_COMMAND,
                "Unknown command",
            ))
        });
        let conn = connected(client).await;

        let action = Action::new("warp_drive", ActionArgs::new());
        let err = conn.send(&action, None).await.unwrap_err();
        assert_eq!(err, ActionFailure::Dispatch(DispatchError::UnknownCommand("warp_drive".to_string())));
        assert!(!conn.is_wedged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wedges_connection_without_resending() {
        let (client, peer) = scripted_peer(|_| None);
        let conn = connected(client).await;

        let action = Action::new("start_render", ActionArgs::new().with("frame", 1));
        let err = conn.send(&action, Some(Duration::from_secs(10))).await.unwrap_err();
        assert!(matches!(err, ActionFailure::Channel(ChannelError::Timeout { .. })));
        assert!(conn.is_wedged());

        let next = Action::new("ping", ActionArgs::new());
        let err = conn.send(&next, Some(Duration::from_secs(10))).await.unwrap_err();
        assert_eq!(err, ActionFailure::Channel(ChannelError::Wedged));

        drop(conn);
        let seen = peer.await.unwrap();
        assert_eq!(seen, vec!["hello", "start_render"]);
    }

    #[tokio::test]
    async fn test_peer_disconnect_is_reported() {
        let (client, peer) = scripted_peer(|_| None);
        let conn = connected(client).await;
        peer.abort();

        let action = Action::new("ping", ActionArgs::new());
        let err = conn.send(&action, None).await.unwrap_err();
        assert_eq!(err, ActionFailure::Channel(ChannelError::Disconnected));
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectOptions {
            startup_grace: Duration::from_secs(3),
            ..Default::default()
        };
        let result = ChannelConnection::connect_with_backoff(&dir.path().join("never.sock"), &options, || true).await;
        assert!(matches!(result, Err(ChannelError::StartupTimeout { secs: 3 })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_aborts_when_host_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            ChannelConnection::connect_with_backoff(&dir.path().join("never.sock"), &ConnectOptions::default(), || false).await;
        assert!(matches!(result, Err(ChannelError::ConnectFailed(_))));
    }
}
