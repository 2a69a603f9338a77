//! Serving side of the command channel
//!
//! Used by the in-application stub and by the daemon control socket. Both
//! speak the same framing and handshake.

use super::protocol::{decode_request_line, ProtocolHandler};
use super::transport::LineTransport;
use crate::error::ChannelError;
use crate::types::{error_codes, HelloParams, HelloResult, JsonRpcError, JsonRpcRequest, HELLO_METHOD};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reply produced by a [`RequestHandler`]
#[derive(Debug)]
pub struct Reply {
    pub result: Result<serde_json::Value, JsonRpcError>,
    /// Stop serving once this reply has been written
    pub close: bool,
}

impl Reply {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            result: Ok(value),
            close: false,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            result: Err(JsonRpcError::new(code, message)),
            close: false,
        }
    }

    pub fn and_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Handles requests arriving on a served connection
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: JsonRpcRequest) -> Reply;
}

/// Why a served connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEnd {
    /// The handler asked to close
    Closed,
    /// The peer went away
    PeerGone,
    /// The handshake was missing or carried the wrong token
    Rejected,
}

/// Serve one connection: handshake first, then requests until the handler
/// closes or the peer disconnects.
pub async fn serve_connection(
    transport: &LineTransport,
    handler: &dyn RequestHandler,
    token: Option<&str>,
    hello: &HelloResult,
) -> Result<ServeEnd, ChannelError> {
    let protocol = ProtocolHandler::new();
    let mut authenticated = false;

    while let Some(line) = transport.recv_line().await {
        let request = match decode_request_line(&protocol, &line) {
            Ok(request) => request,
            Err(response) => {
                warn!("Rejecting malformed request: {}", line.chars().take(200).collect::<String>());
                transport.send_response(&response).await?;
                continue;
            }
        };
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);

        if !authenticated {
            match check_hello(&request, token) {
                Ok(()) => {
                    authenticated = true;
                    let result = serde_json::to_value(hello).map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
                    transport
                        .send_response(&protocol.create_result_response(id, result))
                        .await?;
                    debug!("Handshake accepted");
                    continue;
                }
                Err(message) => {
                    warn!("Handshake rejected: {}", message);
                    transport
                        .send_response(&protocol.create_error_response(id, error_codes::UNAUTHORIZED, &message))
                        .await?;
                    transport.flush().await?;
                    return Ok(ServeEnd::Rejected);
                }
            }
        }

        let method = request.method.clone();
        let reply = handler.handle(request).await;
        let response = match reply.result {
            Ok(value) => protocol.create_result_response(id, value),
            Err(error) => protocol.create_error_response(id, error.code, &error.message),
        };
        transport.send_response(&response).await?;

        if reply.close {
            transport.flush().await?;
            info!("Closing channel after '{}'", method);
            return Ok(ServeEnd::Closed);
        }
    }

    Ok(ServeEnd::PeerGone)
}

fn check_hello(request: &JsonRpcRequest, token: Option<&str>) -> Result<(), String> {
    if request.method != HELLO_METHOD {
        return Err(format!("expected '{}' before '{}'", HELLO_METHOD, request.method));
    }
    let params: HelloParams = request
        .params
        .clone()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| format!("malformed hello: {}", e))?
        .ok_or_else(|| "hello is missing its parameters".to_string())?;

    match token {
        Some(expected) if params.token.as_deref() != Some(expected) => Err("invalid channel token".to_string()),
        _ => Ok(()),
    }
}

/// Listening endpoint bound to a filesystem path. The socket file is
/// removed when the listener is dropped.
#[cfg(unix)]
pub struct ChannelListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl ChannelListener {
    /// Bind, replacing a stale socket file, and restrict it to the owner
    pub fn bind(path: &Path) -> Result<Self, ChannelError> {
        use std::os::unix::fs::PermissionsExt;

        if path.exists() {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path).map_err(|e| ChannelError::ConnectFailed(format!("{}: {}", path.display(), e)))?;
        }
        let listener = tokio::net::UnixListener::bind(path)
            .map_err(|e| ChannelError::ConnectFailed(format!("bind {}: {}", path.display(), e)))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| ChannelError::ConnectFailed(format!("chmod {}: {}", path.display(), e)))?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> Result<LineTransport, ChannelError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChannelError::ConnectFailed(format!("accept: {}", e)))?;
        Ok(LineTransport::from_unix_stream(stream))
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(not(unix))]
pub struct ChannelListener {
    path: PathBuf,
}

#[cfg(not(unix))]
impl ChannelListener {
    pub fn bind(_path: &Path) -> Result<Self, ChannelError> {
        Err(ChannelError::Unsupported)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> Result<LineTransport, ChannelError> {
        Err(ChannelError::Unsupported)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::connection::{ChannelConnection, ConnectOptions};
    use crate::types::{Action, ActionArgs, ActionFailure, CHANNEL_PROTOCOL_VERSION};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: JsonRpcRequest) -> Reply {
            match request.method.as_str() {
                "close" => Reply::ok(json!(null)).and_close(),
                "echo" => Reply::ok(request.params.unwrap_or(json!(null))),
                other => Reply::error(error_codes::UNKNOWN_COMMAND, format!("Unknown command: {}", other)),
            }
        }
    }

    fn hello() -> HelloResult {
        HelloResult {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            host_version: "test".to_string(),
            pid: std::process::id(),
        }
    }

    #[tokio::test]
    async fn test_serve_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sock");
        let listener = ChannelListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            serve_connection(&transport, &Echo, Some("secret"), &hello()).await.unwrap()
        });

        let options = ConnectOptions {
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let conn = ChannelConnection::connect_with_backoff(&path, &options, || true).await.unwrap();
        assert_eq!(conn.hello().host_version, "test");

        let echo = Action::new("echo", ActionArgs::new().with("frame", 3));
        assert_eq!(conn.send(&echo, None).await.unwrap(), json!({"frame": 3}));

        let close = Action::new("close", ActionArgs::new());
        conn.send(&close, None).await.unwrap();
        assert_eq!(server.await.unwrap(), ServeEnd::Closed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_close_reply_arrives_when_server_exits_right_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sock");

        // The server gets its own runtime, dropped as soon as serving ends,
        // like a stub process exiting after `close`.
        let server_path = path.clone();
        let server = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let end = runtime.block_on(async move {
                let listener = ChannelListener::bind(&server_path).unwrap();
                let transport = listener.accept().await.unwrap();
                serve_connection(&transport, &Echo, None, &hello()).await.unwrap()
            });
            drop(runtime);
            end
        });

        let conn = ChannelConnection::connect_with_backoff(&path, &ConnectOptions::default(), || true)
            .await
            .unwrap();
        let close = Action::new("close", ActionArgs::new());
        conn.send(&close, None).await.unwrap();

        let end = tokio::task::spawn_blocking(move || server.join().unwrap()).await.unwrap();
        assert_eq!(end, ServeEnd::Closed);
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sock");
        let listener = ChannelListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            serve_connection(&transport, &Echo, Some("secret"), &hello()).await.unwrap()
        });

        let options = ConnectOptions {
            token: Some("guess".to_string()),
            ..Default::default()
        };
        let result = ChannelConnection::connect_with_backoff(&path, &options, || true).await;
        assert!(matches!(result, Err(ChannelError::Unauthorized(_))));
        assert_eq!(server.await.unwrap(), ServeEnd::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sock");
        let listener = ChannelListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let transport = listener.accept().await.unwrap();
            serve_connection(&transport, &Echo, None, &hello()).await
        });

        let conn = ChannelConnection::connect_with_backoff(&path, &ConnectOptions::default(), || true)
            .await
            .unwrap();
        let err = conn.send(&Action::new("bogus", ActionArgs::new()), None).await.unwrap_err();
        assert!(matches!(err, ActionFailure::Dispatch(_)));
        let ok = conn.send(&Action::new("echo", ActionArgs::new()), None).await.unwrap();
        assert_eq!(ok, json!({}));
    }
}
