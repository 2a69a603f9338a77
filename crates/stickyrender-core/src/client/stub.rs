//! Client stub
//!
//! Runs inside the hosted application. Binds the socket named in the
//! environment, accepts the adaptor's single connection and serves requests
//! through a [`CommandDispatcher`].

use super::dispatcher::CommandDispatcher;
use crate::channel::{serve_connection, ChannelListener, Reply, RequestHandler, ServeEnd, CHANNEL_PATH_ENV, CHANNEL_TOKEN_ENV};
use crate::error::{ChannelError, Error, Result};
use crate::render::{SceneHost, HOST_VERSION_MARKER};
use crate::types::{error_codes, HelloResult, JsonRpcRequest, CHANNEL_PROTOCOL_VERSION};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Where to serve, as handed over by the adaptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSettings {
    pub socket_path: PathBuf,
    pub token: Option<String>,
}

impl StubSettings {
    pub fn from_env() -> Result<Self> {
        let socket_path = std::env::var_os(CHANNEL_PATH_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| Error::Internal(format!("{} is not set", CHANNEL_PATH_ENV)))?;
        let token = std::env::var(CHANNEL_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        Ok(Self { socket_path, token })
    }
}

struct StubHandler {
    dispatcher: Arc<Mutex<CommandDispatcher>>,
}

#[async_trait]
impl RequestHandler for StubHandler {
    async fn handle(&self, request: JsonRpcRequest) -> Reply {
        let dispatcher = self.dispatcher.clone();
        let method = request.method.clone();

        // Handlers block on the host; keep them off the reactor.
        let outcome = tokio::task::spawn_blocking(move || {
            let mut dispatcher = dispatcher.lock();
            let result = dispatcher.dispatch(&request.method, request.params.as_ref());
            (result, dispatcher.is_closed())
        })
        .await;

        match outcome {
            Ok((Ok(value), closed)) => {
                let reply = Reply::ok(value);
                if closed {
                    reply.and_close()
                } else {
                    reply
                }
            }
            Ok((Err(e), _)) => Reply::error(e.code(), e.wire_message()),
            Err(e) => {
                error!("Dispatch of '{}' aborted: {}", method, e);
                Reply::error(error_codes::HANDLER_FAILED, format!("dispatch aborted: {}", e))
            }
        }
    }
}

pub struct ClientStub {
    settings: StubSettings,
    dispatcher: Arc<Mutex<CommandDispatcher>>,
}

impl ClientStub {
    pub fn new(settings: StubSettings, host: Box<dyn SceneHost>) -> Self {
        Self {
            settings,
            dispatcher: Arc::new(Mutex::new(CommandDispatcher::new(host))),
        }
    }

    pub fn from_dispatcher(settings: StubSettings, dispatcher: CommandDispatcher) -> Self {
        Self {
            settings,
            dispatcher: Arc::new(Mutex::new(dispatcher)),
        }
    }

    /// Serve the adaptor's connection until `close` or disconnect
    pub async fn serve(self) -> Result<ServeEnd> {
        let listener = ChannelListener::bind(&self.settings.socket_path)?;
        info!("Client stub listening on {}", listener.path().display());

        let hello = {
            let mut dispatcher = self.dispatcher.lock();
            let version = dispatcher.host_version();
            dispatcher.host_print(&format!("{} {}", HOST_VERSION_MARKER, version));
            HelloResult {
                protocol_version: CHANNEL_PROTOCOL_VERSION,
                host_version: version,
                pid: std::process::id(),
            }
        };

        let transport = listener.accept().await?;
        let handler = StubHandler {
            dispatcher: self.dispatcher.clone(),
        };
        let end = serve_connection(&transport, &handler, self.settings.token.as_deref(), &hello).await?;

        match end {
            ServeEnd::Closed => info!("Adaptor closed the channel"),
            ServeEnd::PeerGone => info!("Adaptor disconnected"),
            ServeEnd::Rejected => {
                self.dispatcher.lock().shutdown();
                return Err(ChannelError::Unauthorized("adaptor failed the handshake".to_string()).into());
            }
        }
        self.dispatcher.lock().shutdown();
        Ok(end)
    }
}
