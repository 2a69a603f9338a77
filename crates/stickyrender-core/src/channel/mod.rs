//! Command channel between the adaptor and the hosted application
//!
//! Newline-framed JSON-RPC 2.0 over a Unix domain socket. The adaptor connects
//! as the client; the stub inside the hosted application serves.

mod connection;
mod connection_info;
mod protocol;
mod server;
mod transport;

pub use connection::{ChannelConnection, ConnectOptions};
pub use connection_info::{generate_token, ConnectionInfo};
pub use protocol::{decode_request_line, ChannelMessage, ProtocolHandler, MAX_LINE_BYTES};
pub use server::{serve_connection, ChannelListener, Reply, RequestHandler, ServeEnd};
pub use transport::LineTransport;

pub(crate) use transport::{read_bounded_line, LineRead};

/// Environment variable carrying the socket path to the hosted process
pub const CHANNEL_PATH_ENV: &str = "STICKYRENDER_CHANNEL_PATH";

/// Environment variable carrying the handshake token to the hosted process
pub const CHANNEL_TOKEN_ENV: &str = "STICKYRENDER_CHANNEL_TOKEN";
