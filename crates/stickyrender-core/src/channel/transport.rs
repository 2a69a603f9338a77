//! Newline-delimited JSON-RPC transport over a local stream socket

use super::protocol::MAX_LINE_BYTES;
use crate::error::ChannelError;
use crate::types::{JsonRpcRequest, JsonRpcResponse};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, trace, warn};

/// Result of reading one bounded line
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Read one `\n`-terminated line into `buf` without holding more than `max`
/// bytes. An overlong line is consumed and reported as [`LineRead::TooLong`].
pub(crate) async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut overflow = false;

    loop {
        let (consumed, found_newline) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match (overflow, buf.is_empty()) {
                    (true, _) => LineRead::TooLong,
                    (false, true) => LineRead::Eof,
                    (false, false) => LineRead::Line,
                });
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let data = &available[..newline.unwrap_or(available.len())];
            if !overflow {
                if buf.len() + data.len() > max {
                    overflow = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(data);
                }
            }
            (newline.map(|i| i + 1).unwrap_or(available.len()), newline.is_some())
        };

        reader.consume(consumed);
        if found_newline {
            return Ok(if overflow { LineRead::TooLong } else { LineRead::Line });
        }
    }
}

/// Work for the writer task
enum Outgoing {
    Line(String),
    /// Acknowledged once every earlier line has been written and flushed
    Flush(oneshot::Sender<()>),
}

/// Transport layer for the command channel.
/// Uses channels to avoid lock contention between send and receive
pub struct LineTransport {
    /// Channel to the writer task
    writer_tx: mpsc::Sender<Outgoing>,
    /// Channel from the reader task
    reader_rx: Mutex<mpsc::Receiver<String>>,
    _writer_task: tokio::task::JoinHandle<()>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl LineTransport {
    /// Wrap a split stream
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel::<Outgoing>(100);
        let (reader_tx, reader_rx) = mpsc::channel::<String>(100);

        let writer_task = tokio::spawn(Self::write_task(writer, writer_rx));
        let reader_task = tokio::spawn(Self::read_task(reader, reader_tx));

        Self {
            writer_tx,
            reader_rx: Mutex::new(reader_rx),
            _writer_task: writer_task,
            reader_task,
        }
    }

    /// Connect to a listening channel endpoint
    #[cfg(unix)]
    pub async fn connect(path: &Path) -> Result<Self, ChannelError> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| ChannelError::ConnectFailed(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_unix_stream(stream))
    }

    #[cfg(not(unix))]
    pub async fn connect(_path: &Path) -> Result<Self, ChannelError> {
        Err(ChannelError::Unsupported)
    }

    #[cfg(unix)]
    pub fn from_unix_stream(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }

    /// Background task draining outgoing lines
    async fn write_task<W>(mut writer: W, mut rx: mpsc::Receiver<Outgoing>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(item) = rx.recv().await {
            let data = match item {
                Outgoing::Line(data) => data,
                Outgoing::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            };
            trace!("Sending: {}", data);
            if let Err(e) = writer.write_all(data.as_bytes()).await {
                error!("Failed to write to channel: {}", e);
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                error!("Failed to write newline to channel: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush channel: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!("Channel writer task ended");
    }

    /// Background task reading incoming lines
    async fn read_task<R>(reader: R, tx: mpsc::Sender<String>)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            match read_bounded_line(&mut reader, &mut buf, MAX_LINE_BYTES).await {
                Ok(LineRead::Eof) => {
                    debug!("Channel closed by peer");
                    break;
                }
                Ok(LineRead::TooLong) => {
                    warn!("Dropping channel message larger than {} bytes", MAX_LINE_BYTES);
                }
                Ok(LineRead::Line) => {
                    let line = String::from_utf8_lossy(&buf);
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        trace!("Received: {}", trimmed);
                        if tx.send(trimmed.to_string()).await.is_err() {
                            warn!("Failed to deliver channel line, receiver closed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading channel: {}", e);
                    break;
                }
            }
        }
    }

    async fn send_line(&self, json: String) -> Result<(), ChannelError> {
        self.writer_tx
            .send(Outgoing::Line(json))
            .await
            .map_err(|_| ChannelError::Disconnected)
    }

    /// Wait until every line sent so far has been written to the socket.
    /// Needed before a server returns and its process may exit.
    pub async fn flush(&self) -> Result<(), ChannelError> {
        let (ack, done) = oneshot::channel();
        self.writer_tx
            .send(Outgoing::Flush(ack))
            .await
            .map_err(|_| ChannelError::Disconnected)?;
        done.await.map_err(|_| ChannelError::Disconnected)
    }

    /// Send a JSON-RPC request
    pub async fn send_request(&self, request: &JsonRpcRequest) -> Result<(), ChannelError> {
        let json = serde_json::to_string(request).map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        self.send_line(json).await
    }

    /// Send a JSON-RPC response
    pub async fn send_response(&self, response: &JsonRpcResponse) -> Result<(), ChannelError> {
        let json = serde_json::to_string(response).map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        self.send_line(json).await
    }

    /// Receive the next line; `None` once the peer has gone away
    pub async fn recv_line(&self) -> Option<String> {
        let mut rx = self.reader_rx.lock().await;
        rx.recv().await
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        // The writer drains and exits on its own once the sender is dropped.
        self.reader_task.abort();
    }
}
