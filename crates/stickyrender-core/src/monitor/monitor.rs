//! Reads the hosted process's output streams and raises events

use super::rules::{MonitorEvent, RuleSet};
use crate::channel::{read_bounded_line, LineRead};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const HOST_TARGET: &str = "stickyrender::host";

/// Longest output line evaluated; longer lines are truncated
const MAX_OUTPUT_LINE: usize = 64 * 1024;

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// A request to the process supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Terminate { reason: String },
}

/// Lets event handling ask the supervisor to stop the hosted process.
///
/// Requests are sent over a channel; nothing here blocks the reader.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    tx: mpsc::UnboundedSender<ControlRequest>,
    requested: Arc<AtomicBool>,
}

impl ProcessControl {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                requested: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Ask for termination. Only the first request is forwarded.
    pub fn request_termination(&self, reason: impl Into<String>) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reason = reason.into();
        warn!("Requesting termination of the hosted application: {}", reason);
        if self.tx.send(ControlRequest::Terminate { reason }).is_err() {
            debug!("Process supervisor is gone");
        }
        true
    }

    pub fn termination_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Bounded buffer of the most recent output lines
#[derive(Debug)]
pub struct RecentLines {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Receives recognised events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MonitorEvent, control: &ProcessControl);
}

impl EventSink for mpsc::UnboundedSender<MonitorEvent> {
    fn emit(&self, event: MonitorEvent, _control: &ProcessControl) {
        if self.send(event).is_err() {
            debug!("Monitor event dropped, receiver closed");
        }
    }
}

pub struct OutputMonitor {
    rules: RuleSet,
    recent: Arc<RecentLines>,
    control: ProcessControl,
    sink: Arc<dyn EventSink>,
}

impl OutputMonitor {
    pub fn new(rules: RuleSet, control: ProcessControl, sink: Arc<dyn EventSink>, recent_lines: usize) -> Self {
        Self {
            rules,
            recent: Arc::new(RecentLines::new(recent_lines)),
            control,
            sink,
        }
    }

    pub fn recent(&self) -> Arc<RecentLines> {
        self.recent.clone()
    }

    pub fn control(&self) -> &ProcessControl {
        &self.control
    }

    /// Log, buffer and classify one line
    pub fn process_line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => info!(target: HOST_TARGET, "{}", line),
            OutputStream::Stderr => warn!(target: HOST_TARGET, "{}", line),
        }
        self.recent.push(line);

        for matched in self.rules.evaluate(line) {
            match matched.event {
                Ok(event) => {
                    if let MonitorEvent::Error { message, fatal: true } = &event {
                        error!("{}", message);
                        self.control.request_termination(message.clone());
                    }
                    self.sink.emit(event, &self.control);
                }
                Err(e) => warn!("Output rule '{}' failed on {}: {}", matched.rule, stream.as_str(), e),
            }
        }
    }

    /// Spawn a task feeding `reader` through [`Self::process_line`] until EOF
    pub fn spawn_reader<R>(self: &Arc<Self>, stream: OutputStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                match read_bounded_line(&mut reader, &mut buf, MAX_OUTPUT_LINE).await {
                    Ok(LineRead::Eof) => break,
                    Ok(LineRead::TooLong) => {
                        monitor.process_line(stream, "<output line too long, truncated>");
                    }
                    Ok(LineRead::Line) => {
                        let line = String::from_utf8_lossy(&buf);
                        monitor.process_line(stream, line.trim_end_matches('\r'));
                    }
                    Err(e) => {
                        warn!("Error reading hosted application {}: {}", stream.as_str(), e);
                        break;
                    }
                }
            }
            debug!("Hosted application {} closed", stream.as_str());
        })
    }
}
