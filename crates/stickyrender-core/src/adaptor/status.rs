//! Progress and status lines for the scheduler
//!
//! Written to the adaptor's stdout as `openjd_progress: <n>` and
//! `openjd_status: <message>`.

use parking_lot::Mutex;
use std::io::Write;
use tracing::warn;

pub struct StatusReporter {
    out: Mutex<Box<dyn Write + Send>>,
    last_progress: Mutex<Option<f32>>,
}

impl StatusReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            last_progress: Mutex::new(None),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Report progress; repeats of the last value are skipped
    pub fn progress(&self, percent: f32) {
        let percent = percent.clamp(0.0, 100.0);
        {
            let mut last = self.last_progress.lock();
            if *last == Some(percent) {
                return;
            }
            *last = Some(percent);
        }
        self.write_line(&format!("openjd_progress: {}", percent));
    }

    pub fn status(&self, message: &str) {
        // One line per status; embedded newlines would break the framing.
        let message = message.replace(['\r', '\n'], " ");
        self.write_line(&format!("openjd_status: {}", message));
    }

    /// Forget the last progress value, e.g. at the start of a new task
    pub fn reset(&self) {
        *self.last_progress.lock() = None;
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!("Failed to write status line: {}", e);
        }
    }
}
