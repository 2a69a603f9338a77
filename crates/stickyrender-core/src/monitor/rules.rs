//! Output rules: ordered pattern to event mappings

use regex::{Captures, Regex};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Structured signal recognised in the hosted application's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Render progress of the current frame, 0 to 100
    Progress { percent: u8 },
    FrameComplete { frame: i64 },
    HostVersion { version: String },
    Warning { message: String },
    /// An error line. Fatal errors end the session.
    Error { message: String, fatal: bool },
}

impl MonitorEvent {
    pub fn fatal(message: impl Into<String>) -> Self {
        MonitorEvent::Error {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, MonitorEvent::Error { fatal: true, .. })
    }
}

/// Builds an event from a rule's captures
pub type EventConstructor = Arc<dyn Fn(&Captures<'_>) -> Result<MonitorEvent, String> + Send + Sync>;

#[derive(Clone)]
pub struct OutputRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub construct: EventConstructor,
    /// Keep evaluating later rules after this one matches
    pub pass_through: bool,
}

impl OutputRule {
    pub fn new<F>(name: &'static str, pattern: Regex, construct: F) -> Self
    where
        F: Fn(&Captures<'_>) -> Result<MonitorEvent, String> + Send + Sync + 'static,
    {
        Self {
            name,
            pattern,
            construct: Arc::new(construct),
            pass_through: false,
        }
    }

    pub fn pass_through(mut self) -> Self {
        self.pass_through = true;
        self
    }
}

impl fmt::Debug for OutputRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("pass_through", &self.pass_through)
            .finish()
    }
}

/// Result of one rule on one line
#[derive(Debug)]
pub struct RuleMatch {
    pub rule: &'static str,
    pub event: Result<MonitorEvent, String>,
}

/// Ordered rules, fixed for the lifetime of a monitor
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<OutputRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: OutputRule) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: OutputRule) -> Self {
        self.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Evaluate a line. Stops at the first matching rule that is not
    /// pass-through. A panicking constructor is reported as an error.
    pub fn evaluate(&self, line: &str) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in &self.rules {
            let Some(captures) = rule.pattern.captures(line) else {
                continue;
            };
            let event = panic::catch_unwind(AssertUnwindSafe(|| (rule.construct)(&captures)))
                .unwrap_or_else(|_| Err("event constructor panicked".to_string()));
            matches.push(RuleMatch { rule: rule.name, event });
            if !rule.pass_through {
                break;
            }
        }
        matches
    }
}
