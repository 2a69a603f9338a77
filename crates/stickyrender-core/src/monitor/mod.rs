//! Output monitor
//!
//! Turns the hosted application's free-form console output into structured
//! events through an ordered list of regex rules.

mod builtin;
#[allow(clippy::module_inception)]
mod monitor;
mod rules;

pub use builtin::builtin_rules;
pub use monitor::{ControlRequest, EventSink, OutputMonitor, OutputStream, ProcessControl, RecentLines};
pub use rules::{EventConstructor, MonitorEvent, OutputRule, RuleMatch, RuleSet};
