//! Adaptor control process
//!
//! Lifecycle entry points, the dispatch loop feeding the command channel, the
//! hosted process supervisor and scheduler status reporting.

mod dispatch;
mod host_process;
mod lifecycle;
mod render_adaptor;
mod status;

pub use dispatch::{ActionTimeouts, DispatchLoop, FatalLatch, START_RENDER};
pub use host_process::{HostCommand, HostExit, HostProcess, HostTerminator};
pub use lifecycle::{run_lifecycle, Adaptor};
pub use render_adaptor::RenderAdaptor;
pub use status::StatusReporter;
