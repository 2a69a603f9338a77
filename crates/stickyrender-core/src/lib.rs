//! Sticky Render Core Library
//!
//! Keeps one instance of a slow-starting 3D application resident across many
//! render tasks. This crate provides:
//! - The action queue and the dispatch loop that feeds it to the application
//! - The command channel (newline-framed JSON-RPC over a Unix socket)
//! - The client stub that runs inside the application, with per-renderer
//!   command tables
//! - The output monitor that turns console output into progress and errors
//! - Path mapping, configuration and the adaptor lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── adaptor process ───────────────────────────┐
//! │  Adaptor hooks ──enqueue──▶ ActionQueue ──▶ DispatchLoop ──┐            │
//! │                                                            │ JSON-RPC   │
//! │  StatusReporter ◀── event pump ◀── OutputMonitor ◀──┐      │            │
//! └─────────────────────────────────────────────────────┼──────┼────────────┘
//!                                          stdout/stderr│      │socket
//! ┌──────────────────────────── hosted application ─────┼──────┼────────────┐
//! │                                                     │      ▼            │
//! │   SceneHost ◀── handler table ◀── CommandDispatcher ◀── ClientStub      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```text
//! action/    - FIFO queue with a single in-flight slot
//! adaptor/   - Lifecycle, dispatch loop, host process, status lines
//! channel/   - Transport, protocol, connection, server, connection info
//! client/    - Client stub and command dispatcher
//! monitor/   - Output rules, built-in rules, stream readers
//! render/    - Renderer registry, handler tables, scene host
//! types/     - Actions, wire types, init and run data
//! ```

pub mod action;
pub mod adaptor;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod monitor;
pub mod pathmap;
pub mod render;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

pub use action::{ActionHandle, ActionQueue};
pub use adaptor::{run_lifecycle, Adaptor, HostCommand, HostProcess, RenderAdaptor, StatusReporter};
pub use channel::{ChannelConnection, ConnectOptions, ConnectionInfo};
pub use client::{ClientStub, CommandDispatcher, StubSettings};
pub use config::AdaptorConfig;
pub use monitor::{builtin_rules, MonitorEvent, OutputMonitor, OutputRule, RuleSet};
pub use pathmap::{PathFormat, PathMapper, PathMappingRule};
pub use render::{HandlerRegistry, Renderer, SceneHost, SimulatedHost};
