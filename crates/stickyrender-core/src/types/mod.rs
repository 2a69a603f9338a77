//! Core type definitions for stickyrender
//!
//! Actions and their arguments, the command channel wire format, and the
//! init/run data accepted by the adaptor.

mod action_types;
mod data_types;
mod protocol_types;

pub use action_types::*;
pub use data_types::*;
pub use protocol_types::*;
