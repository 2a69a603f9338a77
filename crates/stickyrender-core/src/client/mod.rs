//! In-application side of the command channel

mod dispatcher;
mod stub;

pub use dispatcher::{CommandDispatcher, CLOSE, PING, SET_RENDERER};
pub use stub::{ClientStub, StubSettings};
