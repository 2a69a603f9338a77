//! Action queue

mod queue;

pub use queue::{ActionHandle, ActionQueue};
