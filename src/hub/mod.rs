//! Broadcast hub module
//!
//! The registry of live connections and the bounded queues that feed them.

#[allow(dead_code)]
mod queue;
#[allow(dead_code)]
mod registry;

pub use queue::*;
pub use registry::*;
