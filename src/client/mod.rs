//! Connection proxy module
//!
//! One `Client` per accepted transport, with a read pump feeding the hub
//! and a write pump draining the connection's outbound queue.

#[allow(dead_code)]
mod proxy;
mod pumps;

pub use proxy::*;
#[allow(unused_imports)]
pub use pumps::*;
