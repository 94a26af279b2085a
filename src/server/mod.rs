//! WebSocket server module
//!
//! Accepts TCP connections, upgrades them on the hub path and runs one
//! connection proxy per peer against a shared hub.

#[allow(dead_code)]
mod websocket;

pub use websocket::*;
