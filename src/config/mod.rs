//! Configuration module
//!
//! Handles loading the hub's liveness, deadline and queue settings.

mod hub;

pub use hub::*;
