//! Framed duplex transport
//!
//! A connection is split into a reader half and a writer half so that each
//! pump owns exactly one direction. Deadlines are applied by the pumps around
//! these calls rather than stored on the transport.

#[cfg(test)]
pub mod memory;
mod websocket;

pub use websocket::*;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur while reading or writing frames
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Transport closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A frame received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload (text or binary)
    Data(Vec<u8>),
    /// Liveness probe from the peer
    Ping(Vec<u8>),
    /// Answer to one of our pings
    Pong(Vec<u8>),
    /// Peer started the closing handshake
    Close,
}

/// Control frames the writer can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ping,
    Close,
}

/// Read half of a transport. Only the read pump holds one.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next frame. `Ok(None)` means the peer went away cleanly.
    async fn read_frame(&mut self) -> TransportResult<Option<Frame>>;
}

/// Write half of a transport. Only the write pump holds one.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one application frame
    async fn write_frame(&mut self, payload: Vec<u8>) -> TransportResult<()>;

    /// Write a control frame
    async fn write_control(&mut self, kind: Control) -> TransportResult<()>;

    /// Flush and shut down the write direction. Safe to call more than once.
    async fn close(&mut self) -> TransportResult<()>;
}
