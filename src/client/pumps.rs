//! Read and write pumps
//!
//! Each connection runs exactly one of each. The read pump is the only
//! caller of `read_frame` on its transport and the write pump the only
//! writer, so reads and writes never interleave.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::HubConfig;
use crate::hub::{ClientId, HubHandle, OutboundQueue, Payload};
use crate::transport::{Control, Frame, FrameReader, FrameWriter, TransportError, TransportResult};

/// Separator between payloads merged into one outbound frame
const NEWLINE: u8 = b'\n';

/// Why a read pump stopped
#[derive(Debug, Error)]
pub enum ReadExit {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("no frame or pong within {0:?}")]
    LivenessTimeout(Duration),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("read failed: {0}")]
    Transport(TransportError),

    #[error("hub is not running")]
    HubStopped,
}

impl ReadExit {
    /// The peer is dead or broke the protocol; nothing more should be written
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ReadExit::LivenessTimeout(_) | ReadExit::FrameTooLarge { .. } | ReadExit::Transport(_)
        )
    }
}

/// Why a write pump stopped
#[derive(Debug, Error)]
pub enum WriteExit {
    #[error("outbound queue closed")]
    QueueClosed,

    #[error("write did not complete within {0:?}")]
    Timeout(Duration),

    #[error("write failed: {0}")]
    Transport(TransportError),
}

/// Replace embedded newlines with spaces and trim surrounding whitespace
pub fn normalize(payload: &[u8]) -> Vec<u8> {
    let flattened: Vec<u8> = payload
        .iter()
        .map(|&b| if b == NEWLINE { b' ' } else { b })
        .collect();
    flattened.trim_ascii().to_vec()
}

/// Join payloads into one frame body, in order, separated by newlines
pub fn coalesce(first: Payload, rest: Vec<Payload>) -> Vec<u8> {
    let len = first.len() + rest.iter().map(|p| p.len() + 1).sum::<usize>();
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&first);
    for payload in rest {
        frame.push(NEWLINE);
        frame.extend_from_slice(&payload);
    }
    frame
}

/// Pump inbound frames into hub broadcasts until the connection fails
///
/// Every frame, pongs included, pushes the read deadline out by one
/// liveness window. On exit the connection is unregistered and the reader
/// is dropped.
pub async fn read_pump<R: FrameReader>(
    client_id: ClientId,
    mut reader: R,
    hub: HubHandle,
    config: Arc<HubConfig>,
) -> ReadExit {
    let window = config.liveness_window;
    let mut deadline = Instant::now() + window;

    let exit = loop {
        let frame = match time::timeout_at(deadline, reader.read_frame()).await {
            Err(_) => break ReadExit::LivenessTimeout(window),
            Ok(Err(TransportError::FrameTooLarge { size, limit })) => {
                break ReadExit::FrameTooLarge { size, limit }
            }
            Ok(Err(e)) => break ReadExit::Transport(e),
            Ok(Ok(None)) => break ReadExit::PeerClosed,
            Ok(Ok(Some(frame))) => frame,
        };
        deadline = Instant::now() + window;

        match frame {
            Frame::Data(data) => {
                if data.len() > config.max_frame_size {
                    break ReadExit::FrameTooLarge {
                        size: data.len(),
                        limit: config.max_frame_size,
                    };
                }
                if hub.broadcast(normalize(&data)).await.is_err() {
                    break ReadExit::HubStopped;
                }
            }
            Frame::Pong(_) => {
                debug!("Pong from client {}", client_id);
            }
            // Answered by the transport
            Frame::Ping(_) => {}
            Frame::Close => break ReadExit::PeerClosed,
        }
    };

    if hub.unregister(client_id).await.is_err() {
        debug!("Hub gone while unregistering client {}", client_id);
    }
    exit
}

async fn with_deadline<F>(wait: Duration, op: F) -> Result<(), WriteExit>
where
    F: Future<Output = TransportResult<()>>,
{
    match time::timeout(wait, op).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteExit::Transport(e)),
        Err(_) => Err(WriteExit::Timeout(wait)),
    }
}

/// Drain the outbound queue onto the transport and keep the peer pinged
///
/// Returns once the hub closes the queue (after sending a close frame) or a
/// write fails. The writer is closed either way.
pub async fn write_pump<W: FrameWriter>(
    client_id: ClientId,
    mut writer: W,
    mut queue: OutboundQueue,
    config: Arc<HubConfig>,
) -> WriteExit {
    let period = config.ping_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    if let Err(e) = with_deadline(config.write_wait, writer.write_control(Control::Close)).await {
                        debug!("Close frame to client {} not sent: {}", client_id, e);
                    }
                    break WriteExit::QueueClosed;
                };

                let frame = if config.coalesce {
                    coalesce(first, queue.drain_ready())
                } else {
                    first.to_vec()
                };
                if let Err(exit) = with_deadline(config.write_wait, writer.write_frame(frame)).await {
                    break exit;
                }
            }
            _ = ticker.tick() => {
                if let Err(exit) = with_deadline(config.write_wait, writer.write_control(Control::Ping)).await {
                    break exit;
                }
            }
        }
    };

    if let Err(e) = with_deadline(config.write_wait, writer.close()).await {
        debug!("Closing transport for client {}: {}", client_id, e);
    }
    exit
}
