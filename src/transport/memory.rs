//! Channel-backed transport for driving pumps without sockets

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Control, Frame, FrameReader, FrameWriter, TransportError, TransportResult};

/// Everything the writer half emitted, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    Frame(Vec<u8>),
    Control(Control),
    Closed,
}

pub struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<TransportResult<Frame>>,
}

pub struct MemoryWriter {
    outbound: mpsc::UnboundedSender<Written>,
    /// Every data write takes this long, as on a congested network
    delay: Option<Duration>,
}

/// The remote end of a memory transport
pub struct Peer {
    pub inbound: mpsc::UnboundedSender<TransportResult<Frame>>,
    pub outbound: mpsc::UnboundedReceiver<Written>,
}

pub fn pair() -> (MemoryReader, MemoryWriter, Peer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        MemoryReader {
            inbound: inbound_rx,
        },
        MemoryWriter {
            outbound: outbound_tx,
            delay: None,
        },
        Peer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

/// Like [`pair`], but each data frame takes `delay` to write
pub fn slow_pair(delay: Duration) -> (MemoryReader, MemoryWriter, Peer) {
    let (reader, mut writer, peer) = pair();
    writer.delay = Some(delay);
    (reader, writer, peer)
}

impl Peer {
    pub fn send(&self, data: &[u8]) {
        let _ = self.inbound.send(Ok(Frame::Data(data.to_vec())));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.inbound.send(Ok(frame));
    }

    pub async fn next(&mut self) -> Option<Written> {
        self.outbound.recv().await
    }

    /// Next data frame, skipping pings. Panics after five seconds.
    pub async fn next_data(&mut self) -> Vec<u8> {
        let wait = async {
            loop {
                match self.outbound.recv().await {
                    Some(Written::Frame(data)) => return data,
                    Some(Written::Control(Control::Ping)) => continue,
                    other => panic!("Expected a data frame, got {:?}", other),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for a data frame")
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> TransportResult<Option<Frame>> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, payload: Vec<u8>) -> TransportResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outbound
            .send(Written::Frame(payload))
            .map_err(|_| TransportError::Closed)
    }

    async fn write_control(&mut self, kind: Control) -> TransportResult<()> {
        self.outbound
            .send(Written::Control(kind))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        let _ = self.outbound.send(Written::Closed);
        Ok(())
    }
}
