//! Connection proxy
//!
//! Couples one transport to one outbound queue and drives the connection
//! through its lifecycle: register with the hub, run both pumps, and tear
//! down once either side gives up.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pumps::{read_pump, write_pump, ReadExit, WriteExit};
use crate::config::HubConfig;
use crate::hub::{outbound_queue, ClientHandle, ClientId, HubHandle, HubResult, OutboundQueue};
use crate::transport::{FrameReader, FrameWriter};

/// Lifecycle of one connection. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet known to the hub
    Connecting,
    /// Receiving broadcasts
    Registered,
    /// Unregister issued, pumps winding down
    Draining,
    /// Both pumps exited and the transport is closed
    Closed,
}

/// How a connection ended
#[derive(Debug)]
pub enum Teardown {
    /// The read side failed first and unregistered the connection
    Read(ReadExit),
    /// The write side stopped first (unregister, eviction or write failure)
    Write(WriteExit),
    /// The write pump task panicked
    WriteTask(JoinError),
}

/// One connected peer
pub struct Client<R, W> {
    id: ClientId,
    reader: R,
    writer: W,
    handle: ClientHandle,
    queue: OutboundQueue,
    hub: HubHandle,
    config: Arc<HubConfig>,
    state: watch::Sender<ConnectionState>,
}

impl<R, W> Client<R, W>
where
    R: FrameReader,
    W: FrameWriter + 'static,
{
    /// Wrap an established transport. Nothing happens until [`Client::serve`].
    pub fn new(hub: HubHandle, reader: R, writer: W, config: Arc<HubConfig>) -> Self {
        let id = Uuid::new_v4();
        let (sender, queue) = outbound_queue(config.queue_capacity);
        let (state, _) = watch::channel(ConnectionState::Connecting);

        Self {
            id,
            reader,
            writer,
            handle: ClientHandle::new(id, sender),
            queue,
            hub,
            config,
            state,
        }
    }

    /// Get the connection ID
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Watch the connection's lifecycle state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register with the hub and pump until the connection is done
    ///
    /// The write pump runs on its own task; the read pump runs on the
    /// caller's. Whichever stops first decides the teardown path, and both
    /// paths converge on the hub's unregister.
    pub async fn serve(self) -> HubResult<Teardown> {
        let Self {
            id,
            reader,
            writer,
            handle,
            queue,
            hub,
            config,
            state,
        } = self;

        if let Err(e) = hub.register(handle).await {
            state.send_replace(ConnectionState::Closed);
            return Err(e);
        }
        state.send_replace(ConnectionState::Registered);
        debug!("Client {} registered", id);

        let mut write_task = tokio::spawn(write_pump(id, writer, queue, Arc::clone(&config)));

        // Losing the race drops the read pump, and with it the reader
        let teardown = tokio::select! {
            exit = read_pump(id, reader, hub.clone(), Arc::clone(&config)) => {
                state.send_replace(ConnectionState::Draining);
                info!("Client {} read side closed: {}", id, exit);

                // A faulty peer gets no backlog flush and no close frame
                if exit.is_fault() {
                    write_task.abort();
                }

                // Otherwise unregister closed the queue; the write pump sends
                // close and stops within one write deadline
                match time::timeout(config.write_wait, &mut write_task).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) if e.is_cancelled() => {
                        debug!("Write pump for client {} stopped with the read side", id);
                    }
                    Ok(Err(e)) => warn!("Write pump for client {} failed: {}", id, e),
                    Err(_) => {
                        warn!("Write pump for client {} still busy, dropping transport", id);
                        write_task.abort();
                    }
                }
                Teardown::Read(exit)
            }
            joined = &mut write_task => {
                state.send_replace(ConnectionState::Draining);

                // Already gone after an eviction; required after a write failure
                let _ = hub.unregister(id).await;

                match joined {
                    Ok(exit) => {
                        info!("Client {} write side closed: {}", id, exit);
                        Teardown::Write(exit)
                    }
                    Err(e) => {
                        warn!("Write pump for client {} failed: {}", id, e);
                        Teardown::WriteTask(e)
                    }
                }
            }
        };

        state.send_replace(ConnectionState::Closed);
        debug!("Client {} closed", id);
        Ok(teardown)
    }
}
