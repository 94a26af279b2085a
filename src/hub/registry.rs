//! The broadcast hub
//!
//! A single task owns the membership set and applies register, unregister
//! and broadcast commands one at a time, in arrival order. Nothing else
//! touches the set, so no lock guards it and an eviction decision can never
//! race with another broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::{EnqueueError, OutboundSender, Payload};

/// Identifies one connection for its whole lifetime
pub type ClientId = Uuid;

/// Pending commands before callers start waiting on the hub
const COMMAND_CAPACITY: usize = 1024;

/// Lifecycle events retained for slow subscribers
const EVENT_CAPACITY: usize = 256;

/// Errors that can occur when talking to the hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is not running")]
    Stopped,
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Membership changes published by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A connection joined the broadcast set
    Registered { client_id: ClientId },
    /// A connection left (read failure, write failure or shutdown)
    Unregistered { client_id: ClientId },
    /// A connection was dropped because its outbound queue was full
    Evicted { client_id: ClientId },
}

/// Counters kept by the hub loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Connections currently registered
    pub clients: usize,
    pub registrations: u64,
    pub unregistrations: u64,
    pub broadcasts: u64,
    /// Successful enqueues across all connections
    pub deliveries: u64,
    /// Connections dropped by the slow-consumer policy
    pub evictions: u64,
}

/// What the hub needs to know about a connection: who it is and where its
/// outbound payloads go
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    queue: OutboundSender,
}

impl ClientHandle {
    pub fn new(id: ClientId, queue: OutboundSender) -> Self {
        Self { id, queue }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }
}

enum Command {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Payload),
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// The hub event loop. Build with [`Hub::new`] and drive with [`Hub::run`],
/// or use [`Hub::spawn`].
pub struct Hub {
    /// Registered connections and the sending side of their queues
    clients: HashMap<ClientId, OutboundSender>,
    commands: mpsc::Receiver<Command>,
    event_tx: broadcast::Sender<HubEvent>,
    stats: HubStats,
}

/// Cloneable entry point to a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<HubEvent>,
}

impl Hub {
    /// Create a hub and the handle used to reach it
    pub fn new() -> (Self, HubHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let hub = Self {
            clients: HashMap::new(),
            commands: command_rx,
            event_tx: event_tx.clone(),
            stats: HubStats::default(),
        };
        let handle = HubHandle {
            commands: command_tx,
            event_tx,
        };
        (hub, handle)
    }

    /// Create a hub and run it on its own task
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        debug!("Hub started");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(client) => self.register(client),
                Command::Unregister(client_id) => self.unregister(client_id),
                Command::Broadcast(payload) => self.broadcast(payload),
                Command::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown => {
                    self.unregister_all();
                    break;
                }
            }
        }

        // Any queues still held close here
        debug!("Hub stopped with {} clients", self.clients.len());
    }

    fn register(&mut self, client: ClientHandle) {
        if self.clients.contains_key(&client.id) {
            debug!("Client {} already registered", client.id);
            return;
        }

        self.clients.insert(client.id, client.queue);
        self.stats.registrations += 1;
        let _ = self.event_tx.send(HubEvent::Registered {
            client_id: client.id,
        });
        debug!(
            "Client {} registered ({} active)",
            client.id,
            self.clients.len()
        );
    }

    fn unregister(&mut self, client_id: ClientId) {
        // Removing the sender closes the queue
        if self.clients.remove(&client_id).is_none() {
            return;
        }

        self.stats.unregistrations += 1;
        let _ = self.event_tx.send(HubEvent::Unregistered { client_id });
        debug!(
            "Client {} unregistered ({} active)",
            client_id,
            self.clients.len()
        );
    }

    fn broadcast(&mut self, payload: Payload) {
        self.stats.broadcasts += 1;

        let Self {
            clients,
            event_tx,
            stats,
            ..
        } = self;

        clients.retain(|&client_id, queue| match queue.try_enqueue(Arc::clone(&payload)) {
            Ok(()) => {
                stats.deliveries += 1;
                true
            }
            Err(EnqueueError::Full) => {
                warn!("Client {} outbound queue full, evicting", client_id);
                stats.evictions += 1;
                let _ = event_tx.send(HubEvent::Evicted { client_id });
                false
            }
            Err(EnqueueError::Closed) => {
                debug!("Client {} write side already gone", client_id);
                stats.unregistrations += 1;
                let _ = event_tx.send(HubEvent::Unregistered { client_id });
                false
            }
        });
    }

    fn unregister_all(&mut self) {
        let client_ids: Vec<ClientId> = self.clients.keys().copied().collect();
        if !client_ids.is_empty() {
            info!("Closing {} client queues", client_ids.len());
        }
        for client_id in client_ids {
            self.unregister(client_id);
        }
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            ..self.stats
        }
    }
}

impl HubHandle {
    async fn submit(&self, command: Command) -> HubResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Add a connection to the broadcast set. No-op if it is already there.
    pub async fn register(&self, client: ClientHandle) -> HubResult<()> {
        self.submit(Command::Register(client)).await
    }

    /// Remove a connection and close its queue. No-op if it is absent.
    pub async fn unregister(&self, client_id: ClientId) -> HubResult<()> {
        self.submit(Command::Unregister(client_id)).await
    }

    /// Offer `payload` to every connection registered when the hub gets to it
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> HubResult<()> {
        self.submit(Command::Broadcast(payload.into())).await
    }

    /// Counters as of every command submitted before this one
    pub async fn stats(&self) -> HubResult<HubStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Command::Stats(reply_tx)).await?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    /// Unregister every connection and stop the hub loop
    pub async fn shutdown(&self) -> HubResult<()> {
        self.submit(Command::Shutdown).await
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }
}
