//! WebSocket server implementation
//!
//! Listens on a configurable port, upgrades requests on the hub path and
//! hands every established connection to a `Client` registered with the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::HubConfig;
use crate::hub::{Hub, HubHandle};
use crate::transport;

/// Default path that accepts WebSocket upgrades
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path that is upgraded to a WebSocket
    pub path: String,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            path: DEFAULT_WS_PATH.to_string(),
        }
    }

    /// Set the upgrade path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server feeding one broadcast hub
pub struct WebSocketServer {
    config: ServerConfig,
    hub_config: Arc<HubConfig>,
    hub: HubHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server and start its hub
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig, hub_config: HubConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            hub_config: Arc::new(hub_config),
            hub: Hub::spawn(),
            shutdown_tx,
        }
    }

    /// Handle to the hub every connection registers with
    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "WebSocket server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.path
        );
        Ok(listener)
    }

    /// Bind and run the WebSocket server
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections until a shutdown signal is received
    ///
    /// On shutdown the hub closes every outbound queue, so each connection
    /// sends a close frame before the server returns.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hub = self.hub.clone();
                            let hub_config = Arc::clone(&self.hub_config);
                            let path = self.config.path.clone();

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, hub, hub_config, path).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections so the set stays small
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if self.hub.shutdown().await.is_err() {
            debug!("Hub already stopped");
        }

        // Give connections one write deadline to send their close frames
        let active = connections.len();
        if active > 0 {
            info!("Waiting for {} active connections to close...", active);
            let grace = self.hub_config.write_wait + Duration::from_secs(1);
            let drained = tokio::time::timeout(grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("{} connections still open at shutdown", connections.len());
                connections.abort_all();
            }
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: HubHandle,
    hub_config: Arc<HubConfig>,
    path: String,
) -> anyhow::Result<()> {
    debug!("New TCP connection from {}", peer_addr);

    // Upgrade to WebSocket; a silent peer gets one write deadline to ask
    let (reader, writer) = transport::accept(
        stream,
        &path,
        hub_config.max_frame_size,
        hub_config.write_wait,
    )
    .await?;

    let client = Client::new(hub, reader, writer, hub_config);
    let client_id = client.id();
    info!("Client {} connected from {}", client_id, peer_addr);

    let teardown = client.serve().await?;
    info!(
        "Connection from {} closed (client {}): {:?}",
        peer_addr, client_id, teardown
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubEvent;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.path, "/ws");
    }

    #[test]
    fn test_server_config_with_path() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080).with_path("/chat");
        assert_eq!(config.path, "/chat");
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("websocket error");
            match message {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Expected text, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_broadcast_and_shutdown() {
        let server = Arc::new(WebSocketServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            HubConfig::default(),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = server.hub();
        let mut events = hub.subscribe();

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let url = format!("ws://{}/ws", addr);
        let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
        let (mut bob, _) = connect_async(url.as_str()).await.unwrap();

        let mut registered = 0;
        while registered < 2 {
            if let Ok(HubEvent::Registered { .. }) = events.recv().await {
                registered += 1;
            }
        }

        alice
            .send(Message::Text("  hi\nbob  ".to_string()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut alice).await, "hi bob");
        assert_eq!(next_text(&mut bob).await, "hi bob");

        server.shutdown();
        runner.await.unwrap().unwrap();

        // Each client is told the server is going away
        loop {
            match tokio::time::timeout(Duration::from_secs(5), bob.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("no close frame after shutdown"),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let server = Arc::new(WebSocketServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            HubConfig::default().with_max_frame_size(16),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = server.hub();
        let mut events = hub.subscribe();

        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await });
        }

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        assert!(matches!(events.recv().await, Ok(HubEvent::Registered { .. })));

        let _ = client.send(Message::Text("x".repeat(64))).await;
        assert!(matches!(events.recv().await, Ok(HubEvent::Unregistered { .. })));
        assert_eq!(hub.stats().await.unwrap().broadcasts, 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_silent_tcp_peer_dropped_after_handshake_timeout() {
        use tokio::io::AsyncReadExt;

        let server = Arc::new(WebSocketServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            HubConfig::default().with_write_wait(Duration::from_millis(200)),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await });
        }

        // Connect but never send the upgrade request
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server kept a silent connection open");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.hub().stats().await.unwrap().registrations, 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let server = Arc::new(WebSocketServer::new(
            ServerConfig::new("127.0.0.1".to_string(), 0),
            HubConfig::default(),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await });
        }

        let result = connect_async(format!("ws://{}/elsewhere", addr)).await;
        assert!(result.is_err());
        assert_eq!(server.hub().stats().await.unwrap().registrations, 0);

        server.shutdown();
    }
}
