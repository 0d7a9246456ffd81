//! WebSocket relay server in front of a [`SignalHub`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Room ── NavigationSync
//!            ├── RelayServer ── SignalHub   │
//! Client B ──┘   (bincode frames)   │       └── PositionStore
//!                                   └── Room ...
//! ```
//!
//! The first frame of a connection must be `join-room`; it fixes the
//! participant identity for the rest of the connection. Any later frame is
//! routed through the hub on behalf of that identity. When the socket closes
//! the participant leaves every room it joined.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::navigation::NavigationConfig;
use crate::protocol::{ParticipantInfo, SignalMessage};
use crate::signaling::{HubConfig, SignalHub};
use crate::store::{MemoryPositionStore, PositionStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub max_participants_per_room: usize,
    /// Outbox capacity per connection
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    pub navigation: NavigationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_room: 8,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            navigation: NavigationConfig::default(),
        }
    }
}

impl ServerConfig {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_capacity: self.broadcast_capacity,
            max_participants_per_room: self.max_participants_per_room,
            navigation: self.navigation.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<SignalHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a relay server with an in-memory position store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryPositionStore::new()))
    }

    /// Create a relay server persisting positions to `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PositionStore>) -> Self {
        let hub = Arc::new(SignalHub::new(config.hub_config(), store));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<SignalHub>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (outbox, mut outbox_rx) = broadcast::channel::<SignalMessage>(config.broadcast_capacity);
        let mut identity: Option<ParticipantInfo> = None;

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            let msg = match SignalMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    stats.write().await.rejected_messages += 1;
                                    continue;
                                }
                            };

                            let result = match (identity.clone(), msg) {
                                (None, SignalMessage::JoinRoom { room, participant }) => {
                                    identity = Some(participant.clone());
                                    hub.join(room, participant, outbox.clone()).await
                                }
                                (None, other) => {
                                    log::warn!(
                                        "Connection {addr} sent '{}' before join-room",
                                        other.event_name()
                                    );
                                    stats.write().await.rejected_messages += 1;
                                    continue;
                                }
                                (Some(me), SignalMessage::JoinRoom { room, participant }) => {
                                    if participant.id == me.id {
                                        hub.join(room, me, outbox.clone()).await
                                    } else {
                                        log::warn!("Connection {addr} tried to join as {}", participant.id);
                                        stats.write().await.rejected_messages += 1;
                                        continue;
                                    }
                                }
                                (Some(me), other) => hub.route(me.id, other).await,
                            };

                            if let Err(e) = result {
                                log::debug!("Relay refused message from {addr}: {e}");
                                stats.write().await.rejected_messages += 1;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::error!("WebSocket error to {addr}: {e}");
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                msg = outbox_rx.recv() => {
                    match msg {
                        Ok(msg) => {
                            let encoded = match msg.encode() {
                                Ok(encoded) => encoded,
                                Err(e) => {
                                    log::error!("Failed to encode '{}': {e}", msg.event_name());
                                    continue;
                                }
                            };
                            if let Err(e) = ws_sender.send(Message::Binary(encoded.into())).await {
                                log::error!("WebSocket error to {addr}: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {addr} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        log::info!("Heartbeat to {addr} failed: {e}");
                        break;
                    }
                }
            }
        }

        // Cleanup: leave every room joined over this connection
        if let Some(me) = identity {
            hub.disconnect(me.id).await;
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = hub.room_count().await;

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.hub.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }
}
