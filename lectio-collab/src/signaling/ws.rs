//! WebSocket signaling client for [`crate::server::RelayServer`].
//!
//! A writer task drains an outgoing channel into the socket and a reader
//! task decodes frames into the local broadcast inbox. Room membership is
//! mirrored from the `room-snapshot` messages the relay sends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ParticipantInfo, RoomId, SignalMessage};

use super::{SignalError, SignalingChannel};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type Roster = Arc<RwLock<HashMap<RoomId, Vec<ParticipantInfo>>>>;

/// Signaling over a WebSocket connection to the relay.
pub struct WsSignaling {
    participant: ParticipantInfo,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    inbox: broadcast::Sender<SignalMessage>,
    roster: Roster,
}

impl WsSignaling {
    /// Connect to the relay at `server_url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(
        participant: ParticipantInfo,
        server_url: impl Into<String>,
    ) -> Result<Self, SignalError> {
        let server_url = server_url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(server_url.as_str())
            .await
            .map_err(|e| SignalError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (inbox, _) = broadcast::channel(256);
        let roster: Roster = Arc::new(RwLock::new(HashMap::new()));

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode incoming frames into the inbox
        let reader_state = state.clone();
        let reader_inbox = inbox.clone();
        let reader_roster = roster.clone();
        let name = participant.name.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SignalMessage::decode(&data) {
                        Ok(msg) => {
                            if let SignalMessage::RoomSnapshot { room, participants, .. } = &msg {
                                reader_roster.write().await.insert(*room, participants.clone());
                            }
                            let _ = reader_inbox.send(msg);
                        }
                        Err(e) => log::warn!("{name}: dropping malformed frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            reader_roster.write().await.clear();
            log::info!("{name}: signaling connection closed");
        });

        log::info!("{} connected to relay {server_url}", participant.name);

        Ok(Self {
            participant,
            server_url,
            state,
            outgoing_tx: out_tx,
            inbox,
            roster,
        })
    }

    async fn send(&self, msg: &SignalMessage) -> Result<(), SignalError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(SignalError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        self.outgoing_tx
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| SignalError::ConnectionClosed)
    }

    /// Close the connection. The relay removes us from every room.
    pub async fn disconnect(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
        *self.state.write().await = ConnectionState::Disconnected;
        self.roster.write().await.clear();
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    fn participant(&self) -> &ParticipantInfo {
        &self.participant
    }

    async fn join_room(&self, room: RoomId) -> Result<(), SignalError> {
        self.send(&SignalMessage::JoinRoom {
            room,
            participant: self.participant.clone(),
        })
        .await
    }

    async fn leave_room(&self, room: RoomId) -> Result<(), SignalError> {
        self.roster.write().await.remove(&room);
        self.send(&SignalMessage::LeaveRoom {
            room,
            participant_id: self.participant.id,
        })
        .await
    }

    async fn emit(&self, message: SignalMessage) -> Result<(), SignalError> {
        message.validate()?;
        self.send(&message).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbox.subscribe()
    }

    async fn members(&self, room: RoomId) -> Vec<ParticipantInfo> {
        self.roster
            .read()
            .await
            .get(&room)
            .cloned()
            .unwrap_or_default()
    }
}
