//! Persistence collaborator for the canonical room position.
//!
//! Study groups, sessions and invitations live in the application's own
//! database; the collaboration core only needs to save the settled position
//! of a room and read it back when someone enters.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::protocol::RoomId;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Position store unavailable: {0}")]
    Unavailable(String),
}

/// Saves and loads the canonical position of a room.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn save_position(&self, room: RoomId, position: &str) -> Result<(), StoreError>;
    async fn load_position(&self, room: RoomId) -> Result<Option<String>, StoreError>;
}

/// In-memory position store.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: RwLock<HashMap<RoomId, String>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rooms with a stored position.
    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn save_position(&self, room: RoomId, position: &str) -> Result<(), StoreError> {
        self.positions
            .write()
            .await
            .insert(room, position.to_string());
        Ok(())
    }

    async fn load_position(&self, room: RoomId) -> Result<Option<String>, StoreError> {
        Ok(self.positions.read().await.get(&room).cloned())
    }
}
