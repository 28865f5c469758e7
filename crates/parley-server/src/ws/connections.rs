use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_protocol::ServerMessage;

use crate::media::RoomEvents;

/// Tracks live WebSocket connections and room membership for fan-out.
pub struct ConnectionManager {
    /// connection_id -> outbound message sender
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// room_id -> connection ids in that room
    room_members: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// connection_id -> room it joined
    connection_rooms: RwLock<HashMap<Uuid, Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: RwLock::new(HashMap::new()),
            room_members: RwLock::new(HashMap::new()),
            connection_rooms: RwLock::new(HashMap::new()),
        })
    }

    pub async fn add_connection(&self, connection_id: Uuid, tx: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(connection_id, tx);
        tracing::debug!("Connection {connection_id} registered");
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        self.senders.write().await.remove(&connection_id);
        self.leave_room(connection_id).await;
        tracing::debug!("Connection {connection_id} removed");
    }

    pub async fn join_room(&self, connection_id: Uuid, room_id: Uuid) {
        self.room_members
            .write()
            .await
            .entry(room_id)
            .or_default()
            .insert(connection_id);
        self.connection_rooms
            .write()
            .await
            .insert(connection_id, room_id);
    }

    /// Detach the connection from its room. Returns the room it was in,
    /// and whether the room is now empty.
    pub async fn leave_room(&self, connection_id: Uuid) -> Option<(Uuid, bool)> {
        let room_id = self.connection_rooms.write().await.remove(&connection_id)?;
        let mut rooms = self.room_members.write().await;
        let emptied = match rooms.get_mut(&room_id) {
            Some(members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            rooms.remove(&room_id);
        }
        Some((room_id, emptied))
    }

    pub async fn room_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connection_rooms
            .read()
            .await
            .get(&connection_id)
            .copied()
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("Failed to serialize message for {connection_id}: {err}");
                return;
            }
        };
        let sender = self.senders.read().await.get(&connection_id).cloned();
        if let Some(tx) = sender {
            if tx.send(payload).is_err() {
                tracing::debug!("Connection {connection_id} gone, dropping message");
            }
        }
    }
}

#[async_trait]
impl RoomEvents for ConnectionManager {
    async fn broadcast_to_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
        message: &ServerMessage,
    ) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("Failed to serialize broadcast for room {room_id}: {err}");
                return;
            }
        };
        let members: Vec<Uuid> = {
            let rooms = self.room_members.read().await;
            rooms
                .get(&room_id)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default()
        };
        let senders = self.senders.read().await;
        for connection_id in members {
            if Some(connection_id) == exclude_connection {
                continue;
            }
            if let Some(tx) = senders.get(&connection_id) {
                let _ = tx.send(payload.clone());
            }
        }
    }
}
