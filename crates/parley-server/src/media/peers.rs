//! Peer registry
//!
//! Thin layer over the session store for peer identity and room
//! membership. Peer ids are freshly minted UUIDs, independent of the
//! connection id carrying the peer.

use chrono::Utc;
use uuid::Uuid;

use parley_protocol::PeerSummary;

use crate::error::Result;
use crate::session::{PeerRecord, SessionStore};

pub struct PeerRegistry {
    store: SessionStore,
}

impl PeerRegistry {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub async fn add_peer(
        &self,
        room_id: Uuid,
        user_id: Option<Uuid>,
        peer_name: String,
        connection_id: Uuid,
    ) -> Result<PeerRecord> {
        let record = PeerRecord {
            room_id,
            peer_id: Uuid::new_v4(),
            user_id,
            peer_name,
            connection_id,
            joined_at: Utc::now(),
        };
        self.store.put_peer(&record).await?;
        tracing::info!(
            "Peer {} ({}) joined room {room_id} on connection {connection_id}",
            record.peer_id,
            record.peer_name
        );
        Ok(record)
    }

    pub async fn get_peer_by_connection(&self, connection_id: Uuid) -> Result<Option<PeerRecord>> {
        Ok(self.store.get_peer(connection_id).await?)
    }

    /// Other peers in the room, excluding the given connection.
    pub async fn existing_peers_in_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
    ) -> Result<Vec<PeerSummary>> {
        let mut peers = Vec::new();
        for connection_id in self.store.room_peers(room_id).await? {
            if Some(connection_id) == exclude_connection {
                continue;
            }
            if let Some(record) = self.store.get_peer(connection_id).await? {
                peers.push(PeerSummary {
                    peer_id: record.peer_id,
                    peer_name: record.peer_name,
                    joined_at: record.joined_at,
                });
            }
        }
        Ok(peers)
    }

    /// Drop the peer record and everything keyed under its connection.
    pub async fn remove_peer(&self, connection_id: Uuid) -> Result<()> {
        self.store.cleanup_peer(connection_id).await?;
        Ok(())
    }
}
