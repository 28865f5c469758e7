//! WebRTC transport registry
//!
//! Tracks live transport handles per process and mirrors each transport
//! into the session store keyed to its owning connection. Engine-side
//! closes deregister through the `on_closed` watch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use parley_protocol::DtlsParameters;

use crate::engine::{TransportHandle, wait_closed};
use crate::error::{MediaError, Result};
use crate::media::routers::RouterRegistry;
use crate::session::{SessionStore, TransportRecord};

pub struct TransportRegistry {
    routers: Arc<RouterRegistry>,
    store: SessionStore,
    transports: Arc<RwLock<HashMap<Uuid, Arc<dyn TransportHandle>>>>,
}

impl TransportRegistry {
    pub fn new(routers: Arc<RouterRegistry>, store: SessionStore) -> Self {
        Self {
            routers,
            store,
            transports: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a transport on the caller's room router. `producing` marks
    /// the direction the client intends for it.
    pub async fn create_webrtc_transport(
        &self,
        connection_id: Uuid,
        producing: bool,
    ) -> Result<Arc<dyn TransportHandle>> {
        let peer = self
            .store
            .get_peer(connection_id)
            .await?
            .ok_or_else(|| MediaError::NotFound(format!("peer for connection {connection_id}")))?;
        let router = self
            .routers
            .get_router(peer.room_id)
            .await
            .ok_or_else(|| MediaError::NotFound(format!("router for room {}", peer.room_id)))?;

        let transport = router.create_webrtc_transport().await?;
        let transport_id = transport.id();
        self.transports
            .write()
            .await
            .insert(transport_id, transport.clone());
        self.store
            .add_transport(connection_id, &TransportRecord {
                id: transport_id,
                producing,
            })
            .await?;
        tracing::debug!(
            "Created {} transport {transport_id} for connection {connection_id}",
            if producing { "producing" } else { "consuming" }
        );

        let closed = transport.on_closed();
        let weak = Arc::downgrade(&self.transports);
        let store = self.store.clone();
        tokio::spawn(async move {
            wait_closed(closed).await;
            if let Some(transports) = weak.upgrade() {
                transports.write().await.remove(&transport_id);
            }
            if let Err(err) = store.remove_transport(connection_id, transport_id).await {
                tracing::warn!("Could not drop store record for transport {transport_id}: {err}");
            }
        });

        Ok(transport)
    }

    pub async fn connect_webrtc_transport(
        &self,
        transport_id: Uuid,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let transport = self
            .get_transport(transport_id)
            .await
            .ok_or_else(|| MediaError::NotFound(format!("transport {transport_id}")))?;
        transport.connect(dtls_parameters).await?;
        Ok(())
    }

    pub async fn get_transport(&self, transport_id: Uuid) -> Option<Arc<dyn TransportHandle>> {
        self.transports.read().await.get(&transport_id).cloned()
    }

    /// Transport records for a connection, with the live handles that are
    /// still registered locally.
    pub async fn peer_transports(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<(TransportRecord, Option<Arc<dyn TransportHandle>>)>> {
        let records = self.store.peer_transports(connection_id).await?;
        let transports = self.transports.read().await;
        Ok(records
            .into_iter()
            .map(|record| {
                let handle = transports.get(&record.id).cloned();
                (record, handle)
            })
            .collect())
    }

    pub async fn close_transport(&self, connection_id: Uuid, transport_id: Uuid) -> Result<()> {
        let transport = self.transports.write().await.remove(&transport_id);
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.store
            .remove_transport(connection_id, transport_id)
            .await?;
        Ok(())
    }

    /// Close every transport owned by a connection, store first so the
    /// list survives a crash between steps.
    pub async fn close_all_transports_for_peer(&self, connection_id: Uuid) -> Result<()> {
        let records = self.store.peer_transports(connection_id).await?;
        for record in records {
            self.close_transport(connection_id, record.id).await?;
        }
        Ok(())
    }
}
