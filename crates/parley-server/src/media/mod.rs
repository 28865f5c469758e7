//! Media session orchestration
//!
//! `MediaSessions` is the single entry point the signaling layer talks
//! to. It wires the worker pool, router, transport, stream and peer
//! registries together and serializes mutating operations per peer so
//! interleaved requests from one connection cannot corrupt its state.

pub mod peers;
pub mod routers;
pub mod streams;
pub mod transports;
pub mod workers;

pub use streams::ConsumerInfo;
pub use workers::RetryPolicy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use parley_protocol::{
    DtlsParameters, MediaKind, PeerSummary, ProducerSummary, RtpCapabilities, RtpParameters,
    ServerMessage,
};

use crate::engine::{MediaEngine, RouterHandle, TransportHandle};
use crate::error::Result;
use crate::session::{PeerRecord, SessionStore};

use peers::PeerRegistry;
use routers::RouterRegistry;
use streams::MediaRegistry;
use transports::TransportRegistry;
use workers::WorkerPool;

/// Outbound room fan-out, implemented by the signaling layer.
#[async_trait]
pub trait RoomEvents: Send + Sync {
    async fn broadcast_to_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
        message: &ServerMessage,
    );
}

/// Per-key async mutexes, created on first use and discarded explicitly.
struct KeyedLocks {
    inner: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn new() -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, key: Uuid) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.entry(key).or_default().clone()
        };
        mutex.lock_owned().await
    }

    fn discard(&self, key: Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

pub struct MediaSessions {
    workers: Arc<WorkerPool>,
    routers: Arc<RouterRegistry>,
    transports: Arc<TransportRegistry>,
    media: MediaRegistry,
    peers: PeerRegistry,
    locks: KeyedLocks,
}

impl MediaSessions {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        store: SessionStore,
        notifier: Arc<dyn RoomEvents>,
        pool_size: usize,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let workers = WorkerPool::new(engine, pool_size, retry);
        let routers = Arc::new(RouterRegistry::new(workers.clone(), store.clone()));
        let transports = Arc::new(TransportRegistry::new(routers.clone(), store.clone()));
        let media = MediaRegistry::new(
            routers.clone(),
            transports.clone(),
            store.clone(),
            notifier,
        );
        let peers = PeerRegistry::new(store);
        Arc::new(Self {
            workers,
            routers,
            transports,
            media,
            peers,
            locks: KeyedLocks::new(),
        })
    }

    /// Spawn the worker pool. Must run before any room is created.
    pub async fn initialize(&self) -> Result<()> {
        self.workers.initialize().await
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub async fn get_or_create_room(&self, room_id: Uuid) -> Result<Arc<dyn RouterHandle>> {
        self.routers.get_or_create_room(room_id).await
    }

    pub async fn get_router_rtp_capabilities(&self, room_id: Uuid) -> Result<RtpCapabilities> {
        self.routers.get_rtp_capabilities(room_id).await
    }

    pub async fn add_peer(
        &self,
        room_id: Uuid,
        user_id: Option<Uuid>,
        peer_name: String,
        connection_id: Uuid,
    ) -> Result<PeerRecord> {
        let _guard = self.locks.lock(connection_id).await;
        self.peers
            .add_peer(room_id, user_id, peer_name, connection_id)
            .await
    }

    pub async fn get_peer_by_connection(&self, connection_id: Uuid) -> Result<Option<PeerRecord>> {
        self.peers.get_peer_by_connection(connection_id).await
    }

    pub async fn existing_peers_in_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
    ) -> Result<Vec<PeerSummary>> {
        self.peers
            .existing_peers_in_room(room_id, exclude_connection)
            .await
    }

    pub async fn producers_in_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
    ) -> Result<Vec<ProducerSummary>> {
        self.media
            .producers_in_room(room_id, exclude_connection)
            .await
    }

    pub async fn create_webrtc_transport(
        &self,
        connection_id: Uuid,
        producing: bool,
    ) -> Result<Arc<dyn TransportHandle>> {
        let _guard = self.locks.lock(connection_id).await;
        self.transports
            .create_webrtc_transport(connection_id, producing)
            .await
    }

    pub async fn connect_webrtc_transport(
        &self,
        connection_id: Uuid,
        transport_id: Uuid,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let _guard = self.locks.lock(connection_id).await;
        self.transports
            .connect_webrtc_transport(transport_id, dtls_parameters)
            .await
    }

    pub async fn produce(
        &self,
        connection_id: Uuid,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Option<Value>,
    ) -> Result<Uuid> {
        let _guard = self.locks.lock(connection_id).await;
        self.media
            .create_producer(connection_id, transport_id, kind, rtp_parameters, app_data)
            .await
    }

    pub async fn consume(
        &self,
        connection_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let _guard = self.locks.lock(connection_id).await;
        self.media
            .create_consumer(connection_id, producer_id, rtp_capabilities)
            .await
    }

    pub async fn consumer_handle(
        &self,
        consumer_id: Uuid,
    ) -> Option<Arc<dyn crate::engine::ConsumerHandle>> {
        self.media.consumer(consumer_id).await
    }

    pub async fn resume_consumer(&self, connection_id: Uuid, consumer_id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(connection_id).await;
        self.media.resume_consumer(connection_id, consumer_id).await
    }

    /// Tear down everything a connection owns. Media handles close
    /// first, then transports, and the peer record goes last so a crash
    /// mid-teardown leaves the record for the TTL backstop to reap.
    pub async fn close_peer(&self, connection_id: Uuid) -> Result<()> {
        {
            let _guard = self.locks.lock(connection_id).await;
            self.media.close_all_media_for_peer(connection_id).await?;
            self.transports
                .close_all_transports_for_peer(connection_id)
                .await?;
            self.peers.remove_peer(connection_id).await?;
        }
        self.locks.discard(connection_id);
        tracing::info!("Closed peer session for connection {connection_id}");
        Ok(())
    }

    pub async fn close_room(&self, room_id: Uuid) -> Result<()> {
        self.routers.close_room(room_id).await
    }
}
