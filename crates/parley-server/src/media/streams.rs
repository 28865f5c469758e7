//! Producer and consumer registry
//!
//! Media publication and subscription on top of the transport layer.
//! Consumers are always created paused; the client resumes explicitly
//! once its receiving pipeline is wired. New producers are fanned out to
//! the rest of the room through the `RoomEvents` notifier.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use parley_protocol::{
    MediaKind, ProducerSummary, RtpCapabilities, RtpParameters, ServerMessage,
};

use crate::engine::{ConsumerHandle, ProducerHandle, wait_closed};
use crate::error::{MediaError, Result};
use crate::media::RoomEvents;
use crate::media::routers::RouterRegistry;
use crate::media::transports::TransportRegistry;
use crate::session::{ConsumerRecord, ProducerRecord, SessionStore};

/// Everything the subscribing client needs to receive the stream.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Option<Value>,
}

pub struct MediaRegistry {
    routers: Arc<RouterRegistry>,
    transports: Arc<TransportRegistry>,
    store: SessionStore,
    notifier: Arc<dyn RoomEvents>,
    producers: Arc<RwLock<HashMap<Uuid, Arc<dyn ProducerHandle>>>>,
    consumers: Arc<RwLock<HashMap<Uuid, Arc<dyn ConsumerHandle>>>>,
}

impl MediaRegistry {
    pub fn new(
        routers: Arc<RouterRegistry>,
        transports: Arc<TransportRegistry>,
        store: SessionStore,
        notifier: Arc<dyn RoomEvents>,
    ) -> Self {
        Self {
            routers,
            transports,
            store,
            notifier,
            producers: Arc::new(RwLock::new(HashMap::new())),
            consumers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish a stream on one of the caller's transports and announce it
    /// to the rest of the room.
    pub async fn create_producer(
        &self,
        connection_id: Uuid,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Option<Value>,
    ) -> Result<Uuid> {
        let peer = self
            .store
            .get_peer(connection_id)
            .await?
            .ok_or_else(|| MediaError::NotFound(format!("peer for connection {connection_id}")))?;
        let transport = self
            .transports
            .get_transport(transport_id)
            .await
            .ok_or_else(|| MediaError::NotFound(format!("transport {transport_id}")))?;

        let producer = transport.produce(kind, rtp_parameters, app_data).await?;
        let producer_id = producer.id();
        self.producers
            .write()
            .await
            .insert(producer_id, producer.clone());
        self.store
            .add_producer(connection_id, &ProducerRecord {
                id: producer_id,
                kind,
                peer_id: peer.peer_id,
                connection_id,
            })
            .await?;
        tracing::debug!(
            "Peer {} produced {kind} stream {producer_id} in room {}",
            peer.peer_id,
            peer.room_id
        );

        self.watch_producer(connection_id, producer_id, producer.on_closed());

        self.notifier
            .broadcast_to_room(
                peer.room_id,
                Some(connection_id),
                &ServerMessage::NewProducer {
                    producer_id,
                    peer_id: peer.peer_id,
                    kind,
                },
            )
            .await;

        Ok(producer_id)
    }

    /// Subscribe the caller to another peer's producer. Capability
    /// compatibility is checked before any engine resource is allocated,
    /// and the consumer comes back paused.
    pub async fn create_consumer(
        &self,
        connection_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        if !self.producers.read().await.contains_key(&producer_id) {
            return Err(MediaError::NotFound(format!("producer {producer_id}")));
        }
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

        if !router.can_consume(producer_id, &rtp_capabilities) {
            return Err(MediaError::CapabilityMismatch { producer_id });
        }

        let transport = self
            .transports
            .peer_transports(connection_id)
            .await?
            .into_iter()
            .find_map(|(record, handle)| if record.producing { None } else { handle })
            .ok_or(MediaError::NoConsumingTransport)?;

        let consumer = transport
            .consume(producer_id, &rtp_capabilities, true)
            .await?;
        let consumer_id = consumer.id();
        self.consumers
            .write()
            .await
            .insert(consumer_id, consumer.clone());
        self.store
            .add_consumer(connection_id, &ConsumerRecord {
                id: consumer_id,
                producer_id,
                connection_id,
            })
            .await?;
        tracing::debug!(
            "Peer {} consuming producer {producer_id} via consumer {consumer_id}",
            peer.peer_id
        );

        self.watch_consumer(connection_id, consumer_id, consumer.on_closed());

        Ok(ConsumerInfo {
            id: consumer_id,
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            app_data: consumer.app_data(),
        })
    }

    pub async fn consumer(&self, consumer_id: Uuid) -> Option<Arc<dyn ConsumerHandle>> {
        self.consumers.read().await.get(&consumer_id).cloned()
    }

    /// Unpause a consumer. Only the connection that created it may
    /// resume it; anything else reports the consumer as missing.
    pub async fn resume_consumer(&self, connection_id: Uuid, consumer_id: Uuid) -> Result<()> {
        let owned = self
            .store
            .consumer_record(consumer_id)
            .await?
            .is_some_and(|record| record.connection_id == connection_id);
        if !owned {
            return Err(MediaError::NotFound(format!("consumer {consumer_id}")));
        }
        let consumer = self
            .consumers
            .read()
            .await
            .get(&consumer_id)
            .cloned()
            .ok_or_else(|| MediaError::NotFound(format!("consumer {consumer_id}")))?;
        consumer.resume().await?;
        Ok(())
    }

    /// Producers visible to a joining or listing peer, excluding the
    /// caller's own connection.
    pub async fn producers_in_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
    ) -> Result<Vec<ProducerSummary>> {
        let mut summaries = Vec::new();
        for connection_id in self.store.room_peers(room_id).await? {
            if Some(connection_id) == exclude_connection {
                continue;
            }
            for record in self.store.peer_producers(connection_id).await? {
                summaries.push(ProducerSummary {
                    id: record.id,
                    kind: record.kind,
                    peer_id: record.peer_id,
                });
            }
        }
        Ok(summaries)
    }

    pub async fn close_producer(&self, connection_id: Uuid, producer_id: Uuid) -> Result<()> {
        let producer = self.producers.write().await.remove(&producer_id);
        if let Some(producer) = producer {
            producer.close().await;
        }
        self.store
            .remove_producer(connection_id, producer_id)
            .await?;
        Ok(())
    }

    pub async fn close_consumer(&self, connection_id: Uuid, consumer_id: Uuid) -> Result<()> {
        let consumer = self.consumers.write().await.remove(&consumer_id);
        if let Some(consumer) = consumer {
            consumer.close().await;
        }
        self.store
            .remove_consumer(connection_id, consumer_id)
            .await?;
        Ok(())
    }

    /// Close every producer and consumer owned by a connection.
    pub async fn close_all_media_for_peer(&self, connection_id: Uuid) -> Result<()> {
        for record in self.store.peer_producers(connection_id).await? {
            self.close_producer(connection_id, record.id).await?;
        }
        for record in self.store.peer_consumers(connection_id).await? {
            self.close_consumer(connection_id, record.id).await?;
        }
        Ok(())
    }

    fn watch_producer(
        &self,
        connection_id: Uuid,
        producer_id: Uuid,
        closed: tokio::sync::watch::Receiver<bool>,
    ) {
        let weak = Arc::downgrade(&self.producers);
        let store = self.store.clone();
        tokio::spawn(async move {
            wait_closed(closed).await;
            if let Some(producers) = weak.upgrade() {
                producers.write().await.remove(&producer_id);
            }
            if let Err(err) = store.remove_producer(connection_id, producer_id).await {
                tracing::warn!("Could not drop store record for producer {producer_id}: {err}");
            }
        });
    }

    fn watch_consumer(
        &self,
        connection_id: Uuid,
        consumer_id: Uuid,
        closed: tokio::sync::watch::Receiver<bool>,
    ) {
        let weak = Arc::downgrade(&self.consumers);
        let store = self.store.clone();
        tokio::spawn(async move {
            wait_closed(closed).await;
            if let Some(consumers) = weak.upgrade() {
                consumers.write().await.remove(&consumer_id);
            }
            if let Err(err) = store.remove_consumer(connection_id, consumer_id).await {
                tracing::warn!("Could not drop store record for consumer {consumer_id}: {err}");
            }
        });
    }
}
