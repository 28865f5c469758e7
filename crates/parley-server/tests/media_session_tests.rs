use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use parley_protocol::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    ServerMessage,
};
use parley_server::MediaError;
use parley_server::engine::{InProcessEngine, default_codecs};
use parley_server::media::{MediaSessions, RetryPolicy, RoomEvents, workers::WorkerPool};
use parley_server::session::{KvOp, MemoryKv, SessionKv, SessionStore, StoreError};

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<(Uuid, Option<Uuid>, ServerMessage)>>,
}

#[async_trait]
impl RoomEvents for RecordingEvents {
    async fn broadcast_to_room(
        &self,
        room_id: Uuid,
        exclude_connection: Option<Uuid>,
        message: &ServerMessage,
    ) {
        self.events
            .lock()
            .await
            .push((room_id, exclude_connection, message.clone()));
    }
}

/// Store backend that can reject router record writes on demand.
#[derive(Default)]
struct FlakyKv {
    inner: MemoryKv,
    fail_router_writes: AtomicBool,
}

#[async_trait]
impl SessionKv for FlakyKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.inner.mget(keys).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let touches_router_key = ops.iter().any(|op| {
            matches!(op, KvOp::SetEx { key, .. }
                if key.starts_with("room:") && key.ends_with(":router"))
        });
        if touches_router_key && self.fail_router_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Serde(
                serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
            ));
        }
        self.inner.apply(ops).await
    }
}

struct Harness {
    media: Arc<MediaSessions>,
    engine: Arc<InProcessEngine>,
    store: SessionStore,
    events: Arc<RecordingEvents>,
}

fn harness(pool_size: usize) -> Harness {
    let engine = Arc::new(InProcessEngine::default());
    let kv = Arc::new(MemoryKv::new());
    let store = SessionStore::new(kv, Duration::from_secs(3600));
    let events = Arc::new(RecordingEvents::default());
    let media = MediaSessions::new(
        engine.clone(),
        store.clone(),
        events.clone(),
        pool_size,
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(20),
        },
    );
    Harness {
        media,
        engine,
        store,
        events,
    }
}

fn full_caps() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_codecs(),
    }
}

fn video_only_caps() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: None,
        }],
    }
}

fn audio_params() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
            channels: Some(2),
        }],
        mid: Some("0".to_string()),
    }
}

async fn join(h: &Harness, room_id: Uuid, name: &str) -> Uuid {
    let connection_id = Uuid::new_v4();
    h.media.get_or_create_room(room_id).await.unwrap();
    h.media
        .add_peer(room_id, None, name.to_string(), connection_id)
        .await
        .unwrap();
    connection_id
}

#[tokio::test]
async fn concurrent_room_creation_yields_one_router() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let media = h.media.clone();
        tasks.spawn(async move { media.get_or_create_room(room_id).await });
    }

    let mut router_ids = Vec::new();
    while let Some(result) = tasks.join_next().await {
        router_ids.push(result.unwrap().unwrap().id());
    }

    assert_eq!(router_ids.len(), 16);
    assert!(router_ids.iter().all(|id| *id == router_ids[0]));
    assert_eq!(h.engine.routers_created(), 1);
}

#[tokio::test]
async fn failed_room_creation_recovers_on_retry() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();

    h.engine.fail_next_router_creates(1);
    assert!(h.media.get_or_create_room(room_id).await.is_err());
    assert_eq!(h.engine.routers_created(), 0);

    let router = h.media.get_or_create_room(room_id).await.unwrap();
    assert_eq!(h.engine.routers_created(), 1);
    assert!(!router.liveness().is_dead());
}

#[tokio::test]
async fn failed_router_record_write_leaves_no_residue() {
    let engine = Arc::new(InProcessEngine::default());
    let kv = Arc::new(FlakyKv::default());
    let store = SessionStore::new(kv.clone(), Duration::from_secs(3600));
    let events = Arc::new(RecordingEvents::default());
    let media = MediaSessions::new(
        engine.clone(),
        store.clone(),
        events,
        2,
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(20),
        },
    );
    media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();

    kv.fail_router_writes.store(true, Ordering::SeqCst);
    assert!(media.get_or_create_room(room_id).await.is_err());

    // Nothing of the failed creation survives: no registered router,
    // no capabilities, no store record.
    assert!(media.get_router_rtp_capabilities(room_id).await.is_err());
    assert!(store.room_router(room_id).await.unwrap().is_none());

    kv.fail_router_writes.store(false, Ordering::SeqCst);
    let router = media.get_or_create_room(room_id).await.unwrap();
    assert!(!router.liveness().is_dead());
    assert_eq!(store.room_router(room_id).await.unwrap(), Some(router.id()));
    assert_eq!(engine.routers_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn worker_death_clears_room_router_record() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();

    let router = h.media.get_or_create_room(room_id).await.unwrap();
    assert_eq!(
        h.store.room_router(room_id).await.unwrap(),
        Some(router.id())
    );

    h.engine.kill_all_workers();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.media.get_router_rtp_capabilities(room_id).await.is_err());
    assert!(h.store.room_router(room_id).await.unwrap().is_none());
}

#[tokio::test]
async fn producing_announces_to_room_except_publisher() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_a = join(&h, room_id, "Alice").await;

    let transport = h
        .media
        .create_webrtc_transport(conn_a, true)
        .await
        .unwrap();
    let producer_id = h
        .media
        .produce(conn_a, transport.id(), MediaKind::Audio, audio_params(), None)
        .await
        .unwrap();

    let events = h.events.events.lock().await;
    let announced = events.iter().any(|(room, exclude, message)| {
        *room == room_id
            && *exclude == Some(conn_a)
            && matches!(message, ServerMessage::NewProducer { producer_id: id, .. } if *id == producer_id)
    });
    assert!(announced);
}

#[tokio::test]
async fn consumer_starts_paused_and_resumes() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_a = join(&h, room_id, "Alice").await;
    let conn_b = join(&h, room_id, "Bob").await;

    let send_transport = h
        .media
        .create_webrtc_transport(conn_a, true)
        .await
        .unwrap();
    let producer_id = h
        .media
        .produce(conn_a, send_transport.id(), MediaKind::Audio, audio_params(), None)
        .await
        .unwrap();

    h.media
        .create_webrtc_transport(conn_b, false)
        .await
        .unwrap();
    let info = h
        .media
        .consume(conn_b, producer_id, full_caps())
        .await
        .unwrap();
    assert_eq!(info.producer_id, producer_id);
    assert_eq!(info.kind, MediaKind::Audio);

    let consumer = h.media.consumer_handle(info.id).await.unwrap();
    assert!(consumer.is_paused());

    h.media.resume_consumer(conn_b, info.id).await.unwrap();
    assert!(!consumer.is_paused());
}

#[tokio::test]
async fn only_the_owning_connection_can_resume_a_consumer() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_a = join(&h, room_id, "Alice").await;
    let conn_b = join(&h, room_id, "Bob").await;

    let send_transport = h
        .media
        .create_webrtc_transport(conn_a, true)
        .await
        .unwrap();
    let producer_id = h
        .media
        .produce(conn_a, send_transport.id(), MediaKind::Audio, audio_params(), None)
        .await
        .unwrap();
    h.media
        .create_webrtc_transport(conn_b, false)
        .await
        .unwrap();
    let info = h
        .media
        .consume(conn_b, producer_id, full_caps())
        .await
        .unwrap();

    let err = h.media.resume_consumer(conn_a, info.id).await.unwrap_err();
    assert!(matches!(err, MediaError::NotFound(_)));
    let consumer = h.media.consumer_handle(info.id).await.unwrap();
    assert!(consumer.is_paused());

    h.media.resume_consumer(conn_b, info.id).await.unwrap();
    assert!(!consumer.is_paused());
}

#[tokio::test]
async fn capability_mismatch_allocates_nothing() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_a = join(&h, room_id, "Alice").await;
    let conn_b = join(&h, room_id, "Bob").await;

    let send_transport = h
        .media
        .create_webrtc_transport(conn_a, true)
        .await
        .unwrap();
    let producer_id = h
        .media
        .produce(conn_a, send_transport.id(), MediaKind::Audio, audio_params(), None)
        .await
        .unwrap();

    h.media
        .create_webrtc_transport(conn_b, false)
        .await
        .unwrap();
    let err = h
        .media
        .consume(conn_b, producer_id, video_only_caps())
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::CapabilityMismatch { producer_id: id } if id == producer_id));
    assert_eq!(h.engine.consumers_created(), 0);
}

#[tokio::test]
async fn consuming_requires_a_consuming_transport() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_a = join(&h, room_id, "Alice").await;
    let conn_b = join(&h, room_id, "Bob").await;

    let send_transport = h
        .media
        .create_webrtc_transport(conn_a, true)
        .await
        .unwrap();
    let producer_id = h
        .media
        .produce(conn_a, send_transport.id(), MediaKind::Audio, audio_params(), None)
        .await
        .unwrap();

    // Bob only has a producing transport.
    h.media
        .create_webrtc_transport(conn_b, true)
        .await
        .unwrap();
    let err = h
        .media
        .consume(conn_b, producer_id, full_caps())
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::NoConsumingTransport));
    assert_eq!(h.engine.consumers_created(), 0);
}

#[tokio::test]
async fn consuming_unknown_producer_is_not_found() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_b = join(&h, room_id, "Bob").await;
    h.media
        .create_webrtc_transport(conn_b, false)
        .await
        .unwrap();

    let err = h
        .media
        .consume(conn_b, Uuid::new_v4(), full_caps())
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::NotFound(_)));
}

#[tokio::test]
async fn close_peer_tears_down_media_transports_then_record() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();
    let conn_a = join(&h, room_id, "Alice").await;
    let conn_b = join(&h, room_id, "Bob").await;

    let send_transport = h
        .media
        .create_webrtc_transport(conn_a, true)
        .await
        .unwrap();
    let producer_id = h
        .media
        .produce(conn_a, send_transport.id(), MediaKind::Audio, audio_params(), None)
        .await
        .unwrap();
    h.media
        .create_webrtc_transport(conn_b, false)
        .await
        .unwrap();
    let info = h
        .media
        .consume(conn_b, producer_id, full_caps())
        .await
        .unwrap();

    h.media.close_peer(conn_a).await.unwrap();

    assert!(h.store.get_peer(conn_a).await.unwrap().is_none());
    assert!(h.store.peer_transports(conn_a).await.unwrap().is_empty());
    assert!(h.store.peer_producers(conn_a).await.unwrap().is_empty());
    assert!(!h.store.room_peers(room_id).await.unwrap().contains(&conn_a));

    // Alice's producer closing cascades into Bob's consumer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.media.consumer_handle(info.id).await.is_none());
    assert!(h.store.peer_consumers(conn_b).await.unwrap().is_empty());
    assert!(
        h.media
            .producers_in_room(room_id, None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(start_paused = true)]
async fn dead_workers_are_replaced() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    assert_eq!(h.media.workers().live_worker_count().await, 2);

    h.engine.kill_all_workers();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.media.workers().live_worker_count().await, 2);
    assert_eq!(h.engine.worker_spawn_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_reports_no_workers() {
    let h = harness(1);
    h.media.initialize().await.unwrap();

    h.engine.fail_next_worker_spawns(10);
    h.engine.kill_all_workers();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let err = h.media.get_or_create_room(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err.root(), MediaError::NoWorkersAvailable));
    // 1 initial spawn plus 3 failed replacement attempts.
    assert_eq!(h.engine.worker_spawn_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn room_router_on_dead_worker_is_recreated() {
    let h = harness(2);
    h.media.initialize().await.unwrap();
    let room_id = Uuid::new_v4();

    let old_router = h.media.get_or_create_room(room_id).await.unwrap();
    h.engine.kill_all_workers();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let new_router = h.media.get_or_create_room(room_id).await.unwrap();
    assert_ne!(new_router.id(), old_router.id());
    assert!(!new_router.liveness().is_dead());
    assert!(old_router.liveness().is_dead());
    assert_eq!(h.engine.routers_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn worker_spawn_retries_until_success() {
    let engine = Arc::new(InProcessEngine::default());
    engine.fail_next_worker_spawns(2);

    let pool = WorkerPool::new(engine.clone(), 1, RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(20),
    });
    pool.initialize().await.unwrap();

    assert_eq!(engine.worker_spawn_attempts(), 3);
    assert_eq!(engine.workers_spawned(), 1);
}

#[tokio::test]
async fn workers_are_handed_out_round_robin() {
    let engine = Arc::new(InProcessEngine::default());
    let pool = WorkerPool::new(engine, 2, RetryPolicy::default());
    pool.initialize().await.unwrap();

    let first = pool.get_worker().await.unwrap();
    let second = pool.get_worker().await.unwrap();
    let third = pool.get_worker().await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(first.id(), third.id());
}
