//! In-process media engine
//!
//! Single-node engine implementation behind the capability traits. Media
//! handles are plain objects with watch-channel close signals; nothing
//! here processes packets. Also carries the kill/failure hooks and
//! creation counters the test suites drive recovery scenarios with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use parley_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};

use super::{
    ConsumerHandle, EngineConfig, EngineError, Liveness, MediaEngine, ProducerHandle,
    RouterHandle, TransportHandle, WorkerHandle,
};

#[derive(Default)]
struct EngineStats {
    worker_spawn_attempts: AtomicUsize,
    workers_spawned: AtomicUsize,
    routers_created: AtomicUsize,
    transports_created: AtomicUsize,
    producers_created: AtomicUsize,
    consumers_created: AtomicUsize,
}

struct EngineShared {
    config: EngineConfig,
    stats: EngineStats,
    fail_worker_spawns: AtomicUsize,
    fail_router_creates: AtomicUsize,
    next_port: AtomicUsize,
}

impl EngineShared {
    fn allocate_port(&self) -> u16 {
        let span = self
            .config
            .rtc_max_port
            .saturating_sub(self.config.rtc_min_port)
            .max(1) as usize;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        self.config.rtc_min_port + offset as u16
    }

    fn candidate_ip(&self) -> String {
        self.config
            .announced_ip
            .clone()
            .unwrap_or_else(|| self.config.listen_ip.clone())
    }
}

/// Consumes one injected failure if any remain.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn select_codec<'a>(
    supported: &'a [RtpCodecCapability],
    requested: &RtpCapabilities,
    kind: MediaKind,
) -> Option<&'a RtpCodecCapability> {
    supported.iter().find(|router_codec| {
        router_codec.kind == kind
            && requested.codecs.iter().any(|c| {
                c.kind == kind && c.mime_type.eq_ignore_ascii_case(&router_codec.mime_type)
            })
    })
}

fn dtls_fingerprint() -> String {
    let mut bytes = Uuid::new_v4().into_bytes().to_vec();
    bytes.extend_from_slice(&Uuid::new_v4().into_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub struct InProcessEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<Arc<InProcessWorker>>>,
}

impl InProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                stats: EngineStats::default(),
                fail_worker_spawns: AtomicUsize::new(0),
                fail_router_creates: AtomicUsize::new(0),
                next_port: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a worker process crash. Returns false if the id is unknown.
    pub fn kill_worker(&self, worker_id: Uuid) -> bool {
        let worker = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.iter().find(|w| w.id == worker_id).cloned()
        };
        match worker {
            Some(w) => {
                w.kill();
                true
            }
            None => false,
        }
    }

    /// Crash every live worker.
    pub fn kill_all_workers(&self) {
        let workers: Vec<_> = {
            self.workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        for worker in workers {
            worker.kill();
        }
    }

    /// Make the next `n` worker spawns fail.
    pub fn fail_next_worker_spawns(&self, n: usize) {
        self.shared.fail_worker_spawns.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` router creations fail.
    pub fn fail_next_router_creates(&self, n: usize) {
        self.shared.fail_router_creates.store(n, Ordering::SeqCst);
    }

    pub fn worker_spawn_attempts(&self) -> usize {
        self.shared.stats.worker_spawn_attempts.load(Ordering::SeqCst)
    }

    pub fn workers_spawned(&self) -> usize {
        self.shared.stats.workers_spawned.load(Ordering::SeqCst)
    }

    pub fn routers_created(&self) -> usize {
        self.shared.stats.routers_created.load(Ordering::SeqCst)
    }

    pub fn transports_created(&self) -> usize {
        self.shared.stats.transports_created.load(Ordering::SeqCst)
    }

    pub fn producers_created(&self) -> usize {
        self.shared.stats.producers_created.load(Ordering::SeqCst)
    }

    pub fn consumers_created(&self) -> usize {
        self.shared.stats.consumers_created.load(Ordering::SeqCst)
    }
}

impl Default for InProcessEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[async_trait]
impl MediaEngine for InProcessEngine {
    async fn create_worker(&self) -> Result<Arc<dyn WorkerHandle>, EngineError> {
        self.shared
            .stats
            .worker_spawn_attempts
            .fetch_add(1, Ordering::SeqCst);

        if take_failure(&self.shared.fail_worker_spawns) {
            return Err(EngineError::Spawn("injected spawn failure".to_string()));
        }

        let (died_tx, _) = watch::channel(false);
        let worker = Arc::new(InProcessWorker {
            id: Uuid::new_v4(),
            shared: self.shared.clone(),
            died_tx,
            routers: Mutex::new(Vec::new()),
        });

        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker.clone());
        self.shared
            .stats
            .workers_spawned
            .fetch_add(1, Ordering::SeqCst);

        tracing::debug!("Spawned in-process media worker {}", worker.id);
        Ok(worker)
    }
}

struct InProcessWorker {
    id: Uuid,
    shared: Arc<EngineShared>,
    died_tx: watch::Sender<bool>,
    routers: Mutex<Vec<Arc<InProcessRouter>>>,
}

impl InProcessWorker {
    fn kill(&self) {
        self.died_tx.send_replace(true);
        let routers: Vec<_> = {
            let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
            routers.drain(..).collect()
        };
        for router in routers {
            router.close_inner();
        }
        tracing::debug!("In-process media worker {} died", self.id);
    }
}

#[async_trait]
impl WorkerHandle for InProcessWorker {
    fn id(&self) -> Uuid {
        self.id
    }

    fn liveness(&self) -> Liveness {
        if *self.died_tx.borrow() {
            Liveness::Dead
        } else {
            Liveness::Alive
        }
    }

    fn on_died(&self) -> watch::Receiver<bool> {
        self.died_tx.subscribe()
    }

    async fn create_router(&self) -> Result<Arc<dyn RouterHandle>, EngineError> {
        if *self.died_tx.borrow() {
            return Err(EngineError::Closed("worker"));
        }
        if take_failure(&self.shared.fail_router_creates) {
            return Err(EngineError::Spawn(
                "injected router creation failure".to_string(),
            ));
        }

        let (closed_tx, _) = watch::channel(false);
        let shared = self.shared.clone();
        let router = Arc::new_cyclic(|weak| InProcessRouter {
            id: Uuid::new_v4(),
            shared,
            weak_self: weak.clone(),
            closed_tx,
            producers: Mutex::new(HashMap::new()),
            transports: Mutex::new(Vec::new()),
            consumers_by_producer: Mutex::new(HashMap::new()),
        });

        self.routers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(router.clone());
        self.shared
            .stats
            .routers_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(router)
    }
}

struct ProducerEntry {
    kind: MediaKind,
    app_data: Option<Value>,
}

struct InProcessRouter {
    id: Uuid,
    shared: Arc<EngineShared>,
    weak_self: Weak<InProcessRouter>,
    closed_tx: watch::Sender<bool>,
    producers: Mutex<HashMap<Uuid, ProducerEntry>>,
    transports: Mutex<Vec<Arc<InProcessTransport>>>,
    consumers_by_producer: Mutex<HashMap<Uuid, Vec<Arc<InProcessConsumer>>>>,
}

impl std::fmt::Debug for InProcessRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessRouter")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl InProcessRouter {
    fn close_inner(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let transports: Vec<_> = {
            let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());
            transports.drain(..).collect()
        };
        for transport in transports {
            transport.close_inner();
        }
    }

    fn register_producer(&self, id: Uuid, kind: MediaKind, app_data: Option<Value>) {
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ProducerEntry { kind, app_data });
    }

    fn producer_kind(&self, id: Uuid) -> Option<MediaKind> {
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|entry| entry.kind)
    }

    fn producer_app_data(&self, id: Uuid) -> Option<Value> {
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .and_then(|entry| entry.app_data.clone())
    }

    fn register_consumer(&self, producer_id: Uuid, consumer: Arc<InProcessConsumer>) {
        self.consumers_by_producer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(producer_id)
            .or_default()
            .push(consumer);
    }

    /// Producer teardown: forget the producer and close every consumer
    /// forwarding it.
    fn producer_closed(&self, producer_id: Uuid) {
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&producer_id);
        let consumers = self
            .consumers_by_producer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&producer_id)
            .unwrap_or_default();
        for consumer in consumers {
            consumer.close_inner();
        }
    }
}

#[async_trait]
impl RouterHandle for InProcessRouter {
    fn id(&self) -> Uuid {
        self.id
    }

    fn liveness(&self) -> Liveness {
        if *self.closed_tx.borrow() {
            Liveness::Dead
        } else {
            Liveness::Alive
        }
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.shared.config.codecs.clone(),
        }
    }

    fn on_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn can_consume(&self, producer_id: Uuid, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(kind) = self.producer_kind(producer_id) else {
            return false;
        };
        select_codec(&self.shared.config.codecs, rtp_capabilities, kind).is_some()
    }

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn TransportHandle>, EngineError> {
        if *self.closed_tx.borrow() {
            return Err(EngineError::Closed("router"));
        }

        let (closed_tx, _) = watch::channel(false);
        let transport = Arc::new(InProcessTransport {
            id: Uuid::new_v4(),
            router: self.weak_self.clone(),
            closed_tx,
            ice_parameters: IceParameters {
                username_fragment: Uuid::new_v4().simple().to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "inprocess0".to_string(),
                priority: 2_113_667_327,
                ip: self.shared.candidate_ip(),
                port: self.shared.allocate_port(),
                protocol: "udp".to_string(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: dtls_fingerprint(),
                }],
            },
            remote_dtls: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });

        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(transport.clone());
        self.shared
            .stats
            .transports_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(transport)
    }

    async fn close(&self) {
        self.close_inner();
    }
}

struct InProcessTransport {
    id: Uuid,
    router: Weak<InProcessRouter>,
    closed_tx: watch::Sender<bool>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    producers: Mutex<Vec<Arc<InProcessProducer>>>,
    consumers: Mutex<Vec<Arc<InProcessConsumer>>>,
}

impl InProcessTransport {
    fn close_inner(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let producers: Vec<_> = {
            let mut producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            producers.drain(..).collect()
        };
        for producer in producers {
            producer.close_inner();
        }
        let consumers: Vec<_> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.drain(..).collect()
        };
        for consumer in consumers {
            consumer.close_inner();
        }
    }
}

#[async_trait]
impl TransportHandle for InProcessTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn on_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn connect(&self, remote_dtls: DtlsParameters) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed("transport"));
        }
        let mut slot = self.remote_dtls.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(EngineError::AlreadyConnected);
        }
        *slot = Some(remote_dtls);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Option<Value>,
    ) -> Result<Arc<dyn ProducerHandle>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed("transport"));
        }
        let router = self.router.upgrade().ok_or(EngineError::Closed("router"))?;

        let (closed_tx, _) = watch::channel(false);
        let producer = Arc::new(InProcessProducer {
            id: Uuid::new_v4(),
            kind,
            rtp_parameters,
            app_data: app_data.clone(),
            closed_tx,
            router: Arc::downgrade(&router),
        });

        router.register_producer(producer.id, kind, app_data);
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(producer.clone());
        router
            .shared
            .stats
            .producers_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed("transport"));
        }
        let router = self.router.upgrade().ok_or(EngineError::Closed("router"))?;
        let kind = router
            .producer_kind(producer_id)
            .ok_or(EngineError::UnknownProducer(producer_id))?;
        let codec = select_codec(&router.shared.config.codecs, rtp_capabilities, kind)
            .ok_or(EngineError::IncompatibleCapabilities(producer_id))?;

        let payload_type = match kind {
            MediaKind::Audio => 111,
            MediaKind::Video => 96,
        };
        let rtp_parameters = RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
            }],
            mid: None,
        };

        let (closed_tx, _) = watch::channel(false);
        let consumer = Arc::new(InProcessConsumer {
            id: Uuid::new_v4(),
            producer_id,
            kind,
            rtp_parameters,
            app_data: router.producer_app_data(producer_id),
            paused: Mutex::new(paused),
            closed_tx,
        });

        router.register_consumer(producer_id, consumer.clone());
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(consumer.clone());
        router
            .shared
            .stats
            .consumers_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(consumer)
    }

    async fn close(&self) {
        self.close_inner();
    }
}

struct InProcessProducer {
    id: Uuid,
    kind: MediaKind,
    #[allow(dead_code)]
    rtp_parameters: RtpParameters,
    app_data: Option<Value>,
    closed_tx: watch::Sender<bool>,
    router: Weak<InProcessRouter>,
}

impl InProcessProducer {
    fn close_inner(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.producer_closed(self.id);
        }
    }
}

#[async_trait]
impl ProducerHandle for InProcessProducer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn app_data(&self) -> Option<Value> {
        self.app_data.clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn on_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.close_inner();
    }
}

struct InProcessConsumer {
    id: Uuid,
    producer_id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: Option<Value>,
    paused: Mutex<bool>,
    closed_tx: watch::Sender<bool>,
}

impl InProcessConsumer {
    fn close_inner(&self) {
        self.closed_tx.send_replace(true);
    }
}

#[async_trait]
impl ConsumerHandle for InProcessConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn producer_id(&self) -> Uuid {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn app_data(&self) -> Option<Value> {
        self.app_data.clone()
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn on_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed("consumer"));
        }
        *self.paused.lock().unwrap_or_else(|e| e.into_inner()) = false;
        Ok(())
    }

    async fn close(&self) {
        self.close_inner();
    }
}
