//! Media engine capability seam
//!
//! The orchestration layer never touches RTP/ICE/DTLS internals; it only
//! creates, configures and tears down opaque handles obtained through the
//! traits below. Close cascades (worker → router → transport →
//! producer/consumer, and producer → its consumers) happen inside the
//! engine; registries observe `on_closed` watches to deregister.

mod inprocess;

pub use inprocess::InProcessEngine;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use parley_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("transport already connected")]
    AlreadyConnected,

    #[error("unknown producer {0}")]
    UnknownProducer(Uuid),

    #[error("rtp capabilities cannot consume producer {0}")]
    IncompatibleCapabilities(Uuid),
}

/// Explicit liveness query for engine-owned resources.
///
/// `Unknown` means the engine could not determine the state (e.g. a probe
/// failed); callers treat it the same as `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

impl Liveness {
    pub fn is_dead(self) -> bool {
        !matches!(self, Liveness::Alive)
    }
}

/// Engine-side settings shared by all workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 10_000,
            rtc_max_port: 11_000,
            codecs: default_codecs(),
        }
    }
}

/// Default negotiable codec set: Opus for audio, VP8 and H.264 for video.
pub fn default_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: None,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: Some(serde_json::json!({ "x-google-start-bitrate": 1000 })),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: Some(serde_json::json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
            })),
        },
    ]
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn one isolated worker process.
    async fn create_worker(&self) -> Result<std::sync::Arc<dyn WorkerHandle>, EngineError>;
}

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> Uuid;

    fn liveness(&self) -> Liveness;

    /// Resolves to `true` when the worker process dies.
    fn on_died(&self) -> watch::Receiver<bool>;

    async fn create_router(&self) -> Result<std::sync::Arc<dyn RouterHandle>, EngineError>;
}

#[async_trait]
pub trait RouterHandle: Send + Sync + std::fmt::Debug {
    fn id(&self) -> Uuid;

    fn liveness(&self) -> Liveness;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    fn on_closed(&self) -> watch::Receiver<bool>;

    /// Whether `rtp_capabilities` are compatible with the given producer.
    fn can_consume(&self, producer_id: Uuid, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
    ) -> Result<std::sync::Arc<dyn TransportHandle>, EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> Uuid;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    fn is_closed(&self) -> bool;

    fn on_closed(&self) -> watch::Receiver<bool>;

    async fn connect(&self, remote_dtls: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Option<Value>,
    ) -> Result<std::sync::Arc<dyn ProducerHandle>, EngineError>;

    async fn consume(
        &self,
        producer_id: Uuid,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<std::sync::Arc<dyn ConsumerHandle>, EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    fn app_data(&self) -> Option<Value>;

    fn is_closed(&self) -> bool;

    fn on_closed(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> Uuid;

    fn producer_id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn app_data(&self) -> Option<Value>;

    fn is_paused(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn on_closed(&self) -> watch::Receiver<bool>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Await a close signal; resolves immediately if already closed or the
/// sender is gone.
pub async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
