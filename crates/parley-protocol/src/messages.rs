use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, PeerSummary, ProducerSummary,
    RtpCapabilities, RtpParameters,
};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a room identified by its short user-facing code
    JoinRoom {
        room_code: String,
        #[serde(default)]
        user_id: Option<Uuid>,
        peer_name: String,
    },

    /// Leave the currently joined room
    LeaveRoom,

    /// Query a room router's negotiable capabilities
    GetRouterRtpCapabilities { room_id: Uuid },

    /// Open a new WebRTC transport, tagged producing or consuming
    CreateWebrtcTransport { producing: bool },

    /// Apply the remote DTLS parameters to an open transport
    ConnectWebrtcTransport {
        transport_id: Uuid,
        dtls_parameters: DtlsParameters,
    },

    /// Publish an inbound media stream on a transport
    Produce {
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: Option<serde_json::Value>,
    },

    /// Subscribe to another peer's producer
    Consume {
        producer_id: Uuid,
        rtp_capabilities: RtpCapabilities,
    },

    /// Unpause a consumer once the receiving side is ready
    ResumeConsumer { consumer_id: Uuid },

    /// List the other peers in the current room
    GetPeers,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Room joined; seeds the client with existing producers and peers
    JoinRoomSuccess {
        room_id: Uuid,
        rtp_capabilities: RtpCapabilities,
        existing_producers: Vec<ProducerSummary>,
        existing_peers: Vec<PeerSummary>,
    },

    /// Room join failed
    JoinRoomError { message: String },

    /// Leave acknowledged; always emitted so the client can finalize
    LeaveRoomSuccess,

    /// Another peer joined the room
    NewPeer { peer_id: Uuid, peer_name: String },

    /// A peer left the room or disconnected
    PeerLeft { peer_id: Uuid },

    /// Another peer published a new producer
    NewProducer {
        producer_id: Uuid,
        peer_id: Uuid,
        kind: MediaKind,
    },

    /// Router capability query result
    RouterRtpCapabilities {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_capabilities: Option<RtpCapabilities>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Transport creation result
    WebrtcTransportCreated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_parameters: Option<IceParameters>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_candidates: Option<Vec<IceCandidate>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dtls_parameters: Option<DtlsParameters>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Transport connect result
    WebrtcTransportConnected {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Produce result
    Produced {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Consume result; the consumer starts paused
    Consumed {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<MediaKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_parameters: Option<RtpParameters>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Consumer resume result
    ConsumerResumed {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The other peers in the caller's room
    PeersList { peers: Vec<PeerSummary> },

    /// Request could not be understood at all
    Error { message: String },
}
