//! Parley Signaling Protocol
//!
//! Shared message and parameter types exchanged between clients and the
//! media session server over the WebSocket signaling transport.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    PeerSummary, ProducerSummary, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpParameters,
};
