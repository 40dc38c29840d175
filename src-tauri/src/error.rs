use crate::session::CallState;
use thiserror::Error;

/// Failures of the signaling transport as seen by its consumers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("participant {0} is unreachable")]
    Unreachable(String),
    #[error("signaling transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("call rejected by signaling: {0} did not accept the request")]
    NotDelivered(String),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(CallState),
    #[error("ui dispatcher is gone")]
    Dispatcher,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("media engine is not attached")]
    NotAttached,
    #[error("malformed negotiation message: {0}")]
    Malformed(String),
    #[error("unknown negotiation action: {0}")]
    UnknownAction(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no peer connection")]
    NoPeer,
    #[error("no remote offer to answer")]
    NoRemoteOffer,
    #[error("unsupported session description type: {0}")]
    InvalidDescription(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ICE server {0}: url cannot be empty")]
    EmptyUrl(String),
    #[error("ICE server {0}: TURN servers require username and credential")]
    MissingCredentials(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Malformed(e.to_string())
    }
}
