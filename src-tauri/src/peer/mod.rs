pub mod connection;
pub mod ice;
pub mod queue;
pub mod shim;
pub mod types;

pub use connection::WebRtcPeer;
pub use queue::{IngressFrame, NavigationFrame, PendingMessageQueue};
pub use shim::{Delivery, MediaEngineShim, PeerEngine, PeerEvent, PeerEventSink};
pub use types::{IceCandidate, ServerConfig, SessionDescription};
