use crate::peer::types::IceCandidate;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Удалённые кандидаты, пришедшие раньше remote description.
#[derive(Default)]
pub struct PendingCandidates {
    inner: Mutex<Vec<IceCandidate>>,
}

impl PendingCandidates {
    fn lock(&self) -> MutexGuard<'_, Vec<IceCandidate>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push(&self, candidate: IceCandidate) {
        let mut pending = self.lock();
        pending.push(candidate);
        debug!("remote description not set yet, {} candidate(s) held", pending.len());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Applies every held candidate after the remote description is set.
    pub async fn apply(&self, pc: &RTCPeerConnection) {
        let candidates = std::mem::take(&mut *self.lock());
        if candidates.is_empty() {
            return;
        }
        info!("applying {} pending candidate(s)", candidates.len());
        for candidate in candidates {
            if let Err(e) = pc.add_ice_candidate(to_init(candidate)).await {
                warn!("failed to apply pending candidate: {e}");
            }
        }
    }
}

pub fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

/// host / srflx / relay
pub fn candidate_kind(candidate: &str) -> &'static str {
    if candidate.contains("typ host") {
        "host"
    } else if candidate.contains("typ srflx") {
        "srflx"
    } else if candidate.contains("typ relay") {
        "relay"
    } else if candidate.contains("typ prflx") {
        "prflx"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(kind: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 1 10.0.0.1 9 typ {kind}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn classifies_candidates() {
        assert_eq!(candidate_kind(&cand("host").candidate), "host");
        assert_eq!(candidate_kind(&cand("relay").candidate), "relay");
        assert_eq!(candidate_kind("garbage"), "unknown");
    }

    #[test]
    fn holds_and_clears() {
        let pending = PendingCandidates::default();
        pending.push(cand("host"));
        pending.push(cand("srflx"));
        assert_eq!(pending.len(), 2);
        pending.clear();
        assert!(pending.is_empty());
    }

    #[test]
    fn init_keeps_mid_and_index() {
        let init = to_init(cand("host"));
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.username_fragment.is_none());
    }
}
