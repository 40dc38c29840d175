use crate::error::PeerError;
use crate::peer::ice::{to_init, PendingCandidates};
use crate::peer::shim::{PeerEngine, PeerEvent, PeerEventSink};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "visiocall-local";

/// Локальный трек + его sender (для mute через replace_track)
struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
    enabled: bool,
}

impl LocalTrack {
    async fn add(
        pc: &RTCPeerConnection,
        mime_type: &str,
        clock_rate: u32,
        channels: u16,
        id: &str,
    ) -> Result<Self, PeerError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(Self {
            track,
            sender,
            enabled: true,
        })
    }

    async fn toggle(&mut self) -> Result<bool, PeerError> {
        let next = if self.enabled {
            None
        } else {
            Some(self.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        };
        self.sender.replace_track(next).await?;
        self.enabled = !self.enabled;
        Ok(self.enabled)
    }
}

struct PeerSlot {
    pc: Arc<RTCPeerConnection>,
    audio: LocalTrack,
    video: LocalTrack,
}

/// [`PeerEngine`] на webrtc-rs: один peer connection с аудио (opus) и видео (VP8).
pub struct WebRtcPeer {
    ice_servers: std::sync::Mutex<Vec<ServerConfig>>,
    slot: Mutex<Option<PeerSlot>>,
    pending: PendingCandidates,
    open: AtomicBool,
}

impl WebRtcPeer {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self {
            ice_servers: std::sync::Mutex::new(ice_servers),
            slot: Mutex::new(None),
            pending: PendingCandidates::default(),
            open: AtomicBool::new(false),
        }
    }

    /// Takes effect for the next connection.
    pub fn set_ice_servers(&self, servers: Vec<ServerConfig>) {
        info!("Setting {} custom ICE servers", servers.len());
        *self.ice_servers.lock().unwrap_or_else(|p| p.into_inner()) = servers;
    }

    pub fn ice_servers(&self) -> Vec<ServerConfig> {
        self.ice_servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    async fn peer(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|s| s.pc.clone())
            .ok_or(PeerError::NoPeer)
    }

    async fn set_remote(
        &self,
        pc: &RTCPeerConnection,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        pc.set_remote_description(to_rtc(desc)?).await?;
        self.pending.apply(pc).await;
        Ok(())
    }

    async fn answer(&self, pc: &RTCPeerConnection) -> Result<SessionDescription, PeerError> {
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }
}

#[async_trait]
impl PeerEngine for WebRtcPeer {
    async fn open(&self, events: PeerEventSink) -> Result<(), PeerError> {
        self.close().await;

        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = rtc_config(&self.ice_servers());
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let audio = LocalTrack::add(&pc, MIME_TYPE_OPUS, 48000, 2, "audio").await?;
        let video = LocalTrack::add(&pc, MIME_TYPE_VP8, 90000, 0, "video").await?;

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand.map(|c| c.to_json()) {
                Some(Ok(init)) => {
                    let _ = candidates.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Some(Err(e)) => warn!("local candidate not serializable: {e}"),
                // cand == None означает конец сбора
                None => debug!("ICE candidate gathering completed"),
            }
            Box::pin(async {})
        }));

        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            info!("ICE connection state changed to: {st}");
            let _ = events.send(PeerEvent::ConnectionState(st.to_string()));
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {st:?}");
            Box::pin(async {})
        }));

        *self.slot.lock().await = Some(PeerSlot { pc, audio, video });
        self.open.store(true, Ordering::SeqCst);
        info!("peer connection opened with audio and video");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let pc = self.peer().await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, PeerError> {
        let pc = self.peer().await?;
        self.set_remote(&pc, offer).await?;
        self.answer(&pc).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let pc = self.peer().await?;
        if pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteOffer);
        }
        self.answer(&pc).await
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        let pc = self.peer().await?;
        self.set_remote(&pc, answer).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let pc = self.peer().await?;
        if pc.remote_description().await.is_some() {
            pc.add_ice_candidate(to_init(candidate)).await?;
        } else {
            self.pending.push(candidate);
        }
        Ok(())
    }

    async fn toggle_audio(&self) -> Result<bool, PeerError> {
        let mut slot = self.slot.lock().await;
        let slot = slot.as_mut().ok_or(PeerError::NoPeer)?;
        slot.audio.toggle().await
    }

    async fn toggle_video(&self) -> Result<bool, PeerError> {
        let mut slot = self.slot.lock().await;
        let slot = slot.as_mut().ok_or(PeerError::NoPeer)?;
        slot.video.toggle().await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.pending.clear();
        let previous = self.slot.lock().await.take();
        if let Some(slot) = previous {
            if let Err(e) = slot.pc.close().await {
                warn!("peer close failed: {e}");
            }
            info!("peer connection closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.r#type.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp)?,
        "answer" => RTCSessionDescription::answer(desc.sdp)?,
        "pranswer" => RTCSessionDescription::pranswer(desc.sdp)?,
        other => return Err(PeerError::InvalidDescription(other.to_owned())),
    };
    Ok(rtc)
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// ServerConfig -> RTCIceServer (схема дописывается, если её нет)
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn host_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn turn_credentials_are_carried() {
        let servers = get_user_ice_servers(&[ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: Some("u".into()),
            credential: Some("p".into()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }

    #[test]
    fn unknown_description_type_is_rejected() {
        let desc = SessionDescription {
            r#type: "rollback-ish".into(),
            sdp: String::new(),
        };
        assert!(matches!(to_rtc(desc), Err(PeerError::InvalidDescription(_))));
    }

    #[tokio::test]
    async fn offer_carries_audio_and_video() {
        let peer = WebRtcPeer::new(Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        peer.open(tx).await.unwrap();
        assert!(peer.is_open());

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.r#type, "offer");
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        peer.close().await;
        assert!(!peer.is_open());
    }

    #[tokio::test]
    async fn offer_answer_between_two_peers() {
        let caller = WebRtcPeer::new(Vec::new());
        let callee = WebRtcPeer::new(Vec::new());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        caller.open(tx_a).await.unwrap();
        callee.open(tx_b).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        let answer = callee.accept_offer(offer).await.unwrap();
        assert_eq!(answer.r#type, "answer");
        assert!(answer.sdp.contains("m=audio"));
        caller.apply_answer(answer).await.unwrap();

        assert!(!caller.toggle_audio().await.unwrap());
        assert!(caller.toggle_audio().await.unwrap());

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let peer = WebRtcPeer::new(Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        peer.open(tx).await.unwrap();

        peer.add_ice_candidate(host_candidate()).await.unwrap();
        assert_eq!(peer.pending_candidates(), 1);

        peer.close().await;
        assert_eq!(peer.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn answer_without_remote_offer_fails() {
        let peer = WebRtcPeer::new(Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        peer.open(tx).await.unwrap();
        assert!(matches!(
            peer.create_answer().await,
            Err(PeerError::NoRemoteOffer)
        ));
        peer.close().await;
    }
}
