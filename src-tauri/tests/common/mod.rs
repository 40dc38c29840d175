#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use visiocall_lib::bridge::BridgeIngress;
use visiocall_lib::client::ClientEvent;
use visiocall_lib::error::PeerError;
use visiocall_lib::peer::{
    IceCandidate, NavigationFrame, PeerEngine, PeerEvent, PeerEventSink, SessionDescription,
};
use visiocall_lib::session::CallState;

#[derive(Default)]
struct FakeState {
    sink: Option<PeerEventSink>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    audio: bool,
    video: bool,
    connected: bool,
    ops: Vec<String>,
    fail_offer: bool,
}

/// Scripted peer: gathers two host candidates after each local description
/// and reports `connected` once it has a remote description and a remote candidate.
pub struct FakePeer {
    name: String,
    state: Mutex<FakeState>,
}

impl FakePeer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().remote_candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.state.lock().unwrap().audio
    }

    pub fn fail_offers(&self) {
        self.state.lock().unwrap().fail_offer = true;
    }

    pub fn candidate(&self, n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{}{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host",
                self.name
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn gather(&self, s: &FakeState) {
        if let Some(sink) = &s.sink {
            for n in 1..=2 {
                let _ = sink.send(PeerEvent::LocalCandidate(self.candidate(n)));
            }
        }
    }

    fn check_connected(s: &mut FakeState) {
        if !s.connected && s.remote.is_some() && !s.remote_candidates.is_empty() {
            s.connected = true;
            if let Some(sink) = &s.sink {
                let _ = sink.send(PeerEvent::ConnectionState("checking".into()));
                let _ = sink.send(PeerEvent::ConnectionState("connected".into()));
            }
        }
    }
}

#[async_trait]
impl PeerEngine for FakePeer {
    async fn open(&self, events: PeerEventSink) -> Result<(), PeerError> {
        let mut s = self.state.lock().unwrap();
        let ops = std::mem::take(&mut s.ops);
        let fail_offer = s.fail_offer;
        *s = FakeState {
            sink: Some(events),
            audio: true,
            video: true,
            ops,
            fail_offer,
            ..FakeState::default()
        };
        s.ops.push("open".into());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_offer {
            return Err(PeerError::NoPeer);
        }
        s.ops.push("create_offer".into());
        self.gather(&s);
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.name)))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, PeerError> {
        let mut s = self.state.lock().unwrap();
        s.ops.push("accept_offer".into());
        s.remote = Some(offer);
        self.gather(&s);
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut s = self.state.lock().unwrap();
        if s.remote.is_none() {
            return Err(PeerError::NoRemoteOffer);
        }
        s.ops.push("create_answer".into());
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.name)))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        let mut s = self.state.lock().unwrap();
        s.ops.push("apply_answer".into());
        s.remote = Some(answer);
        Self::check_connected(&mut s);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut s = self.state.lock().unwrap();
        s.remote_candidates.push(candidate);
        Self::check_connected(&mut s);
        Ok(())
    }

    async fn toggle_audio(&self) -> Result<bool, PeerError> {
        let mut s = self.state.lock().unwrap();
        s.audio = !s.audio;
        Ok(s.audio)
    }

    async fn toggle_video(&self) -> Result<bool, PeerError> {
        let mut s = self.state.lock().unwrap();
        s.video = !s.video;
        Ok(s.video)
    }

    async fn close(&self) {
        let mut s = self.state.lock().unwrap();
        s.ops.push("close".into());
        s.sink = None;
        s.connected = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }
}

/// Navigation frame with the platform quirk: a load resolves after `latency`
/// unless another load starts first, in which case it is lost.
pub struct LossyFrame {
    ingress: BridgeIngress,
    latency: Duration,
    generation: Arc<AtomicUsize>,
    loads: AtomicUsize,
}

impl LossyFrame {
    pub fn new(ingress: BridgeIngress, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            ingress,
            latency,
            generation: Arc::new(AtomicUsize::new(0)),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl NavigationFrame for LossyFrame {
    fn load(&self, url: &str) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mine = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let ingress = self.ingress.clone();
        let latency = self.latency;
        let url = url.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if generation.load(Ordering::SeqCst) == mine {
                ingress.on_navigating(&url);
            }
        });
    }

    // Снятый фрейм теряет незавершённую загрузку
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Waits for `want`, skipping everything else.
pub async fn wait_for(rx: &mut broadcast::Receiver<ClientEvent>, want: ClientEvent) {
    loop {
        match rx.recv().await {
            Ok(event) if event == want => return,
            Ok(_) => {}
            Err(e) => panic!("event stream ended waiting for {want:?}: {e}"),
        }
    }
}

pub async fn wait_state(rx: &mut broadcast::Receiver<ClientEvent>, state: CallState) {
    wait_for(rx, ClientEvent::State(state)).await
}

/// Next error event, skipping everything else.
pub async fn next_error(rx: &mut broadcast::Receiver<ClientEvent>) -> String {
    loop {
        match rx.recv().await {
            Ok(ClientEvent::Error(text)) => return text,
            Ok(_) => {}
            Err(e) => panic!("event stream ended waiting for an error: {e}"),
        }
    }
}
