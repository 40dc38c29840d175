//! Экран звонка: связывает машину состояний, мост и shim.
//!
//! Once the engine has a remote participant the bridge is attached to it;
//! an accepted outgoing call asks the shim for an offer; ICE `connected`
//! from the shim moves the engine to `Connected`; the end of a call closes
//! the shim and detaches the bridge.

pub mod presence;

use crate::bridge::{BridgeEvent, BridgeIngress, NegotiationBridge};
use crate::call::{CallEngine, EngineEvent};
use crate::config::CallConfig;
use crate::dispatcher::UiDispatcher;
use crate::error::{BridgeError, CallError};
use crate::history::{CallHistoryEntry, MemoryHistory};
use crate::peer::{Delivery, MediaEngineShim, PeerEngine};
use crate::ringback::{PatternRingback, Ringback};
use crate::session::{CallState, Direction, SessionSnapshot};
use crate::signaling::{CallRequest, SignalingChannel, Subscription};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use presence::Presence;

/// What a call screen shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    State(CallState),
    IncomingCall(CallRequest),
    /// Media path dropped (ICE disconnected / failed)
    ConnectionLost,
    Error(String),
}

pub struct CallClient {
    engine: CallEngine,
    bridge: NegotiationBridge,
    history: Arc<MemoryHistory>,
    events: broadcast::Sender<ClientEvent>,
    _wiring: [Subscription; 2],
}

impl CallClient {
    /// Client with the stock ringback pattern and in-memory history.
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        peer: Arc<dyn PeerEngine>,
        config: &CallConfig,
    ) -> Self {
        let ringback = Arc::new(PatternRingback::from_config(config));
        let history = Arc::new(MemoryHistory::new(config.history_limit));
        Self::with_parts(signaling, peer, ringback, history, config)
    }

    pub fn with_parts(
        signaling: Arc<dyn SignalingChannel>,
        peer: Arc<dyn PeerEngine>,
        ringback: Arc<dyn Ringback>,
        history: Arc<MemoryHistory>,
        config: &CallConfig,
    ) -> Self {
        let ui = UiDispatcher::spawn();
        let engine = CallEngine::new(signaling.clone(), ringback, history.clone(), ui.clone());
        let bridge = NegotiationBridge::new(signaling, &config.scheme, ui);

        let delivery = Delivery::for_mode(
            config.delivery_mode(),
            bridge.ingress(),
            config.settle_interval(),
        );
        info!(
            "call client ready (scheme {}, {:?} delivery)",
            config.scheme,
            config.delivery_mode()
        );
        let shim = Arc::new(MediaEngineShim::new(peer, &config.scheme, delivery));
        let (events, _) = broadcast::channel(64);

        let engine_wiring = Subscription::spawn(engine.subscribe(), {
            let engine = engine.clone();
            let bridge = bridge.clone();
            let events = events.clone();
            move |event: EngineEvent| {
                let engine = engine.clone();
                let bridge = bridge.clone();
                let shim = shim.clone();
                let events = events.clone();
                async move { on_engine_event(&engine, &bridge, shim, &events, event).await }
            }
        });

        let bridge_wiring = Subscription::spawn(bridge.subscribe(), {
            let engine = engine.clone();
            let events = events.clone();
            move |event: BridgeEvent| {
                let engine = engine.clone();
                let events = events.clone();
                async move { on_bridge_event(&engine, &events, event).await }
            }
        });

        Self {
            engine,
            bridge,
            history,
            events,
            _wiring: [engine_wiring, bridge_wiring],
        }
    }

    pub async fn start_call(
        &self,
        callee_id: &str,
        callee_name: Option<&str>,
    ) -> Result<(), CallError> {
        self.engine.start_call(callee_id, callee_name).await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.engine.accept().await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.engine.reject().await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.engine.hang_up().await
    }

    pub async fn toggle_mute(&self) -> Result<(), BridgeError> {
        self.bridge.toggle_audio().await
    }

    pub async fn toggle_camera(&self) -> Result<(), BridgeError> {
        self.bridge.toggle_video().await
    }

    pub fn state(&self) -> CallState {
        self.engine.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.engine.snapshot()
    }

    pub fn history(&self) -> Vec<CallHistoryEntry> {
        self.history.entries()
    }

    pub fn history_store(&self) -> Arc<MemoryHistory> {
        self.history.clone()
    }

    /// Entry point for messages the page posts back.
    pub fn ingress(&self) -> BridgeIngress {
        self.bridge.ingress()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        if self.bridge.remote_id().is_some() {
            let _ = self.bridge.close().await;
        }
        self.bridge.detach();
    }
}

async fn on_engine_event(
    engine: &CallEngine,
    bridge: &NegotiationBridge,
    shim: Arc<MediaEngineShim>,
    events: &broadcast::Sender<ClientEvent>,
    event: EngineEvent,
) {
    match event {
        EngineEvent::StateChanged(state) => {
            match state {
                CallState::Calling | CallState::Ringing => {
                    // Attach before the answer goes out so the remote offer finds us
                    let snap = engine.snapshot();
                    match snap.remote_participant_id {
                        Some(remote) if snap.state.is_active() => bridge.attach(shim, &remote),
                        _ => debug!("{state:?} already over, bridge left detached"),
                    }
                }
                CallState::Connecting => {
                    let snap = engine.snapshot();
                    if snap.state == CallState::Connecting
                        && snap.direction == Direction::Outgoing
                    {
                        // Failure is already reported as a bridge error event
                        let _ = bridge.request_offer().await;
                    }
                }
                CallState::Ended => {
                    if bridge.remote_id().is_some() {
                        if let Err(e) = bridge.close().await {
                            warn!("closing media engine failed: {e}");
                        }
                    }
                    bridge.detach();
                }
                CallState::Connected | CallState::Idle => {}
            }
            let _ = events.send(ClientEvent::State(state));
        }
        EngineEvent::IncomingCall(request) => {
            let _ = events.send(ClientEvent::IncomingCall(request));
        }
        EngineEvent::CallAccepted | EngineEvent::CallEnded => {}
    }
}

async fn on_bridge_event(
    engine: &CallEngine,
    events: &broadcast::Sender<ClientEvent>,
    event: BridgeEvent,
) {
    match event {
        BridgeEvent::Connected => {
            if let Err(e) = engine.set_connected().await {
                debug!("connected report ignored: {e}");
            }
        }
        BridgeEvent::Disconnected => {
            warn!("media connection lost");
            let _ = events.send(ClientEvent::ConnectionLost);
        }
        BridgeEvent::Error(text) => {
            let _ = events.send(ClientEvent::Error(text));
        }
    }
}
