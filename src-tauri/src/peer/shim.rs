//! Media engine shim: runs [`ShimCommand`]s against a [`PeerEngine`] and
//! reports everything it produces back as negotiation messages.

use crate::bridge::{BridgeIngress, MediaEngineChannel, NegotiationMessage, ShimCommand};
use crate::config::DeliveryMode;
use crate::error::{BridgeError, PeerError};
use crate::peer::queue::{IngressFrame, PendingMessageQueue};
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Что peer connection сообщает сам по себе, вне команд.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    /// ICE connection state, lowercase (`checking`, `connected`...)
    ConnectionState(String),
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

/// Peer connection plus local media.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Acquires local media and creates a fresh connection, replacing any previous one.
    async fn open(&self, events: PeerEventSink) -> Result<(), PeerError>;
    /// Creates an offer and sets it as local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    /// Sets the remote offer, then creates and sets the local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, PeerError>;
    /// Answers the remote offer that is already set.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Returns whether audio is enabled afterwards.
    async fn toggle_audio(&self) -> Result<bool, PeerError>;
    /// Returns whether video is enabled afterwards.
    async fn toggle_video(&self) -> Result<bool, PeerError>;
    async fn close(&self);
    fn is_open(&self) -> bool;
}

/// Как сообщения shim доходят до моста.
pub enum Delivery {
    Direct(BridgeIngress),
    Navigation(PendingMessageQueue),
}

impl Delivery {
    pub fn for_mode(mode: DeliveryMode, ingress: BridgeIngress, settle: Duration) -> Self {
        match mode {
            DeliveryMode::Direct => Delivery::Direct(ingress),
            DeliveryMode::Navigation => Delivery::Navigation(PendingMessageQueue::spawn(
                Arc::new(IngressFrame::new(ingress)),
                settle,
            )),
        }
    }

    fn send(&self, url: String) -> Result<(), BridgeError> {
        match self {
            Delivery::Direct(ingress) => {
                ingress.on_web_message(&url);
                Ok(())
            }
            Delivery::Navigation(queue) => queue.enqueue(url),
        }
    }

    /// Drops whatever has not reached the bridge yet.
    fn purge(&self) {
        match self {
            Delivery::Direct(_) => {}
            Delivery::Navigation(queue) => queue.clear(),
        }
    }
}

/// Исходящая сторона shim. Сообщения помечены сессией; после `cut` старые не уходят.
struct Outlet {
    scheme: String,
    delivery: Delivery,
    session: Mutex<u64>,
}

impl Outlet {
    fn session_guard(&self) -> MutexGuard<'_, u64> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn session(&self) -> u64 {
        *self.session_guard()
    }

    fn post(&self, session: u64, message: &NegotiationMessage) -> Result<(), BridgeError> {
        let current = self.session_guard();
        if *current != session {
            debug!("{} from a closed session dropped", message.action());
            return Ok(());
        }
        let url = message.encode_url(&self.scheme)?;
        self.delivery.send(url)
    }

    /// Starts a new session and purges undelivered messages of the old one.
    fn cut(&self) -> u64 {
        let mut current = self.session_guard();
        *current += 1;
        self.delivery.purge();
        *current
    }
}

pub struct MediaEngineShim {
    engine: Arc<dyn PeerEngine>,
    outlet: Arc<Outlet>,
    // События нового peer ждут, пока уйдёт локальное описание
    held_events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MediaEngineShim {
    pub fn new(engine: Arc<dyn PeerEngine>, scheme: &str, delivery: Delivery) -> Self {
        Self {
            engine,
            outlet: Arc::new(Outlet {
                scheme: scheme.to_owned(),
                delivery,
                session: Mutex::new(0),
            }),
            held_events: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    fn held_events(&self) -> MutexGuard<'_, Option<mpsc::UnboundedReceiver<PeerEvent>>> {
        self.held_events.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn open(&self, session: &mut u64) -> Result<(), PeerError> {
        *session = self.stop_pump();
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.open(tx).await?;
        *self.held_events() = Some(rx);
        Ok(())
    }

    /// Starts forwarding peer events; a no-op while already forwarding.
    fn release_events(&self, session: u64) {
        let Some(mut rx) = self.held_events().take() else {
            return;
        };
        let outlet = self.outlet.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let message = match event {
                    PeerEvent::LocalCandidate(c) => NegotiationMessage::IceCandidate(c),
                    PeerEvent::ConnectionState(s) => NegotiationMessage::ConnectionState(s),
                };
                if let Err(e) = outlet.post(session, &message) {
                    warn!("shim could not post {}: {e}", message.action());
                    break;
                }
            }
        });
        if let Some(old) = self.pump().replace(handle) {
            old.abort();
        }
    }

    /// Stops forwarding and cuts the outlet; returns the new session.
    fn stop_pump(&self) -> u64 {
        self.held_events().take();
        if let Some(handle) = self.pump().take() {
            handle.abort();
        }
        self.outlet.cut()
    }

    /// Runs one command. `Ok(Some(_))` is a local description to post.
    async fn run(
        &self,
        command: ShimCommand,
        session: &mut u64,
    ) -> Result<Option<NegotiationMessage>, PeerError> {
        match command {
            ShimCommand::CreateOffer => {
                self.open(session).await?;
                let offer = self.engine.create_offer().await?;
                Ok(Some(NegotiationMessage::Offer(offer)))
            }
            ShimCommand::ApplyOffer(offer) | ShimCommand::CreateAnswer(Some(offer)) => {
                self.open(session).await?;
                let answer = self.engine.accept_offer(offer).await?;
                Ok(Some(NegotiationMessage::Answer(answer)))
            }
            ShimCommand::CreateAnswer(None) => {
                if !self.engine.is_open() {
                    return Err(PeerError::NoRemoteOffer);
                }
                let answer = self.engine.create_answer().await?;
                Ok(Some(NegotiationMessage::Answer(answer)))
            }
            ShimCommand::ApplyAnswer(answer) => {
                if !self.engine.is_open() {
                    debug!("answer without a peer ignored");
                    return Ok(None);
                }
                self.engine.apply_answer(answer).await?;
                Ok(None)
            }
            ShimCommand::ApplyIceCandidate(candidate) => {
                if !self.engine.is_open() {
                    debug!("candidate without a peer ignored");
                    return Ok(None);
                }
                self.engine.add_ice_candidate(candidate).await?;
                Ok(None)
            }
            ShimCommand::ToggleAudio => {
                if self.engine.is_open() {
                    let enabled = self.engine.toggle_audio().await?;
                    info!("audio {}", if enabled { "unmuted" } else { "muted" });
                }
                Ok(None)
            }
            ShimCommand::ToggleVideo => {
                if self.engine.is_open() {
                    let enabled = self.engine.toggle_video().await?;
                    info!("camera {}", if enabled { "on" } else { "off" });
                }
                Ok(None)
            }
            ShimCommand::Close => {
                *session = self.stop_pump();
                if self.engine.is_open() {
                    self.engine.close().await;
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MediaEngineChannel for MediaEngineShim {
    async fn dispatch(&self, command: ShimCommand) -> Result<(), BridgeError> {
        let name = command.name();
        let mut session = self.outlet.session();
        match self.run(command, &mut session).await {
            Ok(Some(description)) => {
                self.outlet.post(session, &description)?;
                // Кандидаты только после offer/answer
                self.release_events(session);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{name} failed: {e}");
                self.outlet.post(
                    session,
                    &NegotiationMessage::Error(format!("{name} failed: {e}")),
                )?;
            }
        }
        Ok(())
    }

    fn detached(&self) {
        self.stop_pump();
    }
}

impl Drop for MediaEngineShim {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
