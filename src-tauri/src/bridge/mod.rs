//! Мост согласования: native <-> media engine shim.
//!
//! Native intents and remote negotiation traffic become [`ShimCommand`]s sent
//! to the attached [`MediaEngineChannel`]; messages coming back from the shim
//! arrive through [`BridgeIngress`] and are relayed to the signaling channel.

pub mod message;

use crate::dispatcher::UiDispatcher;
use crate::error::BridgeError;
use crate::logger::dump_candidate;
use crate::peer::types::SessionDescription;
use crate::signaling::{SignalingChannel, SignalingEvent, Subscription};
use crate::utils::{fingerprint, preview};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use message::{strip_scheme, NegotiationMessage, ShimCommand};

/// Command surface of the media engine running in the isolated context.
#[async_trait]
pub trait MediaEngineChannel: Send + Sync {
    /// Resolves when the shim has finished evaluating the command.
    async fn dispatch(&self, command: ShimCommand) -> Result<(), BridgeError>;

    /// Called once the bridge lets go of this channel; whatever it still has
    /// queued for the bridge is stale from now on.
    fn detached(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Error(String),
    /// ICE connected / completed
    Connected,
    /// ICE disconnected / failed / closed
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    /// Not ours, let the load happen
    Allow,
    /// Negotiation message; the load must not happen
    Cancel,
}

/// Сообщение от shim с эпохой привязки, при которой оно пришло.
struct Inbound {
    epoch: u64,
    url: String,
}

/// Точка входа сообщений от shim (оба способа доставки).
#[derive(Clone)]
pub struct BridgeIngress {
    scheme: Arc<str>,
    epoch: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl BridgeIngress {
    /// Navigation-interception hook. Only `scheme://` loads are taken.
    pub fn on_navigating(&self, url: &str) -> NavigationDecision {
        if strip_scheme(&self.scheme, url).is_none() {
            debug!("navigation to {} passed through", preview(url, 80));
            return NavigationDecision::Allow;
        }
        self.push(url.to_owned());
        NavigationDecision::Cancel
    }

    /// Direct-channel hook (`postMessage` and friends).
    pub fn on_web_message(&self, url: &str) {
        self.push(url.to_owned());
    }

    fn push(&self, url: String) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.tx.send(Inbound { epoch, url }).is_err() {
            warn!("bridge ingestion loop is gone, shim message dropped");
        }
    }
}

struct Attachment {
    epoch: u64,
    channel: Arc<dyn MediaEngineChannel>,
    remote_id: String,
    last_remote_offer: Option<SessionDescription>,
    /// Fingerprints of relayed offer/answer/candidate messages
    seen: HashSet<String>,
    _signaling: Subscription,
}

struct BridgeCore {
    signaling: Arc<dyn SignalingChannel>,
    scheme: Arc<str>,
    ui: UiDispatcher,
    attachment: Mutex<Option<Attachment>>,
    epoch: Arc<AtomicU64>,
    // Одна команда к shim за раз
    dispatch_turn: tokio::sync::Mutex<()>,
    events: broadcast::Sender<BridgeEvent>,
}

struct IngestLoop(JoinHandle<()>);

impl Drop for IngestLoop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct NegotiationBridge {
    core: Arc<BridgeCore>,
    ingress: BridgeIngress,
    _ingest: Arc<IngestLoop>,
}

impl NegotiationBridge {
    pub fn new(signaling: Arc<dyn SignalingChannel>, scheme: &str, ui: UiDispatcher) -> Self {
        let (events, _) = broadcast::channel(64);
        let scheme: Arc<str> = Arc::from(scheme);
        let epoch = Arc::new(AtomicU64::new(0));
        let core = Arc::new(BridgeCore {
            signaling,
            scheme: scheme.clone(),
            ui,
            attachment: Mutex::new(None),
            epoch: epoch.clone(),
            dispatch_turn: tokio::sync::Mutex::new(()),
            events,
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let ingest = tokio::spawn({
            let core = core.clone();
            async move {
                // Строго по одному сообщению, в порядке поступления
                while let Some(inbound) = rx.recv().await {
                    if let Err(e) = core.ingest(inbound).await {
                        core.report(e);
                    }
                }
            }
        });

        Self {
            core,
            ingress: BridgeIngress { scheme, epoch, tx },
            _ingest: Arc::new(IngestLoop(ingest)),
        }
    }

    pub fn ingress(&self) -> BridgeIngress {
        self.ingress.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.core.events.subscribe()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.core.attachment().as_ref().map(|a| a.remote_id.clone())
    }

    /// Binds the bridge to one media engine and one remote participant.
    /// Any previous attachment is torn down first.
    pub fn attach(&self, channel: Arc<dyn MediaEngineChannel>, remote_id: &str) {
        self.detach();

        // Слот занят до смены эпохи: сообщение новой эпохи не опередит привязку
        let mut slot = self.core.attachment();
        let epoch = self.core.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription = Subscription::spawn(self.core.signaling.subscribe(), {
            let weak = Arc::downgrade(&self.core);
            let remote = remote_id.to_owned();
            move |event: SignalingEvent| {
                let weak = weak.clone();
                let remote = remote.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.on_signal(epoch, &remote, event).await;
                    }
                }
            }
        });
        *slot = Some(Attachment {
            epoch,
            channel,
            remote_id: remote_id.to_owned(),
            last_remote_offer: None,
            seen: HashSet::new(),
            _signaling: subscription,
        });
        info!("bridge attached to {remote_id} (epoch {epoch})");
    }

    /// Unsubscribes everything; no handler runs for this attachment afterwards
    /// and shim messages that arrive later are dropped.
    pub fn detach(&self) {
        let previous = {
            let mut slot = self.core.attachment();
            self.core.epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        if let Some(a) = previous {
            a.channel.detached();
            info!("bridge detached from {}", a.remote_id);
        }
    }

    pub async fn request_offer(&self) -> Result<(), BridgeError> {
        self.command(ShimCommand::CreateOffer).await
    }

    /// Answers the last offer received from the attached participant.
    pub async fn request_answer(&self) -> Result<(), BridgeError> {
        let offer = self
            .core
            .attachment()
            .as_ref()
            .and_then(|a| a.last_remote_offer.clone());
        self.command(ShimCommand::CreateAnswer(offer)).await
    }

    pub async fn toggle_audio(&self) -> Result<(), BridgeError> {
        self.command(ShimCommand::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<(), BridgeError> {
        self.command(ShimCommand::ToggleVideo).await
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.command(ShimCommand::Close).await
    }

    async fn command(&self, command: ShimCommand) -> Result<(), BridgeError> {
        let result = self.core.dispatch(None, command).await;
        if let Err(e) = &result {
            self.core.report(e.clone());
        }
        result
    }
}

impl BridgeCore {
    fn attachment(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn report(&self, error: BridgeError) {
        warn!("bridge error: {error}");
        let _ = self.events.send(BridgeEvent::Error(error.to_string()));
    }

    /// Sends one command to the shim on the UI dispatcher and waits for it.
    /// `epoch` pins the command to a specific attachment; stale ones are dropped.
    async fn dispatch(&self, epoch: Option<u64>, command: ShimCommand) -> Result<(), BridgeError> {
        let _turn = self.dispatch_turn.lock().await;
        let channel = {
            let slot = self.attachment();
            match slot.as_ref() {
                Some(a) if epoch.map_or(true, |e| e == a.epoch) => a.channel.clone(),
                Some(_) => {
                    debug!("{} for a previous attachment dropped", command.name());
                    return Ok(());
                }
                None => return Err(BridgeError::NotAttached),
            }
        };

        debug!("-> shim {}", command.name());
        self.ui
            .run(async move { channel.dispatch(command).await })
            .await
            .unwrap_or_else(|| Err(BridgeError::Delivery("ui dispatcher is gone".into())))
    }

    async fn on_signal(&self, epoch: u64, remote: &str, event: SignalingEvent) {
        let command = match event {
            SignalingEvent::OfferReceived { from, offer } if from == remote => {
                if let Some(a) = self.attachment().as_mut().filter(|a| a.epoch == epoch) {
                    a.last_remote_offer = Some(offer.clone());
                }
                ShimCommand::ApplyOffer(offer)
            }
            SignalingEvent::AnswerReceived { from, answer } if from == remote => {
                ShimCommand::ApplyAnswer(answer)
            }
            SignalingEvent::IceCandidateReceived { from, candidate } if from == remote => {
                dump_candidate("REMOTE", &candidate);
                ShimCommand::ApplyIceCandidate(candidate)
            }
            _ => return,
        };
        if let Err(e) = self.dispatch(Some(epoch), command).await {
            self.report(e);
        }
    }

    async fn ingest(&self, inbound: Inbound) -> Result<(), BridgeError> {
        let message = NegotiationMessage::decode_url(&self.scheme, &inbound.url)?;
        debug!("<- shim {}", message.action());

        let remote = {
            let mut slot = self.attachment();
            match slot.as_mut() {
                Some(a) if a.epoch == inbound.epoch => {
                    if message.is_relayed() && !a.seen.insert(fingerprint(&format!("{message:?}")))
                    {
                        debug!("duplicate {} delivery dropped", message.action());
                        return Ok(());
                    }
                    Some(a.remote_id.clone())
                }
                _ if inbound.epoch != self.epoch.load(Ordering::SeqCst) => {
                    debug!("{} from a previous attachment dropped", message.action());
                    return Ok(());
                }
                _ => None,
            }
        };

        match message {
            NegotiationMessage::Error(text) => {
                warn!("media engine error: {text}");
                let _ = self.events.send(BridgeEvent::Error(text));
            }
            NegotiationMessage::ConnectionState(state) => {
                if remote.is_none() {
                    debug!("ice state {state} with nothing attached");
                    return Ok(());
                }
                let event = match state.as_str() {
                    "connected" | "completed" => BridgeEvent::Connected,
                    "disconnected" | "failed" | "closed" => BridgeEvent::Disconnected,
                    other => {
                        debug!("ice state {other}");
                        return Ok(());
                    }
                };
                let _ = self.events.send(event);
            }
            NegotiationMessage::Offer(offer) => {
                let remote = remote.ok_or(BridgeError::NotAttached)?;
                self.signaling.send_offer(&remote, offer).await?
            }
            NegotiationMessage::Answer(answer) => {
                let remote = remote.ok_or(BridgeError::NotAttached)?;
                self.signaling.send_answer(&remote, answer).await?
            }
            NegotiationMessage::IceCandidate(candidate) => {
                let remote = remote.ok_or(BridgeError::NotAttached)?;
                dump_candidate("LOCAL", &candidate);
                self.signaling.send_ice_candidate(&remote, candidate).await?
            }
        }
        Ok(())
    }
}
