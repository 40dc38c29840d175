use crate::bridge::{BridgeIngress, NavigationDecision};
use crate::error::BridgeError;
use crate::utils::preview;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Скрытый фрейм, через загрузку которого shim передаёт сообщение.
///
/// Starting a second load before the first one resolved may silently lose
/// the first, which is why [`PendingMessageQueue`] never overlaps loads.
pub trait NavigationFrame: Send + Sync {
    fn load(&self, url: &str);
    fn teardown(&self);
}

/// Frame whose loads land directly on the bridge's navigation hook; used when
/// shim and bridge share a process.
pub struct IngressFrame {
    ingress: BridgeIngress,
}

impl IngressFrame {
    pub fn new(ingress: BridgeIngress) -> Self {
        Self { ingress }
    }
}

impl NavigationFrame for IngressFrame {
    fn load(&self, url: &str) {
        if self.ingress.on_navigating(url) == NavigationDecision::Allow {
            warn!("frame load was not a negotiation message: {}", preview(url, 60));
        }
    }

    fn teardown(&self) {}
}

/// Очередь исходящих сообщений: одна навигация за раз, строго по порядку.
///
/// Each message is dequeued, loaded, given `settle` to resolve, torn down,
/// and only then is the next one taken. [`clear`](Self::clear) drops
/// everything not yet delivered, including the load in flight.
pub struct PendingMessageQueue {
    tx: mpsc::UnboundedSender<(u64, String)>,
    frame: Arc<dyn NavigationFrame>,
    // Поколение очереди; clear() его увеличивает
    generation: Arc<AtomicU64>,
    depth: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl PendingMessageQueue {
    pub fn spawn(frame: Arc<dyn NavigationFrame>, settle: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, String)>();
        let generation = Arc::new(AtomicU64::new(0));
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn({
            let frame = frame.clone();
            let generation = generation.clone();
            let depth = depth.clone();
            async move {
                while let Some((queued_in, url)) = rx.recv().await {
                    if generation.load(Ordering::SeqCst) != queued_in {
                        continue;
                    }
                    debug!("navigating to {}", preview(&url, 60));
                    frame.load(&url);
                    tokio::time::sleep(settle).await;
                    // После clear() фрейм уже снят
                    if generation.load(Ordering::SeqCst) == queued_in {
                        frame.teardown();
                        let _ = depth.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                            d.checked_sub(1)
                        });
                    }
                }
            }
        });
        Self {
            tx,
            frame,
            generation,
            depth,
            worker,
        }
    }

    pub fn enqueue(&self, url: String) -> Result<(), BridgeError> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send((generation, url)).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            BridgeError::Delivery("navigation queue stopped".into())
        })
    }

    /// Drops every pending message and tears down the frame, cancelling a
    /// load that has not resolved yet.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = self.depth.swap(0, Ordering::SeqCst);
        self.frame.teardown();
        if dropped > 0 {
            debug!("navigation queue cleared, {dropped} message(s) dropped");
        }
    }

    /// Messages enqueued and not yet torn down (including the one in flight)
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PendingMessageQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
