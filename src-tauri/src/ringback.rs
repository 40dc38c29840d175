use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Звонок входящего вызова (рингтон).
#[async_trait]
pub trait Ringback: Send + Sync {
    /// Resolves once the whole pattern has played or `stop_ringing` was called.
    async fn start_ringing(&self);
    fn stop_ringing(&self);
}

/// Counters kept by [`PatternRingback`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingbackStats {
    pub cycles: usize,
    pub rings: usize,
    pub stops: usize,
}

/// Plays `count` rings of `interval` each. Tone output is left to the platform,
/// this only keeps the timing.
pub struct PatternRingback {
    count: u32,
    interval: Duration,
    current: Mutex<Option<CancellationToken>>,
    cycles: AtomicUsize,
    rings: AtomicUsize,
    stops: AtomicUsize,
}

impl PatternRingback {
    pub fn new(count: u32, interval: Duration) -> Self {
        Self {
            count,
            interval,
            current: Mutex::new(None),
            cycles: AtomicUsize::new(0),
            rings: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn from_config(cfg: &crate::config::CallConfig) -> Self {
        Self::new(cfg.ring_count, cfg.ring_interval())
    }

    pub fn stats(&self) -> RingbackStats {
        RingbackStats {
            cycles: self.cycles.load(Ordering::SeqCst),
            rings: self.rings.load(Ordering::SeqCst),
            stops: self.stops.load(Ordering::SeqCst),
        }
    }

    fn replace_token(&self, next: Option<CancellationToken>) {
        let prev = match self.current.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        };
        if let Some(prev) = prev {
            prev.cancel();
        }
    }
}

#[async_trait]
impl Ringback for PatternRingback {
    async fn start_ringing(&self) {
        let token = CancellationToken::new();
        self.replace_token(Some(token.clone()));
        self.cycles.fetch_add(1, Ordering::SeqCst);

        for ring in 1..=self.count {
            self.rings.fetch_add(1, Ordering::SeqCst);
            debug!("ring {ring}/{}", self.count);
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("ringing stopped at ring {ring}");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("ring pattern finished after {} rings", self.count);
    }

    fn stop_ringing(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.replace_token(None);
    }
}
