use crate::ringback::Ringback;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Автоответ после полного цикла гудков.
///
/// Runs the ringback cycle on a background task; if the cycle completes and the
/// timer was not cancelled, `on_fire` is called once. `on_fire` only posts a
/// continuation: whether the accept actually happens is decided on the UI
/// dispatcher by re-checking the session.
#[derive(Debug)]
pub struct AutoAnswerTimer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl AutoAnswerTimer {
    pub fn start<F>(ringback: Arc<dyn Ringback>, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("auto-answer cancelled while ringing");
                    }
                    _ = ringback.start_ringing() => {
                        if token.is_cancelled() {
                            debug!("ring cycle ended after cancel, not answering");
                        } else {
                            debug!("ring cycle complete, requesting auto-answer");
                            on_fire();
                        }
                    }
                }
            }
        });
        Self { token, task }
    }

    /// Idempotent; also releases the background task.
    pub fn cancel(&self) {
        self.token.cancel();
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AutoAnswerTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
