use futures_util::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = BoxFuture<'static, ()>;

/// Единственный логический UI-поток.
///
/// Jobs run one after another on a single task, each to completion, in the
/// order they were submitted. Everything that mutates call state or talks to
/// the media engine goes through here. A job must never wait on another job.
#[derive(Clone)]
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl UiDispatcher {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("ui dispatcher stopped");
        });
        Self { tx }
    }

    /// Fire-and-forget. Returns `false` once the dispatcher is gone.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Box::pin(job)).is_ok()
    }

    /// Runs `job` on the dispatcher and waits for its output.
    pub async fn run<F, T>(&self, job: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let posted = self.post(async move {
            let _ = done_tx.send(job.await);
        });
        if !posted {
            return None;
        }
        done_rx.await.ok()
    }
}
