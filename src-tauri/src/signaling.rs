//! Контракт сигнального канала между двумя установками.
//!
//! The transport itself lives outside this crate; the engine and the bridge
//! only see [`SignalingChannel`]. `memory` is an in-process implementation.

pub mod memory;

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub display_name: String,
    pub is_online: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub caller_id: String,
    pub caller_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallResponse {
    pub success: bool,
}

/// Events raised by the signaling channel. Every call-scoped event names the
/// participant it came from so consumers can ignore strays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    UserStatusChanged(UserInfo),
    IncomingCall(CallRequest),
    CallResponseReceived { from: String, accepted: bool },
    CallEnded { from: String },
    OfferReceived { from: String, offer: SessionDescription },
    AnswerReceived { from: String, answer: SessionDescription },
    IceCandidateReceived { from: String, candidate: IceCandidate },
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn get_online_users(&self) -> Result<Vec<UserInfo>, SignalingError>;
    async fn initiate_call(&self, callee_id: &str) -> Result<CallResponse, SignalingError>;
    async fn respond_to_call(&self, caller_id: &str, accepted: bool)
        -> Result<(), SignalingError>;
    async fn end_call(&self, participant_id: &str) -> Result<(), SignalingError>;
    async fn send_offer(
        &self,
        participant_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError>;
    async fn send_answer(
        &self,
        participant_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;
    async fn send_ice_candidate(
        &self,
        participant_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    /// New receiver; only events raised after this call are seen.
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;
}

/// Живая подписка на события. Drop = отписка.
///
/// The handler runs on a background task, one event at a time, each awaited
/// before the next is taken.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn<E, F, Fut>(mut rx: broadcast::Receiver<E>, mut handler: F) -> Self
    where
        E: Clone + Send + 'static,
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("subscriber lagged, {n} events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { task }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
