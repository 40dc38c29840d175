use super::{CallRequest, CallResponse, SignalingChannel, SignalingEvent, UserInfo};
use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 256;

struct Member {
    display_name: String,
    events: broadcast::Sender<SignalingEvent>,
}

/// In-process signaling switchboard: every connected user gets a
/// [`MemorySignaling`] endpoint and events are routed by user id.
#[derive(Default)]
pub struct MemoryHub {
    members: Mutex<HashMap<String, Member>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Регистрирует пользователя; остальные получают UserStatusChanged(online).
    pub fn connect(self: &Arc<Self>, user_id: &str, display_name: &str) -> Arc<MemorySignaling> {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        {
            let mut members = self.lock();
            members.insert(
                user_id.to_owned(),
                Member {
                    display_name: display_name.to_owned(),
                    events: tx.clone(),
                },
            );
        }
        self.announce(user_id, display_name, true);
        Arc::new(MemorySignaling {
            hub: self.clone(),
            user_id: user_id.to_owned(),
            display_name: display_name.to_owned(),
            events: tx,
        })
    }

    pub fn disconnect(&self, user_id: &str) {
        let removed = self.lock().remove(user_id);
        if let Some(member) = removed {
            self.announce(user_id, &member.display_name, false);
        }
    }

    fn announce(&self, user_id: &str, display_name: &str, online: bool) {
        let info = UserInfo {
            user_id: user_id.to_owned(),
            display_name: display_name.to_owned(),
            is_online: online,
        };
        for (id, member) in self.lock().iter() {
            if id != user_id {
                let _ = member.events.send(SignalingEvent::UserStatusChanged(info.clone()));
            }
        }
    }

    fn route(&self, to: &str, event: SignalingEvent) -> Result<(), SignalingError> {
        let members = self.lock();
        let member = members
            .get(to)
            .ok_or_else(|| SignalingError::Unreachable(to.to_owned()))?;
        debug!("hub -> {to}: {event:?}");
        // Нет подписчиков = событие некому доставить; для транспорта это не ошибка
        let _ = member.events.send(event);
        Ok(())
    }

    fn online(&self, except: &str) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() != except)
            .map(|(id, m)| UserInfo {
                user_id: id.clone(),
                display_name: m.display_name.clone(),
                is_online: true,
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Member>> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One user's endpoint on a [`MemoryHub`].
pub struct MemorySignaling {
    hub: Arc<MemoryHub>,
    user_id: String,
    display_name: String,
    events: broadcast::Sender<SignalingEvent>,
}

impl MemorySignaling {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn get_online_users(&self) -> Result<Vec<UserInfo>, SignalingError> {
        Ok(self.hub.online(&self.user_id))
    }

    async fn initiate_call(&self, callee_id: &str) -> Result<CallResponse, SignalingError> {
        let request = CallRequest {
            caller_id: self.user_id.clone(),
            caller_name: self.display_name.clone(),
        };
        match self.hub.route(callee_id, SignalingEvent::IncomingCall(request)) {
            Ok(()) => Ok(CallResponse { success: true }),
            Err(SignalingError::Unreachable(_)) => Ok(CallResponse { success: false }),
            Err(e) => Err(e),
        }
    }

    async fn respond_to_call(&self, caller_id: &str, accepted: bool) -> Result<(), SignalingError> {
        self.hub.route(
            caller_id,
            SignalingEvent::CallResponseReceived {
                from: self.user_id.clone(),
                accepted,
            },
        )
    }

    async fn end_call(&self, participant_id: &str) -> Result<(), SignalingError> {
        self.hub.route(
            participant_id,
            SignalingEvent::CallEnded {
                from: self.user_id.clone(),
            },
        )
    }

    async fn send_offer(
        &self,
        participant_id: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.hub.route(
            participant_id,
            SignalingEvent::OfferReceived {
                from: self.user_id.clone(),
                offer,
            },
        )
    }

    async fn send_answer(
        &self,
        participant_id: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.hub.route(
            participant_id,
            SignalingEvent::AnswerReceived {
                from: self.user_id.clone(),
                answer,
            },
        )
    }

    async fn send_ice_candidate(
        &self,
        participant_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.hub.route(
            participant_id,
            SignalingEvent::IceCandidateReceived {
                from: self.user_id.clone(),
                candidate,
            },
        )
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }
}
