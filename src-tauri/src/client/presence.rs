use crate::error::SignalingError;
use crate::signaling::{SignalingChannel, SignalingEvent, Subscription, UserInfo};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

type Roster = Arc<Mutex<BTreeMap<String, UserInfo>>>;

/// Список пользователей онлайн: снимок из get_online_users + UserStatusChanged.
pub struct Presence {
    signaling: Arc<dyn SignalingChannel>,
    users: Roster,
    _listener: Subscription,
}

impl Presence {
    /// Subscribes first, then loads the initial snapshot, so a change racing
    /// with the load is not lost.
    pub async fn start(signaling: Arc<dyn SignalingChannel>) -> Result<Self, SignalingError> {
        let users: Roster = Arc::default();
        let listener = Subscription::spawn(signaling.subscribe(), {
            let users = users.clone();
            move |event: SignalingEvent| {
                if let SignalingEvent::UserStatusChanged(info) = event {
                    apply(&users, info);
                }
                async {}
            }
        });
        let presence = Self {
            signaling,
            users,
            _listener: listener,
        };
        presence.refresh().await?;
        Ok(presence)
    }

    /// Reloads the whole list from signaling.
    pub async fn refresh(&self) -> Result<(), SignalingError> {
        let online = self.signaling.get_online_users().await?;
        let mut users = lock(&self.users);
        users.clear();
        for user in online.into_iter().filter(|u| u.is_online) {
            users.insert(user.user_id.clone(), user);
        }
        info!("{} user(s) online", users.len());
        Ok(())
    }

    /// Online users ordered by display name.
    pub fn online(&self) -> Vec<UserInfo> {
        let mut list: Vec<UserInfo> = lock(&self.users).values().cloned().collect();
        list.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        list
    }

    pub fn get(&self, user_id: &str) -> Option<UserInfo> {
        lock(&self.users).get(user_id).cloned()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        lock(&self.users).contains_key(user_id)
    }
}

fn lock(users: &Roster) -> MutexGuard<'_, BTreeMap<String, UserInfo>> {
    users.lock().unwrap_or_else(|p| p.into_inner())
}

fn apply(users: &Roster, info: UserInfo) {
    let mut users = lock(users);
    if info.is_online {
        debug!("{} is online", info.user_id);
        users.insert(info.user_id.clone(), info);
    } else {
        debug!("{} went offline", info.user_id);
        users.remove(&info.user_id);
    }
}
