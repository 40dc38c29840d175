use crate::call::auto_answer::AutoAnswerTimer;
use crate::utils::random_id;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl CallState {
    /// A call is in progress (anything between start and end).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connecting | CallState::Connected
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Текущий звонок. Один на устройство, звонки только последовательно.
///
/// Fields are mutated only by the call engine's transition code, which runs on
/// the UI dispatcher.
#[derive(Debug)]
pub struct Session {
    /// Bumped for every new call; stale timer firings compare against it
    pub generation: u64,
    /// Random id used to correlate log lines of one call
    pub call_id: String,
    pub state: CallState,
    pub remote_participant_id: Option<String>,
    pub remote_display_name: Option<String>,
    pub direction: Direction,
    pub connected_at: Option<Instant>,
    pub auto_answer: Option<AutoAnswerTimer>,
}

impl Session {
    pub fn idle(generation: u64) -> Self {
        Self {
            generation,
            call_id: random_id(),
            state: CallState::Idle,
            remote_participant_id: None,
            remote_display_name: None,
            direction: Direction::Outgoing,
            connected_at: None,
            auto_answer: None,
        }
    }

    /// Fresh session for a new call; everything from the previous call is dropped.
    pub fn begin(
        &mut self,
        direction: Direction,
        remote_id: String,
        display_name: Option<String>,
    ) {
        let generation = self.generation + 1;
        *self = Session::idle(generation);
        self.direction = direction;
        self.remote_participant_id = Some(remote_id);
        self.remote_display_name = display_name;
    }

    /// Sets the connect timestamp once; later calls keep the first value.
    pub fn mark_connected(&mut self, now: Instant) {
        if self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
    }

    /// Whole seconds since connect, 0 if never connected
    pub fn duration_secs(&self, now: Instant) -> u64 {
        self.connected_at
            .map(|at| now.saturating_duration_since(at).as_secs())
            .unwrap_or(0)
    }

    /// Cancels and drops the auto-answer timer, if any.
    pub fn cancel_auto_answer(&mut self) {
        if let Some(timer) = self.auto_answer.take() {
            timer.cancel();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id.clone(),
            state: self.state,
            remote_participant_id: self.remote_participant_id.clone(),
            remote_display_name: self.remote_display_name.clone(),
            direction: self.direction,
            connected: self.connected_at.is_some(),
            auto_answer_pending: self.auto_answer.is_some(),
        }
    }
}

/// Read-only copy of the session handed out to callers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub call_id: String,
    pub state: CallState,
    pub remote_participant_id: Option<String>,
    pub remote_display_name: Option<String>,
    pub direction: Direction,
    pub connected: bool,
    pub auto_answer_pending: bool,
}
