use crate::call::auto_answer::AutoAnswerTimer;
use crate::dispatcher::UiDispatcher;
use crate::error::CallError;
use crate::history::{CallHistoryEntry, HistoryRecorder};
use crate::ringback::Ringback;
use crate::session::{CallState, Direction, Session, SessionSnapshot};
use crate::signaling::{CallRequest, SignalingChannel, SignalingEvent, Subscription};
use chrono::Local;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged(CallState),
    IncomingCall(CallRequest),
    CallAccepted,
    CallEnded,
}

struct EngineCore {
    session: Mutex<Session>,
    signaling: Arc<dyn SignalingChannel>,
    ringback: Arc<dyn Ringback>,
    history: Arc<dyn HistoryRecorder>,
    ui: UiDispatcher,
    events: broadcast::Sender<EngineEvent>,
}

/// Машина состояний звонка.
///
/// Every transition runs as a job on the [`UiDispatcher`], so transitions are
/// applied strictly in the order their triggers were observed. Signaling
/// events and the auto-answer timer arrive on background tasks and post their
/// continuation onto the dispatcher.
#[derive(Clone)]
pub struct CallEngine {
    core: Arc<EngineCore>,
    listener: Arc<Mutex<Option<Subscription>>>,
}

impl CallEngine {
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        ringback: Arc<dyn Ringback>,
        history: Arc<dyn HistoryRecorder>,
        ui: UiDispatcher,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let core = Arc::new(EngineCore {
            session: Mutex::new(Session::idle(0)),
            signaling,
            ringback,
            history,
            ui,
            events,
        });

        let listener = Subscription::spawn(core.signaling.subscribe(), {
            let weak = Arc::downgrade(&core);
            move |event: SignalingEvent| {
                let weak = weak.clone();
                async move {
                    let Some(core) = weak.upgrade() else { return };
                    let ui = core.ui.clone();
                    ui.post(async move { core.on_signal(event) });
                }
            }
        });

        Self {
            core,
            listener: Arc::new(Mutex::new(Some(listener))),
        }
    }

    /// Исходящий звонок. Fails without touching the session when the callee
    /// cannot be reached; no retry.
    pub async fn start_call(
        &self,
        callee_id: &str,
        callee_name: Option<&str>,
    ) -> Result<(), CallError> {
        let core = self.core.clone();
        let id = callee_id.to_owned();
        let name = callee_name.map(str::to_owned);
        self.core
            .ui
            .run(async move { core.start_call(id, name).await })
            .await
            .ok_or(CallError::Dispatcher)?
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        let core = self.core.clone();
        self.core
            .ui
            .run(async move { core.accept().await })
            .await
            .ok_or(CallError::Dispatcher)?
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        let core = self.core.clone();
        self.core
            .ui
            .run(async move { core.reject().await })
            .await
            .ok_or(CallError::Dispatcher)?
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        let core = self.core.clone();
        self.core
            .ui
            .run(async move { core.hang_up().await })
            .await
            .ok_or(CallError::Dispatcher)?
    }

    /// Media engine reported ICE connected.
    pub async fn set_connected(&self) -> Result<(), CallError> {
        let core = self.core.clone();
        self.core
            .ui
            .run(async move { core.set_connected() })
            .await
            .ok_or(CallError::Dispatcher)?
    }

    /// Teardown: ends an active call and stops listening to signaling.
    /// No handler of this engine runs afterwards.
    pub async fn shutdown(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.unsubscribe();
        }
        let core = self.core.clone();
        if self.core.ui.run(async move { core.shutdown().await }).await.is_none() {
            warn!("ui dispatcher is gone, engine shut down without cleanup");
        }
    }

    pub fn state(&self) -> CallState {
        self.core.session().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core.session().snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }
}

impl EngineCore {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, s: &mut Session, state: CallState) {
        info!("[{}] {:?} -> {:?}", s.call_id, s.state, state);
        s.state = state;
        let _ = self.events.send(EngineEvent::StateChanged(state));
    }

    fn on_signal(self: Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingCall(request) => self.on_incoming(request),
            SignalingEvent::CallResponseReceived { from, accepted } => {
                self.on_response(&from, accepted)
            }
            SignalingEvent::CallEnded { from } => self.on_remote_end(&from),
            // Negotiation traffic and presence are not ours
            _ => {}
        }
    }

    async fn start_call(
        self: Arc<Self>,
        callee_id: String,
        callee_name: Option<String>,
    ) -> Result<(), CallError> {
        let current = self.session().state;
        if current.is_active() {
            warn!("start_call({callee_id}) while {current:?}");
            return Err(CallError::InvalidState(current));
        }

        info!("calling {callee_id}");
        let response = match self.signaling.initiate_call(&callee_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!("initiate_call({callee_id}) failed: {e}");
                return Err(e.into());
            }
        };
        if !response.success {
            warn!("{callee_id} could not be reached");
            return Err(CallError::NotDelivered(callee_id));
        }

        let mut s = self.session();
        let name = callee_name.unwrap_or_else(|| callee_id.clone());
        s.begin(Direction::Outgoing, callee_id, Some(name));
        self.set_state(&mut s, CallState::Calling);
        Ok(())
    }

    fn on_incoming(self: Arc<Self>, request: CallRequest) {
        let mut s = self.session();
        if s.state.is_active() {
            warn!(
                "busy ({:?}), ignoring incoming call from {}",
                s.state, request.caller_id
            );
            return;
        }

        let name = if request.caller_name.is_empty() {
            request.caller_id.clone()
        } else {
            request.caller_name.clone()
        };
        s.begin(Direction::Incoming, request.caller_id.clone(), Some(name));
        self.set_state(&mut s, CallState::Ringing);

        let generation = s.generation;
        let weak = Arc::downgrade(&self);
        s.auto_answer = Some(AutoAnswerTimer::start(self.ringback.clone(), move || {
            if let Some(core) = weak.upgrade() {
                let ui = core.ui.clone();
                ui.post(async move { core.auto_answer(generation).await });
            }
        }));
        drop(s);

        let _ = self.events.send(EngineEvent::IncomingCall(request));
    }

    async fn auto_answer(self: Arc<Self>, generation: u64) {
        {
            let s = self.session();
            if s.generation != generation || s.state != CallState::Ringing {
                debug!(
                    "auto-answer for generation {generation} dropped, session is {:?}",
                    s.state
                );
                return;
            }
        }
        info!("no answer after the ring cycle, auto-answering");
        if let Err(e) = self.accept().await {
            error!("auto-answer failed: {e}");
        }
    }

    fn ringing_caller(&self) -> Result<String, CallError> {
        let s = self.session();
        match (&s.state, &s.remote_participant_id) {
            (CallState::Ringing, Some(id)) => Ok(id.clone()),
            (state, _) => Err(CallError::InvalidState(*state)),
        }
    }

    async fn accept(&self) -> Result<(), CallError> {
        let caller = self.ringing_caller()?;
        // The dispatcher runs nothing else while we wait here.
        // Ответ уходит до отмены таймера: при ошибке остаёмся в Ringing с живым таймером
        self.signaling.respond_to_call(&caller, true).await?;

        let mut s = self.session();
        s.cancel_auto_answer();
        self.ringback.stop_ringing();
        self.set_state(&mut s, CallState::Connecting);
        drop(s);

        let _ = self.events.send(EngineEvent::CallAccepted);
        Ok(())
    }

    async fn reject(&self) -> Result<(), CallError> {
        let caller = self.ringing_caller()?;
        self.signaling.respond_to_call(&caller, false).await?;

        let mut s = self.session();
        s.cancel_auto_answer();
        self.ringback.stop_ringing();
        self.finish(&mut s);
        Ok(())
    }

    async fn hang_up(&self) -> Result<(), CallError> {
        let remote = {
            let s = self.session();
            if !s.state.is_active() {
                return Err(CallError::InvalidState(s.state));
            }
            s.remote_participant_id.clone()
        };
        if let Some(id) = &remote {
            self.signaling.end_call(id).await?;
        }

        let mut s = self.session();
        s.cancel_auto_answer();
        self.ringback.stop_ringing();
        self.finish(&mut s);
        Ok(())
    }

    async fn shutdown(&self) {
        let remote = {
            let mut s = self.session();
            s.cancel_auto_answer();
            s.state.is_active().then(|| s.remote_participant_id.clone()).flatten()
        };
        self.ringback.stop_ringing();
        let Some(id) = remote else { return };

        info!("shutting down during a call with {id}");
        if let Err(e) = self.signaling.end_call(&id).await {
            warn!("end_call({id}) on shutdown failed: {e}");
        }
        let mut s = self.session();
        self.finish(&mut s);
    }

    fn on_response(&self, from: &str, accepted: bool) {
        let mut s = self.session();
        if s.state != CallState::Calling || s.remote_participant_id.as_deref() != Some(from) {
            warn!("stray call response from {from} while {:?}", s.state);
            return;
        }
        if accepted {
            self.set_state(&mut s, CallState::Connecting);
            drop(s);
            let _ = self.events.send(EngineEvent::CallAccepted);
        } else {
            info!("{from} declined the call");
            self.finish(&mut s);
        }
    }

    fn on_remote_end(&self, from: &str) {
        let mut s = self.session();
        if !s.state.is_active() || s.remote_participant_id.as_deref() != Some(from) {
            debug!("call-ended from {from} does not match the current call");
            return;
        }
        info!("{from} ended the call");
        s.cancel_auto_answer();
        self.ringback.stop_ringing();
        self.finish(&mut s);
    }

    fn set_connected(&self) -> Result<(), CallError> {
        let mut s = self.session();
        match s.state {
            CallState::Connecting => {
                s.mark_connected(Instant::now());
                self.set_state(&mut s, CallState::Connected);
                Ok(())
            }
            // ICE may report connected again after a blip
            CallState::Connected => Ok(()),
            other => Err(CallError::InvalidState(other)),
        }
    }

    /// Переход в Ended: запись в историю, затем новая пустая сессия.
    fn finish(&self, s: &mut Session) {
        s.cancel_auto_answer();
        if let Some(user_id) = s.remote_participant_id.take() {
            let display_name = s
                .remote_display_name
                .take()
                .unwrap_or_else(|| user_id.clone());
            self.history.append(CallHistoryEntry {
                user_id,
                display_name,
                timestamp: Local::now(),
                direction: s.direction,
                duration_seconds: s.duration_secs(Instant::now()),
            });
        }
        s.remote_display_name = None;
        self.set_state(s, CallState::Ended);
        let _ = self.events.send(EngineEvent::CallEnded);

        *s = Session::idle(s.generation);
        self.set_state(s, CallState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalingError;
    use crate::history::MemoryHistory;
    use crate::peer::types::{IceCandidate, SessionDescription};
    use crate::ringback::PatternRingback;
    use crate::signaling::{CallResponse, UserInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct RecordingSignaling {
        calls: Mutex<Vec<String>>,
        events: broadcast::Sender<SignalingEvent>,
        reachable: AtomicBool,
        responses_fail: AtomicBool,
    }

    impl RecordingSignaling {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                events: broadcast::channel(32).0,
                reachable: AtomicBool::new(true),
                responses_fail: AtomicBool::new(false),
            })
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        fn inject(&self, event: SignalingEvent) {
            // No receivers once the engine has shut down
            let _ = self.events.send(event);
        }
    }

    #[async_trait]
    impl SignalingChannel for RecordingSignaling {
        async fn get_online_users(&self) -> Result<Vec<UserInfo>, SignalingError> {
            Ok(Vec::new())
        }
        async fn initiate_call(&self, callee_id: &str) -> Result<CallResponse, SignalingError> {
            self.record(format!("initiate:{callee_id}"));
            Ok(CallResponse {
                success: self.reachable.load(Ordering::SeqCst),
            })
        }
        async fn respond_to_call(&self, caller_id: &str, accepted: bool) -> Result<(), SignalingError> {
            self.record(format!("respond:{caller_id}:{accepted}"));
            if self.responses_fail.load(Ordering::SeqCst) {
                return Err(SignalingError::Transport("connection reset".into()));
            }
            Ok(())
        }
        async fn end_call(&self, participant_id: &str) -> Result<(), SignalingError> {
            self.record(format!("end:{participant_id}"));
            Ok(())
        }
        async fn send_offer(&self, _: &str, _: SessionDescription) -> Result<(), SignalingError> {
            Ok(())
        }
        async fn send_answer(&self, _: &str, _: SessionDescription) -> Result<(), SignalingError> {
            Ok(())
        }
        async fn send_ice_candidate(&self, _: &str, _: IceCandidate) -> Result<(), SignalingError> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
            self.events.subscribe()
        }
    }

    struct Harness {
        engine: CallEngine,
        signaling: Arc<RecordingSignaling>,
        ringback: Arc<PatternRingback>,
        history: Arc<MemoryHistory>,
        events: broadcast::Receiver<EngineEvent>,
    }

    fn harness() -> Harness {
        let signaling = RecordingSignaling::new();
        let ringback = Arc::new(PatternRingback::new(3, Duration::from_secs(5)));
        let history = Arc::new(MemoryHistory::default());
        let engine = CallEngine::new(
            signaling.clone(),
            ringback.clone(),
            history.clone(),
            UiDispatcher::spawn(),
        );
        let events = engine.subscribe();
        Harness {
            engine,
            signaling,
            ringback,
            history,
            events,
        }
    }

    async fn wait_state(rx: &mut broadcast::Receiver<EngineEvent>, want: CallState) {
        loop {
            if let EngineEvent::StateChanged(s) = rx.recv().await.unwrap() {
                if s == want {
                    return;
                }
            }
        }
    }

    fn assert_idle_invariant(engine: &CallEngine) {
        let snap = engine.snapshot();
        assert_eq!(
            snap.state == CallState::Idle,
            snap.remote_participant_id.is_none(),
            "{snap:?}"
        );
    }

    fn ring_from(h: &Harness, caller: &str) {
        h.signaling.inject(SignalingEvent::IncomingCall(CallRequest {
            caller_id: caller.into(),
            caller_name: format!("{caller} name"),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initiate_leaves_idle() {
        let h = harness();
        h.signaling.reachable.store(false, Ordering::SeqCst);

        let err = h.engine.start_call("bob", Some("Bob")).await.unwrap_err();
        assert!(matches!(err, CallError::NotDelivered(ref id) if id == "bob"));
        assert_eq!(h.engine.state(), CallState::Idle);
        assert!(h.history.is_empty());
        assert_idle_invariant(&h.engine);
    }

    #[tokio::test(start_paused = true)]
    async fn outgoing_call_uses_id_as_default_name() {
        let h = harness();
        h.engine.start_call("bob", None).await.unwrap();
        let snap = h.engine.snapshot();
        assert_eq!(snap.state, CallState::Calling);
        assert_eq!(snap.remote_display_name.as_deref(), Some("bob"));
        assert_idle_invariant(&h.engine);

        let again = h.engine.start_call("carol", None).await.unwrap_err();
        assert!(matches!(again, CallError::InvalidState(CallState::Calling)));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_answers_after_ring_cycle() {
        let mut h = harness();
        ring_from(&h, "alice");
        wait_state(&mut h.events, CallState::Ringing).await;
        assert!(h.engine.snapshot().auto_answer_pending);

        wait_state(&mut h.events, CallState::Connecting).await;

        assert_eq!(h.signaling.count("respond:alice:true"), 1);
        assert_eq!(h.ringback.stats().cycles, 1);
        assert_eq!(h.ringback.stats().stops, 1);
        assert!(!h.engine.snapshot().auto_answer_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_accept_keeps_ringing_and_timer() {
        let mut h = harness();
        ring_from(&h, "alice");
        wait_state(&mut h.events, CallState::Ringing).await;

        h.signaling.responses_fail.store(true, Ordering::SeqCst);
        let err = h.engine.accept().await.unwrap_err();
        assert!(matches!(err, CallError::Signaling(_)));
        assert_eq!(h.engine.state(), CallState::Ringing);
        assert!(h.engine.snapshot().auto_answer_pending);
        assert_eq!(h.ringback.stats().stops, 0);

        // The timer still answers once the transport is back
        h.signaling.responses_fail.store(false, Ordering::SeqCst);
        wait_state(&mut h.events, CallState::Connecting).await;
        assert_eq!(h.signaling.count("respond:alice:true"), 2);
        assert_eq!(h.ringback.stats().stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_just_before_timeout_wins() {
        let mut h = harness();
        ring_from(&h, "alice");
        wait_state(&mut h.events, CallState::Ringing).await;

        tokio::time::sleep(Duration::from_millis(14_999)).await;
        h.engine.reject().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(h.signaling.calls(), vec!["respond:alice:false".to_string()]);
        assert_eq!(h.ringback.stats().stops, 1);

        let entries = h.history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration_seconds, 0);
        assert_eq!(entries[0].direction, Direction::Incoming);
        assert_idle_invariant(&h.engine);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_end_while_ringing_cancels_timer() {
        let mut h = harness();
        ring_from(&h, "alice");
        wait_state(&mut h.events, CallState::Ringing).await;

        h.signaling.inject(SignalingEvent::CallEnded {
            from: "alice".into(),
        });
        wait_state(&mut h.events, CallState::Idle).await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(h.signaling.count("respond:alice:true"), 0);
        // The other side is already gone
        assert_eq!(h.signaling.count("end:alice"), 0);
        assert_eq!(h.ringback.stats().stops, 1);
        assert_eq!(h.history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_decline_is_recorded() {
        let mut h = harness();
        h.engine.start_call("bob", Some("Bob")).await.unwrap();
        h.signaling.inject(SignalingEvent::CallResponseReceived {
            from: "bob".into(),
            accepted: false,
        });
        wait_state(&mut h.events, CallState::Ended).await;
        wait_state(&mut h.events, CallState::Idle).await;

        let entries = h.history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name, "Bob");
        assert!(entries[0].is_outgoing());
        assert_eq!(entries[0].duration_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_records_connected_duration() {
        let mut h = harness();
        h.engine.start_call("bob", Some("Bob")).await.unwrap();
        h.signaling.inject(SignalingEvent::CallResponseReceived {
            from: "bob".into(),
            accepted: true,
        });
        wait_state(&mut h.events, CallState::Connecting).await;
        h.engine.set_connected().await.unwrap();
        assert_eq!(h.engine.state(), CallState::Connected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.engine.hang_up().await.unwrap();

        assert_eq!(h.signaling.count("end:bob"), 1);
        let entries = h.history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration_seconds, 30);
        assert_idle_invariant(&h.engine);
    }

    #[tokio::test(start_paused = true)]
    async fn second_incoming_call_is_ignored_while_busy() {
        let mut h = harness();
        h.engine.start_call("bob", None).await.unwrap();
        wait_state(&mut h.events, CallState::Calling).await;
        ring_from(&h, "mallory");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snap = h.engine.snapshot();
        assert_eq!(snap.state, CallState::Calling);
        assert_eq!(snap.remote_participant_id.as_deref(), Some("bob"));
        assert_eq!(h.ringback.stats().cycles, 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_when_idle_is_rejected() {
        let h = harness();
        let err = h.engine.hang_up().await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(CallState::Idle)));
        assert!(h.signaling.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_ringing_call_and_stops_listening() {
        let mut h = harness();
        ring_from(&h, "alice");
        wait_state(&mut h.events, CallState::Ringing).await;

        h.engine.shutdown().await;
        assert_eq!(h.signaling.count("end:alice"), 1);
        assert_eq!(h.history.len(), 1);
        assert_idle_invariant(&h.engine);

        ring_from(&h, "bob");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.engine.state(), CallState::Idle);
        assert_eq!(h.signaling.count("respond:alice:true"), 0);
    }
}
