mod common;

use common::{wait_state, FakePeer, LossyFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use visiocall_lib::bridge::{NavigationDecision, NegotiationBridge};
use visiocall_lib::client::{CallClient, ClientEvent};
use visiocall_lib::config::{CallConfig, DeliveryMode};
use visiocall_lib::dispatcher::UiDispatcher;
use visiocall_lib::peer::{Delivery, MediaEngineShim, PendingMessageQueue};
use visiocall_lib::session::CallState;
use visiocall_lib::signaling::memory::MemoryHub;
use visiocall_lib::signaling::{SignalingChannel, SignalingEvent};

#[tokio::test(start_paused = true)]
async fn lossy_frame_still_delivers_offer_then_candidates() {
    let hub = MemoryHub::new();
    let alice = hub.connect("alice", "Alice");
    let bob = hub.connect("bob", "Bob");
    let mut bob_rx = bob.subscribe();

    let bridge = NegotiationBridge::new(alice, "visiocall", UiDispatcher::spawn());
    let frame = LossyFrame::new(bridge.ingress(), Duration::from_millis(40));
    let queue = PendingMessageQueue::spawn(frame.clone(), Duration::from_millis(100));
    let peer = FakePeer::new("alice");
    let shim = Arc::new(MediaEngineShim::new(
        peer.clone(),
        "visiocall",
        Delivery::Navigation(queue),
    ));
    bridge.attach(shim, "bob");

    bridge.request_offer().await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(bob_rx.recv().await.unwrap());
    }
    assert!(matches!(
        &received[0],
        SignalingEvent::OfferReceived { from, .. } if from == "alice"
    ));
    assert_eq!(
        received[1],
        SignalingEvent::IceCandidateReceived {
            from: "alice".into(),
            candidate: peer.candidate(1)
        }
    );
    assert_eq!(
        received[2],
        SignalingEvent::IceCandidateReceived {
            from: "alice".into(),
            candidate: peer.candidate(2)
        }
    );
    assert_eq!(frame.loads(), 3);
}

#[tokio::test(start_paused = true)]
async fn navigation_mode_call_connects() {
    let hub = MemoryHub::new();
    let config = CallConfig {
        delivery: Some(DeliveryMode::Navigation),
        ..CallConfig::default()
    };
    let alice = CallClient::new(hub.connect("alice", "Alice"), FakePeer::new("alice"), &config);
    let bob = CallClient::new(hub.connect("bob", "Bob"), FakePeer::new("bob"), &config);
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.start_call("bob", None).await.unwrap();
    wait_state(&mut bob_events, CallState::Ringing).await;
    let accepted_at = Instant::now();
    bob.accept().await.unwrap();

    wait_state(&mut alice_events, CallState::Connected).await;
    wait_state(&mut bob_events, CallState::Connected).await;
    // Every shim message waits out the settle interval before the next one
    assert!(accepted_at.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn foreign_page_loads_pass_through_the_hook() {
    let hub = MemoryHub::new();
    let client = CallClient::new(
        hub.connect("alice", "Alice"),
        FakePeer::new("alice"),
        &CallConfig::default(),
    );
    let ingress = client.ingress();
    assert_eq!(
        ingress.on_navigating("https://example.org/help"),
        NavigationDecision::Allow
    );
    assert_eq!(
        ingress.on_navigating("VISIOCALL://error/%22boom%22"),
        NavigationDecision::Cancel
    );
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn reattach_drops_burst_queued_for_previous_remote() {
    let hub = MemoryHub::new();
    let alice = hub.connect("alice", "Alice");
    let bob = hub.connect("bob", "Bob");
    let carol = hub.connect("carol", "Carol");
    let mut bob_rx = bob.subscribe();
    let mut carol_rx = carol.subscribe();

    let bridge = NegotiationBridge::new(alice, "visiocall", UiDispatcher::spawn());
    let mut bridge_events = bridge.subscribe();
    let frame = LossyFrame::new(bridge.ingress(), Duration::from_millis(40));
    let old = Arc::new(MediaEngineShim::new(
        FakePeer::new("alice"),
        "visiocall",
        Delivery::Navigation(PendingMessageQueue::spawn(
            frame.clone(),
            Duration::from_millis(100),
        )),
    ));
    bridge.attach(old.clone(), "bob");
    bridge.request_offer().await.unwrap();

    // Offer and both candidates are still in the old shim's queue
    let new = Arc::new(MediaEngineShim::new(
        FakePeer::new("alice"),
        "visiocall",
        Delivery::Direct(bridge.ingress()),
    ));
    bridge.attach(new, "carol");
    sleep(Duration::from_secs(1)).await;

    assert!(carol_rx.try_recv().is_err());
    assert!(bob_rx.try_recv().is_err());
    assert!(bridge_events.try_recv().is_err());
    assert!(frame.loads() <= 1);
}

fn errors(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<String> {
    let mut found = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ClientEvent::Error(text) = event {
            found.push(text);
        }
    }
    found
}

#[tokio::test(start_paused = true)]
async fn hang_up_discards_undelivered_candidates() {
    let hub = MemoryHub::new();
    let config = CallConfig {
        delivery: Some(DeliveryMode::Navigation),
        settle_interval_ms: 1000,
        ..CallConfig::default()
    };
    let bob_signaling = hub.connect("bob", "Bob");
    let mut bob_raw = bob_signaling.subscribe();
    let alice = CallClient::new(hub.connect("alice", "Alice"), FakePeer::new("alice"), &config);
    let bob = CallClient::new(bob_signaling, FakePeer::new("bob"), &config);
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.start_call("bob", None).await.unwrap();
    wait_state(&mut bob_events, CallState::Ringing).await;
    bob.accept().await.unwrap();
    wait_state(&mut alice_events, CallState::Connecting).await;

    // Offer is out, candidates wait for the next settle interval
    sleep(Duration::from_millis(100)).await;
    alice.hang_up().await.unwrap();
    wait_state(&mut alice_events, CallState::Idle).await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(errors(&mut alice_events), Vec::<String>::new());
    assert_eq!(errors(&mut bob_events), Vec::<String>::new());
    let mut offers = 0;
    while let Ok(event) = bob_raw.try_recv() {
        match event {
            SignalingEvent::OfferReceived { .. } => offers += 1,
            SignalingEvent::IceCandidateReceived { from, .. } => {
                panic!("candidate from {from} after hang-up")
            }
            _ => {}
        }
    }
    assert_eq!(offers, 1);
}
