//! Zwei Engines über ein In-Memory Netz

use avcall::call_engine::{CallEngine, CallEvent, CallState, ChatId, EndReason, VirtualDevices};
use avcall::config::EngineConfig;
use avcall::crypto::KeyPair;
use avcall::database::CallLog;
use avcall::signaling::{CallControl, MemoryNetwork};
use avcall::CallApp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn app(network: &MemoryNetwork, id: &str) -> CallApp {
    let (transport, inbound_rx) = network.endpoint(id);
    let engine = Arc::new(CallEngine::new(
        EngineConfig::default(),
        Arc::new(VirtualDevices::new()),
        Arc::new(transport),
    ));
    engine.setup().unwrap();

    let app = CallApp::with_parts(
        engine,
        Arc::new(KeyPair::generate()),
        Arc::new(CallLog::open_in_memory().unwrap()),
    );
    app.spawn_signal_pump(inbound_rx);
    app.spawn_history_recorder();
    app
}

/// Wartet auf das erste Event, das `pick` akzeptiert
async fn wait_for<T>(
    events: &mut broadcast::Receiver<CallEvent>,
    mut pick: impl FnMut(CallEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(event) = events.recv().await {
                if let Some(value) = pick(event) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("event not received in time")
}

async fn wait_for_state(events: &mut broadcast::Receiver<CallEvent>, wanted: CallState) {
    wait_for(events, |event| match event {
        CallEvent::StateChanged { state, .. } if state == wanted => Some(()),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn test_call_between_two_engines() {
    let network = MemoryNetwork::new();
    let alice = app(&network, "alice");
    let bob = app(&network, "bob");

    let mut alice_events = alice.engine().subscribe();
    let mut bob_events = bob.engine().subscribe();

    let outgoing = alice
        .engine()
        .start_call(ChatId::new("bob"), true, true)
        .await
        .unwrap();

    let incoming = wait_for(&mut bob_events, |event| match event {
        CallEvent::IncomingCall(call) => Some(call),
        _ => None,
    })
    .await;
    assert_eq!(incoming.chat, ChatId::new("alice"));
    assert!(incoming.peer_video_enabled);

    wait_for_state(&mut alice_events, CallState::Ringing).await;

    bob.engine().answer(incoming.handle, true, false).await.unwrap();
    wait_for_state(&mut alice_events, CallState::Active).await;

    let active = alice.engine().call(outgoing.handle).unwrap();
    assert!(active.peer_audio_enabled);
    assert!(!active.peer_video_enabled);

    alice
        .engine()
        .send_control(outgoing.handle, CallControl::Pause)
        .await
        .unwrap();
    wait_for_state(&mut bob_events, CallState::OnHold).await;

    bob.engine().end_call(incoming.handle).await.unwrap();
    let ended = wait_for(&mut alice_events, |event| match event {
        CallEvent::CallEnded(call) => Some(call),
        _ => None,
    })
    .await;
    assert_eq!(ended.end_reason, Some(EndReason::Remote));
    assert_eq!(alice.engine().media().camera_owner(), None);

    // Beide Seiten landen in ihrer Anrufliste
    for side in [&alice, &bob] {
        let mut count = 0;
        for _ in 0..50 {
            count = side.call_log().count().unwrap();
            if count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 1);
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_busy_when_callee_already_in_call() {
    let network = MemoryNetwork::new();
    let alice = app(&network, "alice");
    let bob = app(&network, "bob");
    let _carol = app(&network, "carol");

    let mut alice_events = alice.engine().subscribe();

    // bob ruft zuerst alice an
    bob.engine()
        .start_call(ChatId::new("alice"), true, false)
        .await
        .unwrap();
    wait_for(&mut alice_events, |event| match event {
        CallEvent::IncomingCall(call) => Some(call),
        _ => None,
    })
    .await;

    // alice hat bereits einen Call mit bob; ein zweiter Versuch scheitert lokal
    let err = alice
        .engine()
        .start_call(ChatId::new("bob"), true, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), avcall::call_engine::ErrorKind::DuplicateCall);

    // carol ist frei
    let to_carol = alice
        .engine()
        .start_call(ChatId::new("carol"), true, false)
        .await
        .unwrap();
    assert_eq!(to_carol.state, CallState::Dialing);
}

#[tokio::test]
async fn test_offline_peer_ends_dialing_call() {
    let network = MemoryNetwork::new();
    let alice = app(&network, "alice");
    let bob = app(&network, "bob");
    let mut bob_events = bob.engine().subscribe();

    network.disconnect(&ChatId::new("alice"));

    // bob erreicht alice nicht mehr
    let err = bob
        .engine()
        .start_call(ChatId::new("alice"), true, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), avcall::call_engine::ErrorKind::Transport);

    let ended = wait_for(&mut bob_events, |event| match event {
        CallEvent::CallEnded(call) => Some(call),
        _ => None,
    })
    .await;
    assert_eq!(ended.end_reason, Some(EndReason::Unreachable));
    assert!(alice.engine().calls().is_empty());
}
