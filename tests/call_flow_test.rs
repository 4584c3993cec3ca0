mod common;

use common::{Hub, connect_call, eventually, init_logging};
use peercall::calls::{
    CallError, CallSignal, IceCandidate, MediaError, PeerConnectionState, PeerEvent,
    SignalingCommand, TrackKind,
};
use peercall::{CallId, CallState, CallType, EndCallReason};
use std::time::Duration;

#[tokio::test]
async fn test_video_call_between_two_clients() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    let mut incoming = bob.engine.events().incoming_call.subscribe();
    let mut bob_finished = bob.engine.events().call_finished.subscribe();

    let call_id = connect_call(&alice, &bob, CallType::Video).await;

    let ring = incoming.recv().await.unwrap();
    assert_eq!(ring.call_id, call_id);
    assert_eq!(ring.initiator, "alice");
    assert_eq!(ring.call_type, CallType::Video);

    let caller = alice.snapshot();
    assert_eq!(caller.call_id, Some(call_id.clone()));
    assert_eq!(caller.receiver.as_deref(), Some("bob"));
    assert!(caller.connected_at.is_some());
    let callee = bob.snapshot();
    assert_eq!(callee.initiator.as_deref(), Some("alice"));
    assert!(callee.connected_at.is_some());

    assert_eq!(hub.methods_by("alice"), vec!["InitiateCall", "SendOffer"]);
    assert_eq!(hub.methods_by("bob"), vec!["AcceptCall", "SendAnswer"]);
    assert_eq!(bob.devices.streams()[0].tracks().len(), 2);

    // Each side applies the other's candidate after the remote description.
    let alice_peer = alice.peer();
    let bob_candidate = format!("add_candidate:{}", bob.peer().candidate());
    eventually("alice applies bob's candidate", || {
        alice_peer.ops().contains(&bob_candidate)
    })
    .await;
    let ops = alice_peer.ops();
    let remote = ops.iter().position(|op| op.starts_with("set_remote")).unwrap();
    let candidate = ops.iter().position(|op| *op == bob_candidate).unwrap();
    assert!(remote < candidate, "candidate applied before answer: {ops:?}");

    eventually("remote track reported", || {
        alice.snapshot().remote_stream.is_some_and(|s| s.tracks.len() == 1)
    })
    .await;

    alice.engine.end_call().await.unwrap();
    assert_eq!(alice.snapshot().state, CallState::Idle);
    bob.wait_for_state(CallState::Idle).await;

    let finished = bob_finished.recv().await.unwrap();
    assert_eq!(finished.call_id, call_id);
    assert_eq!(finished.reason, EndCallReason::RemoteEnded);
    assert_eq!(hub.methods_by("alice"), vec!["InitiateCall", "SendOffer", "EndCall"]);

    assert!(alice.devices.streams()[0].is_stopped());
    assert!(bob.devices.streams()[0].is_stopped());
    eventually("peer connections closed", || {
        alice.peer().is_closed() && bob.peer().is_closed()
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out_once() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let mut finished = alice.engine.events().call_finished.subscribe();

    let call_id = alice
        .engine
        .initiate_call("nobody", CallType::Voice)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(alice.snapshot().state, CallState::InitiatingOutgoing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = alice.snapshot();
    assert_eq!(snapshot.state, CallState::Error);
    assert_eq!(snapshot.error.as_deref(), Some("No answer"));
    assert_eq!(
        finished.recv().await.unwrap().reason,
        EndCallReason::Failed("No answer".to_string())
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(alice.snapshot().state, CallState::Idle);
    assert!(alice.devices.streams()[0].is_stopped());

    let declines: Vec<_> = hub
        .sent_by("alice")
        .into_iter()
        .filter(|c| matches!(c, SignalingCommand::DeclineCall { .. }))
        .collect();
    assert_eq!(
        declines,
        vec![SignalingCommand::DeclineCall {
            call_id,
            decliner_id: "alice".to_string(),
            is_busy: false,
        }]
    );
}

#[tokio::test]
async fn test_busy_callee_declines_second_call() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    let carol = hub.join("carol");
    let first = connect_call(&alice, &bob, CallType::Voice).await;

    let second = carol
        .engine
        .initiate_call("bob", CallType::Voice)
        .await
        .unwrap();
    carol.wait_for_state(CallState::Error).await;
    assert_eq!(carol.snapshot().error.as_deref(), Some("bob is busy"));

    assert!(hub.sent_by("bob").contains(&SignalingCommand::DeclineCall {
        call_id: second,
        decliner_id: "bob".to_string(),
        is_busy: true,
    }));
    let snapshot = bob.snapshot();
    assert_eq!(snapshot.state, CallState::Ongoing);
    assert_eq!(snapshot.call_id, Some(first));
    assert_eq!(bob.peers.count(), 1);
}

#[tokio::test]
async fn test_candidate_for_other_call_is_ignored() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    connect_call(&alice, &bob, CallType::Voice).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = alice.peer().ops();

    hub.deliver(
        "alice",
        CallSignal::ReceiveIceCandidate {
            call_id: CallId::new("SOME-OTHER-CALL"),
            candidate: IceCandidate::new("candidate:9 1 UDP 1 10.9.9.9 9 typ host"),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.peer().ops(), before);
    assert_eq!(alice.snapshot().state, CallState::Ongoing);
}

#[tokio::test]
async fn test_repeated_call_ended_is_harmless() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    let call_id = connect_call(&alice, &bob, CallType::Voice).await;
    let mut finished = alice.engine.events().call_finished.subscribe();

    bob.engine.end_call().await.unwrap();
    alice.wait_for_state(CallState::Idle).await;

    hub.deliver(
        "alice",
        CallSignal::CallEnded {
            call_id: call_id.clone(),
            ender_id: "bob".to_string(),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.snapshot().state, CallState::Idle);
    assert_eq!(finished.recv().await.unwrap().reason, EndCallReason::RemoteEnded);
    assert!(finished.try_recv().is_err());
    assert_eq!(hub.methods_by("alice"), vec!["InitiateCall", "SendOffer"]);
}

#[tokio::test]
async fn test_declined_call_releases_both_sides() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    let mut alice_finished = alice.engine.events().call_finished.subscribe();

    alice
        .engine
        .initiate_call("bob", CallType::Video)
        .await
        .unwrap();
    bob.wait_for_state(CallState::ReceivingIncoming).await;

    bob.engine.decline_call().await.unwrap();
    assert_eq!(bob.snapshot().state, CallState::Idle);
    assert!(bob.devices.streams().is_empty());
    assert_eq!(bob.peers.count(), 0);

    alice.wait_for_state(CallState::Idle).await;
    assert_eq!(
        alice_finished.recv().await.unwrap().reason,
        EndCallReason::RemoteDeclined
    );
    assert!(alice.devices.streams()[0].is_stopped());
    eventually("caller peer closed", || alice.peer().is_closed()).await;
}

#[tokio::test]
async fn test_callee_without_microphone_declines() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    bob.devices.deny_access();

    alice
        .engine
        .initiate_call("bob", CallType::Voice)
        .await
        .unwrap();
    bob.wait_for_state(CallState::ReceivingIncoming).await;

    let err = bob.engine.answer_call().await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Media(MediaError::PermissionDenied(_))
    ));
    assert_eq!(bob.snapshot().state, CallState::Error);
    eventually("callee declines", || hub.methods_by("bob") == vec!["DeclineCall"]).await;

    alice.wait_for_state(CallState::Idle).await;
    bob.wait_for_state(CallState::Idle).await;
}

#[tokio::test]
async fn test_early_candidates_wait_for_remote_offer() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");

    let call_id = alice
        .engine
        .initiate_call("bob", CallType::Voice)
        .await
        .unwrap();
    bob.wait_for_state(CallState::ReceivingIncoming).await;

    let early = "candidate:7 1 UDP 2130706431 192.168.1.7 7000 typ host";
    hub.deliver(
        "bob",
        CallSignal::ReceiveIceCandidate {
            call_id,
            candidate: IceCandidate::new(early),
        },
    );
    bob.engine.answer_call().await.unwrap();
    bob.wait_for_state(CallState::Ongoing).await;

    let ops = bob.peer().ops();
    assert!(ops[0].starts_with("add_local_stream"));
    assert!(ops[1].starts_with("set_remote:v=0 offer"));
    assert_eq!(ops[2], format!("add_candidate:{early}"));
    assert!(ops.contains(&"create_answer".to_string()));
}

#[tokio::test]
async fn test_mute_toggles_local_tracks() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    connect_call(&alice, &bob, CallType::Video).await;
    let stream = alice.engine.local_stream().await.unwrap();

    assert!(alice.engine.toggle_video_mute().await.unwrap());
    assert!(stream.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));
    assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
    assert!(alice.snapshot().is_local_video_muted);
    assert!(!alice.snapshot().is_local_audio_muted);

    assert!(!alice.engine.toggle_video_mute().await.unwrap());
    assert!(stream.tracks_of(TrackKind::Video).all(|t| t.is_enabled()));
}

#[tokio::test]
async fn test_lost_peer_connection_fails_then_resets() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    connect_call(&alice, &bob, CallType::Voice).await;

    alice
        .peer()
        .emit(PeerEvent::StateChanged(PeerConnectionState::Disconnected));
    alice.wait_for_state(CallState::Error).await;
    assert_eq!(
        alice.snapshot().error.as_deref(),
        Some("Peer connection disconnected")
    );

    // A new call is refused until the reset.
    assert!(matches!(
        alice.engine.initiate_call("bob", CallType::Voice).await,
        Err(CallError::CallInProgress)
    ));
    alice.wait_for_state(CallState::Idle).await;
    assert!(alice.snapshot().error.is_none());
}

#[tokio::test]
async fn test_shutdown_hangs_up_live_call() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    connect_call(&alice, &bob, CallType::Voice).await;

    alice.engine.shutdown();
    bob.wait_for_state(CallState::Idle).await;
    assert_eq!(hub.methods_by("alice").last(), Some(&"EndCall"));
}

#[tokio::test]
async fn test_every_command_carries_the_call_id() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    let call_id = connect_call(&alice, &bob, CallType::Video).await;

    let (alice_peer, bob_peer) = (alice.peer(), bob.peer());
    let from_bob = format!("add_candidate:{}", bob_peer.candidate());
    let from_alice = format!("add_candidate:{}", alice_peer.candidate());
    eventually("candidates trickled both ways", || {
        alice_peer.ops().contains(&from_bob) && bob_peer.ops().contains(&from_alice)
    })
    .await;

    alice.engine.end_call().await.unwrap();
    bob.wait_for_state(CallState::Idle).await;

    for user in ["alice", "bob"] {
        let sent = hub.sent_by(user);
        assert!(
            sent.iter()
                .any(|c| matches!(c, SignalingCommand::SendIceCandidate { .. })),
            "{user} sent no candidates"
        );
        for command in &sent {
            assert_eq!(
                command.call_id(),
                &call_id,
                "{user} sent {} for another call",
                command.method_name()
            );
        }
    }
    assert_eq!(hub.methods_by("alice").last(), Some(&"EndCall"));
}

#[tokio::test]
async fn test_negotiation_failure_ends_call_for_peer() {
    init_logging();
    let hub = Hub::new();
    let alice = hub.join("alice");
    let bob = hub.join("bob");
    bob.peers.fail_negotiation();
    let mut alice_finished = alice.engine.events().call_finished.subscribe();

    let call_id = alice
        .engine
        .initiate_call("bob", CallType::Voice)
        .await
        .unwrap();
    bob.wait_for_state(CallState::ReceivingIncoming).await;
    bob.engine.answer_call().await.unwrap();

    bob.wait_for_state(CallState::Error).await;
    assert!(
        bob.snapshot()
            .error
            .is_some_and(|e| e.starts_with("Negotiation failed"))
    );

    alice.wait_for_state(CallState::Idle).await;
    let finished = alice_finished.recv().await.unwrap();
    assert_eq!(finished.call_id, call_id);
    assert_eq!(finished.reason, EndCallReason::RemoteEnded);
    assert_eq!(hub.methods_by("bob"), vec!["AcceptCall", "EndCall"]);

    bob.wait_for_state(CallState::Idle).await;
}
