//! Integration tests for end-to-end collaboration over the relay.
//!
//! These tests start a real relay server and connect real WebSocket
//! clients; media and peer transports are the scripted fakes.

use std::sync::Arc;

use lectio_collab::call::{CallConfig, CallOrchestrator, LinkRole, LinkState};
use lectio_collab::protocol::{ParticipantInfo, SignalMessage};
use lectio_collab::server::{RelayServer, ServerConfig};
use lectio_collab::signaling::{ConnectionState, SignalHub, SignalingChannel, WsSignaling};
use lectio_collab::testing::{ConnectMode, DeviceMode, FakeMediaDevices, FakePeerFactory};
use lectio_collab::{StudyCoordinator, UiEvent};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Start a relay on a free port, return it with its URL.
async fn start_test_server() -> (Arc<RelayServer>, String) {
    init_logging();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_participants_per_room: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(RelayServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

/// Wait for the first message matching `pred`.
async fn recv_matching(
    rx: &mut broadcast::Receiver<SignalMessage>,
    mut pred: impl FnMut(&SignalMessage) -> bool,
) -> SignalMessage {
    timeout(Duration::from_secs(3), async {
        loop {
            let msg = rx.recv().await.unwrap();
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("message not received within timeout")
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_join_over_relay_receives_snapshot() {
    let (_server, url) = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = WsSignaling::connect(ParticipantInfo::new("Alice"), &url).await.unwrap();
    let mut rx = alice.subscribe();
    alice.join_room(room).await.unwrap();

    let msg = recv_matching(&mut rx, |m| matches!(m, SignalMessage::RoomSnapshot { .. })).await;
    match msg {
        SignalMessage::RoomSnapshot { room: r, participants, position } => {
            assert_eq!(r, room);
            assert_eq!(participants.len(), 1);
            assert_eq!(participants[0].name, "Alice");
            assert!(position.is_none());
        }
        other => panic!("Expected snapshot, got {other:?}"),
    }
    assert_eq!(alice.members(room).await.len(), 1);
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_frames_before_join_are_rejected() {
    let (server, url) = start_test_server().await;
    let alice = WsSignaling::connect(ParticipantInfo::new("Alice"), &url).await.unwrap();

    alice
        .emit(SignalMessage::Navigate {
            room: Uuid::new_v4(),
            position: "Section-1".into(),
            actor: alice.participant().clone(),
            timestamp: None,
        })
        .await
        .unwrap();

    wait_until(|| {
        let server = server.clone();
        async move { server.stats().await.rejected_messages == 1 }
    })
    .await;
    assert_eq!(server.hub().room_count().await, 0);
}

#[tokio::test]
async fn test_navigation_conflict_over_relay() {
    let (server, url) = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = WsSignaling::connect(ParticipantInfo::new("Alice"), &url).await.unwrap();
    let bob = WsSignaling::connect(ParticipantInfo::new("Bob"), &url).await.unwrap();
    let mut alice_rx = alice.subscribe();
    let mut bob_rx = bob.subscribe();

    alice.join_room(room).await.unwrap();
    recv_matching(&mut alice_rx, |m| matches!(m, SignalMessage::RoomSnapshot { .. })).await;
    bob.join_room(room).await.unwrap();
    recv_matching(&mut bob_rx, |m| matches!(m, SignalMessage::RoomSnapshot { .. })).await;

    alice
        .emit(SignalMessage::Navigate {
            room,
            position: "Section-5".into(),
            actor: alice.participant().clone(),
            timestamp: Some(1_000),
        })
        .await
        .unwrap();
    recv_matching(&mut bob_rx, |m| matches!(m, SignalMessage::PositionChanged { .. })).await;

    bob.emit(SignalMessage::Navigate {
        room,
        position: "Section-9".into(),
        actor: bob.participant().clone(),
        timestamp: Some(3_000),
    })
    .await
    .unwrap();

    for rx in [&mut alice_rx, &mut bob_rx] {
        let msg = recv_matching(rx, |m| matches!(m, SignalMessage::ConflictResolved { .. })).await;
        match msg {
            SignalMessage::ConflictResolved { winner, rejected } => {
                assert_eq!(winner.position, "Section-9");
                assert_eq!(winner.actor.name, "Bob");
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].position, "Section-5");
            }
            other => panic!("Expected conflict, got {other:?}"),
        }
    }

    assert_eq!(
        server.hub().canonical_position(room).await.as_deref(),
        Some("Section-9")
    );
}

#[tokio::test]
async fn test_late_joiner_sees_settled_position() {
    let (_server, url) = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = WsSignaling::connect(ParticipantInfo::new("Alice"), &url).await.unwrap();
    let mut alice_rx = alice.subscribe();
    alice.join_room(room).await.unwrap();
    recv_matching(&mut alice_rx, |m| matches!(m, SignalMessage::RoomSnapshot { .. })).await;
    alice
        .emit(SignalMessage::Navigate {
            room,
            position: "Section-2".into(),
            actor: alice.participant().clone(),
            timestamp: None,
        })
        .await
        .unwrap();
    recv_matching(&mut alice_rx, |m| matches!(m, SignalMessage::PositionChanged { .. })).await;

    let carol = WsSignaling::connect(ParticipantInfo::new("Carol"), &url).await.unwrap();
    let mut carol_rx = carol.subscribe();
    carol.join_room(room).await.unwrap();
    let msg = recv_matching(&mut carol_rx, |m| matches!(m, SignalMessage::RoomSnapshot { .. })).await;
    match msg {
        SignalMessage::RoomSnapshot { participants, position, .. } => {
            assert_eq!(participants.len(), 2);
            assert_eq!(position.as_deref(), Some("Section-2"));
        }
        other => panic!("Expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let (server, url) = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = WsSignaling::connect(ParticipantInfo::new("Alice"), &url).await.unwrap();
    let bob = WsSignaling::connect(ParticipantInfo::new("Bob"), &url).await.unwrap();
    let mut alice_rx = alice.subscribe();
    alice.join_room(room).await.unwrap();
    bob.join_room(room).await.unwrap();
    recv_matching(&mut alice_rx, |m| {
        matches!(m, SignalMessage::RoomSnapshot { participants, .. } if participants.len() == 2)
    })
    .await;

    bob.disconnect().await;
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);

    recv_matching(&mut alice_rx, |m| {
        matches!(m, SignalMessage::RoomSnapshot { participants, .. } if participants.len() == 1)
    })
    .await;
    let members = server.hub().members(room).await;
    assert!(members.iter().all(|p| p.id != bob.participant().id));
}

#[tokio::test]
async fn test_call_over_relay_connects_both_sides() {
    let (server, url) = start_test_server().await;
    let room = Uuid::new_v4();

    let mut calls = Vec::new();
    for name in ["Alice", "Bob"] {
        let signaling = Arc::new(WsSignaling::connect(ParticipantInfo::new(name), &url).await.unwrap());
        let mut rx = signaling.subscribe();
        signaling.join_room(room).await.unwrap();
        recv_matching(&mut rx, |m| matches!(m, SignalMessage::RoomSnapshot { .. })).await;
        let call = CallOrchestrator::new(
            CallConfig::default(),
            Arc::new(FakeMediaDevices::new(DeviceMode::AudioVideo)),
            Arc::new(FakePeerFactory::new(ConnectMode::Auto)),
            signaling.clone(),
        );
        calls.push((signaling, call));
    }

    // One at a time, so the relay sees Alice in the call before Bob.
    for (signaling, call) in &calls {
        call.initialize_call(room, signaling.participant().clone(), false)
            .await
            .unwrap();
        let id = signaling.participant().id;
        wait_until(|| {
            let server = server.clone();
            async move { server.hub().in_call(room, id).await }
        })
        .await;
    }

    let (alice, alice_call) = &calls[0];
    let (bob, bob_call) = &calls[1];
    wait_until(|| async move {
        alice_call
            .state()
            .participants
            .get(&bob.participant().id)
            .is_some_and(|p| p.link == LinkState::Connected)
            && bob_call
                .state()
                .participants
                .get(&alice.participant().id)
                .is_some_and(|p| p.link == LinkState::Connected)
    })
    .await;

    // Alice was already in the call, so Alice offered and Bob answered.
    let bob_view = bob_call.state();
    assert_eq!(bob_view.participants[&alice.participant().id].role, LinkRole::Responder);
    assert_eq!(bob_view.participants[&alice.participant().id].name, "Alice");
    let alice_view = alice_call.state();
    assert_eq!(alice_view.participants[&bob.participant().id].role, LinkRole::Initiator);
    assert_eq!(alice_view.participants[&bob.participant().id].name, "Bob");

    bob_call.leave_call().await;
    wait_until(|| async move { alice_call.state().participants.is_empty() }).await;
}

#[tokio::test]
async fn test_four_party_mesh() {
    init_logging();
    const N: usize = 4;
    let hub = Arc::new(SignalHub::with_defaults());
    let room = Uuid::new_v4();

    let mut calls = Vec::new();
    for i in 0..N {
        let endpoint = Arc::new(hub.connect(ParticipantInfo::new(format!("Peer{i}"))));
        endpoint.join_room(room).await.unwrap();
        let call = CallOrchestrator::new(
            CallConfig::default(),
            Arc::new(FakeMediaDevices::new(DeviceMode::AudioVideo)),
            Arc::new(FakePeerFactory::new(ConnectMode::Auto)),
            endpoint.clone(),
        );
        call.initialize_call(room, endpoint.participant().clone(), false)
            .await
            .unwrap();
        calls.push(call);
    }

    wait_until(|| {
        let ready = calls.iter().all(|call| {
            let state = call.state();
            state.participants.len() == N - 1
                && state.participants.values().all(|p| p.link == LinkState::Connected)
        });
        async move { ready }
    })
    .await;

    let initiated: usize = calls
        .iter()
        .map(|call| {
            call.state()
                .participants
                .values()
                .filter(|p| p.role == LinkRole::Initiator)
                .count()
        })
        .sum();
    assert_eq!(initiated, N * (N - 1) / 2);
}

#[tokio::test]
async fn test_coordinators_over_relay() {
    let (_server, url) = start_test_server().await;
    let room = Uuid::new_v4();

    let mut users = Vec::new();
    for name in ["Alice", "Bob"] {
        let signaling: Arc<dyn SignalingChannel> =
            Arc::new(WsSignaling::connect(ParticipantInfo::new(name), &url).await.unwrap());
        let call = CallOrchestrator::new(
            CallConfig::default(),
            Arc::new(FakeMediaDevices::new(DeviceMode::AudioOnly)),
            Arc::new(FakePeerFactory::new(ConnectMode::Auto)),
            signaling.clone(),
        );
        let coordinator = StudyCoordinator::new(signaling, call);
        let ui = coordinator.subscribe();
        coordinator.enter_room(room).await.unwrap();
        users.push((coordinator, ui));
    }

    let (alice, alice_ui) = &mut users[0];
    timeout(Duration::from_secs(3), async {
        loop {
            if let UiEvent::Roster { participants, .. } = alice_ui.recv().await.unwrap() {
                if participants.len() == 2 {
                    return;
                }
            }
        }
    })
    .await
    .expect("roster not received");
    alice.navigate("Chapter-3").await.unwrap();

    let (_, bob_ui) = &mut users[1];
    let event = timeout(Duration::from_secs(3), async {
        loop {
            if let UiEvent::PositionChanged(event) = bob_ui.recv().await.unwrap() {
                return event;
            }
        }
    })
    .await
    .expect("position change not received");
    assert_eq!(event.position, "Chapter-3");
    assert_eq!(event.actor.name, "Alice");
}
