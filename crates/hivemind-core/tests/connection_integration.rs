//! Connection manager integration tests
//!
//! These tests run real handshakes between managers on an in-process
//! network, plus hand-driven links that play a misbehaving peer.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use hivemind_core::sync::{
    ConnectionManager, ConnectionState, Inbound, InboundMessage, Link, MemoryNetwork,
    MemoryTransport, ProtocolMessage, SyncEvent, DEFAULT_AUTH_TIMEOUT,
};
use hivemind_core::{AuthFailure, DocumentSnapshot, Keypair, PeerId, SyncError, TrustStore};
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Test Utilities
// ============================================================================

struct TestPeer {
    manager: ConnectionManager<MemoryTransport>,
    inbox: mpsc::Receiver<InboundMessage>,
    events: broadcast::Receiver<SyncEvent>,
}

impl TestPeer {
    fn new(network: &MemoryNetwork, name: &str, keypair: Keypair, trusted: &[String]) -> Self {
        let trust = Arc::new(TrustStore::new(keypair, trusted));
        let (manager, inbox) =
            ConnectionManager::new(network.transport(name), trust, DEFAULT_AUTH_TIMEOUT);
        let events = manager.subscribe();
        manager.listen();
        Self {
            manager,
            inbox,
            events,
        }
    }

    async fn next_event(&mut self) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_authenticated(&mut self, peer: &str) {
        loop {
            if let SyncEvent::PeerAuthenticated { peer: p, .. } = self.next_event().await {
                if p.as_str() == peer {
                    return;
                }
            }
        }
    }

    async fn wait_auth_failure(&mut self) -> (PeerId, AuthFailure) {
        loop {
            if let SyncEvent::AuthenticationFailed { peer, reason } = self.next_event().await {
                return (peer, reason);
            }
        }
    }

    async fn next_message(&mut self) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbox closed")
    }
}

/// Poll `check` until it holds or five seconds pass
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn recv_message(link: &mut Link) -> Option<ProtocolMessage> {
    let frame = tokio::time::timeout(Duration::from_secs(60), link.inbound.recv())
        .await
        .expect("timed out waiting for frame")?;
    match ProtocolMessage::decode(&frame).unwrap() {
        Inbound::Message(message) => Some(message),
        Inbound::Unknown(kind) => panic!("unexpected tag {kind}"),
    }
}

fn snapshot(path: &str) -> DocumentSnapshot {
    DocumentSnapshot {
        path: path.to_string(),
        content: "00:00".to_string(),
        last_modified: 1,
    }
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_mutually_trusted_peers_authenticate() {
    let network = MemoryNetwork::new();
    let (alice_key, bob_key) = (Keypair::generate(), Keypair::generate());
    let alice_pub = alice_key.public_key_base64();
    let bob_pub = bob_key.public_key_base64();

    let mut alice = TestPeer::new(&network, "alice", alice_key, &[bob_pub.clone()]);
    let mut bob = TestPeer::new(&network, "bob", bob_key, &[alice_pub.clone()]);

    assert!(alice.manager.connect_to_peer(&PeerId::new("bob")).await.unwrap());
    alice.wait_authenticated("bob").await;
    bob.wait_authenticated("alice").await;

    assert_eq!(
        alice.manager.connection_state(&PeerId::new("bob")),
        ConnectionState::Authenticated
    );
    assert_eq!(
        alice.manager.peer_identity(&PeerId::new("bob")).unwrap().public_key,
        bob_pub
    );
    assert_eq!(bob.manager.connected_peers(), vec![PeerId::new("alice")]);

    alice
        .manager
        .send_to_peer(&PeerId::new("bob"), &ProtocolMessage::SyncRequest)
        .unwrap();
    let received = bob.next_message().await;
    assert_eq!(received.from, PeerId::new("alice"));
    assert_eq!(received.message, ProtocolMessage::SyncRequest);

    // already connected: no second dial
    assert!(!alice.manager.connect_to_peer(&PeerId::new("bob")).await.unwrap());
}

#[tokio::test]
async fn test_untrusted_key_is_rejected() {
    let network = MemoryNetwork::new();
    let (alice_key, bob_key) = (Keypair::generate(), Keypair::generate());
    let bob_pub = bob_key.public_key_base64();

    let alice = TestPeer::new(&network, "alice", alice_key, &[bob_pub]);
    // bob trusts nobody
    let mut bob = TestPeer::new(&network, "bob", bob_key, &[]);

    alice.manager.connect_to_peer(&PeerId::new("bob")).await.unwrap();

    let (peer, reason) = bob.wait_auth_failure().await;
    assert_eq!(peer, PeerId::new("alice"));
    assert_eq!(reason, AuthFailure::UntrustedKey);
    assert_eq!(
        bob.manager.connection_state(&PeerId::new("alice")),
        ConnectionState::Closed
    );

    let alice_manager = alice.manager.clone();
    eventually(move || {
        alice_manager.connection_state(&PeerId::new("bob")) == ConnectionState::Closed
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::new(&network, "alice", Keypair::generate(), &[]);

    let mut mallory = network
        .dial(&PeerId::new("mallory"), &PeerId::new("alice"))
        .await
        .unwrap();

    assert!(matches!(
        recv_message(&mut mallory).await,
        Some(ProtocolMessage::AuthChallenge { .. })
    ));

    let (peer, reason) = alice.wait_auth_failure().await;
    assert_eq!(peer, PeerId::new("mallory"));
    assert_eq!(reason, AuthFailure::Timeout);

    // alice hung up
    assert!(recv_message(&mut mallory).await.is_none());
    assert_eq!(
        alice.manager.connection_state(&PeerId::new("mallory")),
        ConnectionState::Closed
    );
}

#[tokio::test]
async fn test_sync_message_before_auth_closes_link() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::new(&network, "alice", Keypair::generate(), &[]);

    let mut mallory = network
        .dial(&PeerId::new("mallory"), &PeerId::new("alice"))
        .await
        .unwrap();
    mallory
        .outbound
        .send(ProtocolMessage::NoteUpdate(snapshot("x.md")).encode().unwrap())
        .await
        .unwrap();

    let (_, reason) = alice.wait_auth_failure().await;
    assert_eq!(reason, AuthFailure::UnexpectedMessage);

    assert!(matches!(
        recv_message(&mut mallory).await,
        Some(ProtocolMessage::AuthChallenge { .. })
    ));
    assert!(recv_message(&mut mallory).await.is_none());
    assert!(alice.inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_stolen_public_key_fails_signature_check() {
    let network = MemoryNetwork::new();
    let victim = Keypair::generate();
    let mut alice = TestPeer::new(
        &network,
        "alice",
        Keypair::generate(),
        &[victim.public_key_base64()],
    );

    let mut mallory = network
        .dial(&PeerId::new("mallory"), &PeerId::new("alice"))
        .await
        .unwrap();
    let forged = ProtocolMessage::response(&[0u8; 64], victim.public_key_base64());
    mallory.outbound.send(forged.encode().unwrap()).await.unwrap();

    let (_, reason) = alice.wait_auth_failure().await;
    assert_eq!(reason, AuthFailure::BadSignature);
}

#[tokio::test]
async fn test_garbage_frame_before_auth_is_malformed() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::new(&network, "alice", Keypair::generate(), &[]);

    let mallory = network
        .dial(&PeerId::new("mallory"), &PeerId::new("alice"))
        .await
        .unwrap();
    mallory
        .outbound
        .send(Bytes::from_static(b"\x00\x01 definitely not json"))
        .await
        .unwrap();

    let (_, reason) = alice.wait_auth_failure().await;
    assert_eq!(reason, AuthFailure::Malformed);
}

/// A hand-driven peer that completes the handshake correctly
async fn authenticate_by_hand(network: &MemoryNetwork, keypair: &Keypair) -> Link {
    let mut link = network
        .dial(&PeerId::new("manual"), &PeerId::new("alice"))
        .await
        .unwrap();

    let nonce = match recv_message(&mut link).await {
        Some(ProtocolMessage::AuthChallenge { nonce }) => STANDARD.decode(nonce).unwrap(),
        other => panic!("expected challenge, got {other:?}"),
    };
    let response = ProtocolMessage::response(&keypair.sign(&nonce), keypair.public_key_base64());
    link.outbound.send(response.encode().unwrap()).await.unwrap();
    link
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_after_auth_are_dropped() {
    let network = MemoryNetwork::new();
    let manual_key = Keypair::generate();
    let mut alice = TestPeer::new(
        &network,
        "alice",
        Keypair::generate(),
        &[manual_key.public_key_base64()],
    );

    let link = authenticate_by_hand(&network, &manual_key).await;
    alice.wait_authenticated("manual").await;

    for frame in [
        Bytes::from_static(br#"{"type":"PING","data":{}}"#),
        Bytes::from_static(b"not json at all"),
        ProtocolMessage::SyncRequest.encode().unwrap(),
    ] {
        link.outbound.send(frame).await.unwrap();
    }

    let received = alice.next_message().await;
    assert_eq!(received.from, PeerId::new("manual"));
    assert_eq!(received.message, ProtocolMessage::SyncRequest);
    assert_eq!(
        alice.manager.connection_state(&PeerId::new("manual")),
        ConnectionState::Authenticated
    );
}

#[tokio::test]
async fn test_remote_close_deregisters_immediately() {
    let network = MemoryNetwork::new();
    let manual_key = Keypair::generate();
    let mut alice = TestPeer::new(
        &network,
        "alice",
        Keypair::generate(),
        &[manual_key.public_key_base64()],
    );

    let link = authenticate_by_hand(&network, &manual_key).await;
    alice.wait_authenticated("manual").await;
    drop(link);

    loop {
        if let SyncEvent::PeerDisconnected { peer } = alice.next_event().await {
            assert_eq!(peer, PeerId::new("manual"));
            break;
        }
    }
    assert!(alice.manager.connected_peers().is_empty());
    assert!(matches!(
        alice
            .manager
            .send_to_peer(&PeerId::new("manual"), &ProtocolMessage::SyncRequest),
        Err(SyncError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_oversized_message_is_refused_and_link_survives() {
    let network = MemoryNetwork::with_max_frame_length(512);
    let manual_key = Keypair::generate();
    let mut alice = TestPeer::new(
        &network,
        "alice",
        Keypair::generate(),
        &[manual_key.public_key_base64()],
    );

    let mut link = authenticate_by_hand(&network, &manual_key).await;
    alice.wait_authenticated("manual").await;

    let mut big = snapshot("notes/big.md");
    big.content = "ab".repeat(512);
    let result = alice
        .manager
        .send_to_peer(&PeerId::new("manual"), &ProtocolMessage::NoteUpdate(big.clone()));
    assert!(matches!(result, Err(SyncError::Transport(_))));

    let report = alice
        .manager
        .broadcast_to_peers(&ProtocolMessage::NoteUpdate(big))
        .unwrap();
    assert_eq!(report.failed, vec![PeerId::new("manual")]);

    // a message that fits still goes through on the same link
    alice
        .manager
        .send_to_peer(&PeerId::new("manual"), &ProtocolMessage::SyncRequest)
        .unwrap();
    assert_eq!(recv_message(&mut link).await, Some(ProtocolMessage::SyncRequest));
    assert_eq!(
        alice.manager.connection_state(&PeerId::new("manual")),
        ConnectionState::Authenticated
    );
}

// ============================================================================
// Broadcast & Disconnect Tests
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_each_authenticated_peer_once() {
    let network = MemoryNetwork::new();
    let hub_key = Keypair::generate();
    let hub_pub = hub_key.public_key_base64();

    let mut spokes = Vec::new();
    let mut spoke_keys = Vec::new();
    for name in ["b", "c", "d"] {
        let key = Keypair::generate();
        spoke_keys.push(key.public_key_base64());
        spokes.push(TestPeer::new(&network, name, key, &[hub_pub.clone()]));
    }
    let hub = TestPeer::new(&network, "a", hub_key, &spoke_keys);

    for name in ["b", "c", "d"] {
        hub.manager.connect_to_peer(&PeerId::new(name)).await.unwrap();
    }
    let hub_manager = hub.manager.clone();
    eventually(move || hub_manager.connected_peers().len() == 3).await;

    let update = ProtocolMessage::NoteUpdate(snapshot("notes/x.md"));
    let report = hub.manager.broadcast_to_peers(&update).unwrap();

    let mut attempted = report.attempted.clone();
    attempted.sort();
    assert_eq!(
        attempted,
        vec![PeerId::new("b"), PeerId::new("c"), PeerId::new("d")]
    );
    assert!(report.failed.is_empty());
    assert_eq!(report.delivered(), 3);

    for spoke in &mut spokes {
        let received = spoke.next_message().await;
        assert_eq!(received.from, PeerId::new("a"));
        assert_eq!(received.message, update);
        assert!(spoke.inbox.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_disconnect_closes_both_sides() {
    let network = MemoryNetwork::new();
    let (alice_key, bob_key) = (Keypair::generate(), Keypair::generate());
    let alice_pub = alice_key.public_key_base64();
    let bob_pub = bob_key.public_key_base64();

    let mut alice = TestPeer::new(&network, "alice", alice_key, &[bob_pub]);
    let mut bob = TestPeer::new(&network, "bob", bob_key, &[alice_pub]);

    alice.manager.connect_to_peer(&PeerId::new("bob")).await.unwrap();
    alice.wait_authenticated("bob").await;
    bob.wait_authenticated("alice").await;

    assert!(alice.manager.disconnect(&PeerId::new("bob")));
    assert!(!alice.manager.disconnect(&PeerId::new("bob")));
    assert_eq!(
        alice.manager.connection_state(&PeerId::new("bob")),
        ConnectionState::Closed
    );
    assert!(matches!(
        alice
            .manager
            .send_to_peer(&PeerId::new("bob"), &ProtocolMessage::SyncRequest),
        Err(SyncError::NotConnected(_))
    ));

    loop {
        if let SyncEvent::PeerDisconnected { peer } = bob.next_event().await {
            assert_eq!(peer, PeerId::new("alice"));
            break;
        }
    }
}

#[tokio::test]
async fn test_simultaneous_dials_settle_on_one_link() {
    let network = MemoryNetwork::new();
    let (alice_key, bob_key) = (Keypair::generate(), Keypair::generate());
    let alice_pub = alice_key.public_key_base64();
    let bob_pub = bob_key.public_key_base64();

    let mut alice = TestPeer::new(&network, "alice", alice_key, &[bob_pub]);
    let mut bob = TestPeer::new(&network, "bob", bob_key, &[alice_pub]);

    let (bob_id, alice_id) = (PeerId::new("bob"), PeerId::new("alice"));
    let (a, b) = tokio::join!(
        alice.manager.connect_to_peer(&bob_id),
        bob.manager.connect_to_peer(&alice_id),
    );
    a.unwrap();
    b.unwrap();

    let (alice_manager, bob_manager) = (alice.manager.clone(), bob.manager.clone());
    eventually(move || {
        alice_manager.connection_state(&PeerId::new("bob")) == ConnectionState::Authenticated
            && bob_manager.connection_state(&PeerId::new("alice"))
                == ConnectionState::Authenticated
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice
        .manager
        .send_to_peer(&PeerId::new("bob"), &ProtocolMessage::SyncRequest)
        .unwrap();
    bob.manager
        .send_to_peer(
            &PeerId::new("alice"),
            &ProtocolMessage::NoteUpdate(snapshot("y.md")),
        )
        .unwrap();

    assert_eq!(bob.next_message().await.message, ProtocolMessage::SyncRequest);
    assert_eq!(
        alice.next_message().await.message,
        ProtocolMessage::NoteUpdate(snapshot("y.md"))
    );
    assert_eq!(alice.manager.connected_peers().len(), 1);
    assert_eq!(bob.manager.connected_peers().len(), 1);
}

#[tokio::test]
async fn test_reload_revokes_future_handshakes() {
    let network = MemoryNetwork::new();
    let (alice_key, bob_key) = (Keypair::generate(), Keypair::generate());
    let alice_pub = alice_key.public_key_base64();
    let bob_pub = bob_key.public_key_base64();

    let alice = TestPeer::new(&network, "alice", alice_key, &[bob_pub]);
    let mut bob = TestPeer::new(&network, "bob", bob_key, &[alice_pub]);

    bob.manager.trust().reload(Vec::<String>::new());
    alice.manager.connect_to_peer(&PeerId::new("bob")).await.unwrap();

    let (_, reason) = bob.wait_auth_failure().await;
    assert_eq!(reason, AuthFailure::UntrustedKey);
}
