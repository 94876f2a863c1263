//! End-to-end over real sockets: one signaling relay, two nodes.

use std::sync::Arc;

use tavern_collab::{
    Node, NodeConfig, NodeHandle, Session, SignalServer, SignalingClient, SyntheticCamera,
};
use tavern_core::{CardDraft, Point};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(10);

/// Start a relay on a free port, return its URL.
async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = SignalServer::with_defaults().serve(listener).await;
    });
    format!("ws://{addr}")
}

async fn start_node(name: &str, relay: &str, session: &Session) -> NodeHandle {
    let config = NodeConfig::for_testing(name, relay);
    let discovery = Arc::new(SignalingClient::new(config.signaling()));
    Node::start(config, session.clone(), discovery, Arc::new(SyntheticCamera))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_nodes_share_cards_and_presence() {
    let relay = start_relay().await;
    let session = Session::generate();
    let alice = start_node("alice", &relay, &session).await;
    let bob = start_node("bob", &relay, &session).await;

    // Discovery and handshake.
    let bob_id = bob.peer();
    timeout(WAIT, alice.wait_for(|s| s.peer(bob_id).is_some()))
        .await
        .expect("alice never saw bob")
        .unwrap();

    let card = alice.add_card(CardDraft::image("map.png")).await.unwrap();
    timeout(WAIT, bob.wait_for(|s| s.card(&card).is_some()))
        .await
        .expect("card never reached bob")
        .unwrap();

    bob.move_card(card.clone(), Point::new(250.0, 125.0))
        .await
        .unwrap();
    let snap = timeout(
        WAIT,
        alice.wait_for(|s| {
            s.card(&card)
                .is_some_and(|c| c.card.position == Point::new(250.0, 125.0))
        }),
    )
    .await
    .expect("move never reached alice")
    .unwrap();
    assert_eq!(snap.layering.last(), Some(&card));

    let avatar = bob.add_my_presence("bob").await.unwrap();
    timeout(
        WAIT,
        alice.wait_for(|s| s.card(&avatar).is_some_and(|c| c.stream.is_some())),
    )
    .await
    .expect("bob's avatar stream never reached alice")
    .unwrap();

    // Bob leaves; his avatar falls to alice.
    let alice_id = alice.peer();
    bob.shutdown().await;
    let snap = timeout(
        WAIT,
        alice.wait_for(|s| {
            s.peer(bob_id).is_none()
                && s.card(&avatar).is_some_and(|c| c.card.manager == alice_id)
        }),
    )
    .await
    .expect("bob's departure was never handled")
    .unwrap();
    assert!(snap.card(&avatar).unwrap().stream.is_none());

    alice.shutdown().await;
}

#[tokio::test]
async fn test_other_room_stays_separate() {
    let relay = start_relay().await;
    let alice = start_node("alice", &relay, &Session::generate()).await;
    let carol = start_node("carol", &relay, &Session::generate()).await;

    let card = alice.add_card(CardDraft::image("secret.png")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(carol.snapshot().card(&card).is_none());
    assert_eq!(carol.snapshot().peers.len(), 1);

    alice.shutdown().await;
    carol.shutdown().await;
}
