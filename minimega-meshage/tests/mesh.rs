use std::time::Duration;

use tokio::time::sleep;

use minimega_meshage::{Config, Error, Node};

const TAG: u16 = 7;

fn quick(name: &str) -> Config {
    Config::new(name)
        .with_msa_period(Duration::from_millis(200))
        .with_timeout(Duration::from_secs(2))
}

async fn spawn_node(name: &str) -> (Node, std::net::SocketAddr) {
    let node = Node::new(quick(name));
    let addr = node.listen("127.0.0.1:0").await.unwrap();
    (node, addr)
}

#[tokio::test]
async fn three_node_line_converges() {
    let (a, _a_addr) = spawn_node("a").await;
    let (b, b_addr) = spawn_node("b").await;
    let (c, c_addr) = spawn_node("c").await;

    assert_eq!(a.dial(b_addr).await.unwrap(), "b");
    assert_eq!(b.dial(c_addr).await.unwrap(), "c");

    // two MSA periods
    sleep(Duration::from_millis(500)).await;

    for node in [&a, &b, &c] {
        let view = node.mesh();

        assert_eq!(view["a"], ["b".to_string()].into());
        assert_eq!(view["b"], ["a".to_string(), "c".to_string()].into());
        assert_eq!(view["c"], ["b".to_string()].into());
    }

    assert_eq!(a.members(), vec!["b", "c"]);
    assert_eq!(c.peers(), vec!["b"]);
}

#[tokio::test]
async fn set_routes_through_interior_hop() {
    let (a, _) = spawn_node("a").await;
    let (b, b_addr) = spawn_node("b").await;
    let (c, c_addr) = spawn_node("c").await;

    let mut inbox = c.subscribe(TAG);

    a.dial(b_addr).await.unwrap();
    b.dial(c_addr).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    let delivered = a
        .set(vec!["c".to_string()], TAG, b"ping".to_vec())
        .await
        .unwrap();
    assert_eq!(delivered, vec!["c".to_string()]);

    let envelope = inbox.recv().await.unwrap();
    assert_eq!(envelope.source, "a");
    assert_eq!(envelope.body, b"ping");
}

#[tokio::test]
async fn lost_hop_becomes_routing_error() {
    let (a, _) = spawn_node("a").await;
    let (b, b_addr) = spawn_node("b").await;
    let (c, c_addr) = spawn_node("c").await;

    a.dial(b_addr).await.unwrap();
    b.dial(c_addr).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    // take the interior hop away
    a.hangup("b").await.unwrap();
    b.hangup("c").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let err = a
        .set(vec!["c".to_string()], TAG, b"ping".to_vec())
        .await
        .unwrap_err();

    match err {
        Error::Partial { delivered, failed } => {
            assert!(delivered.is_empty());
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, "c");
        }
        other => panic!("expected partial failure, got {other}"),
    }
}

#[tokio::test]
async fn broadcast_addresses_all_members() {
    let (a, _) = spawn_node("a").await;
    let (b, b_addr) = spawn_node("b").await;
    let (c, c_addr) = spawn_node("c").await;

    let mut b_inbox = b.subscribe(TAG);
    let mut c_inbox = c.subscribe(TAG);

    a.dial(b_addr).await.unwrap();
    b.dial(c_addr).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    let mut addressed = a.broadcast(TAG, b"hello".to_vec()).await.unwrap();
    addressed.sort();
    assert_eq!(addressed, vec!["b".to_string(), "c".to_string()]);

    assert_eq!(b_inbox.recv().await.unwrap().body, b"hello");
    assert_eq!(c_inbox.recv().await.unwrap().body, b"hello");
}

#[tokio::test]
async fn duplicate_names_are_rejected_at_handshake() {
    let (a, _) = spawn_node("a").await;
    let (_other, other_addr) = spawn_node("a").await;

    let err = a.dial(other_addr).await.unwrap_err();
    match err {
        // the acceptor closes on collision, so the dialer observes
        // either the explicit collision or the dropped connection
        Error::NameCollision(name) => assert_eq!(name, "a"),
        Error::PeerClosed | Error::Io(_) | Error::HandshakeTimeout | Error::Codec(_) => {}
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn double_dial_is_rejected() {
    let (a, _) = spawn_node("a").await;
    let (_b, b_addr) = spawn_node("b").await;

    a.dial(b_addr).await.unwrap();
    let err = a.dial(b_addr).await.unwrap_err();

    match err {
        Error::AlreadyConnected(name) => assert_eq!(name, "b"),
        Error::PeerClosed | Error::Io(_) | Error::HandshakeTimeout => {}
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn set_to_self_delivers_locally() {
    let (a, _) = spawn_node("a").await;
    let mut inbox = a.subscribe(TAG);

    let delivered = a
        .set(vec!["a".to_string()], TAG, b"loop".to_vec())
        .await
        .unwrap();
    assert_eq!(delivered, vec!["a".to_string()]);

    let envelope = inbox.recv().await.unwrap();
    assert_eq!(envelope.source, "a");
    assert_eq!(envelope.body, b"loop");
}
