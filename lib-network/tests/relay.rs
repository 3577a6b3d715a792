//! Three-node relay scenarios: TTL budgets, loop rejection, delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use lib_crypto::{sign_detached, AgreementKeyPair, SigningKeyPair};
use lib_network::{
    ChannelManager, Envelope, HopSignature, MessageSigner, RoutedMessage, Router, Transport,
    TransportEvent,
};
use lib_trust::{TrustLevel, TrustStore};

struct TestSigner {
    id: String,
    seed: [u8; 32],
}

impl MessageSigner for TestSigner {
    fn id(&self) -> &str {
        &self.id
    }
    fn sign(&self, message: &[u8]) -> [u8; 64] {
        sign_detached(&self.seed, message).expect("32-byte seed")
    }
}

struct TestNode {
    id: String,
    ed_seed: [u8; 32],
    x_keys: AgreementKeyPair,
    trust: Arc<TrustStore>,
    channels: Arc<ChannelManager>,
    transport: Arc<Transport>,
    router: Arc<Router>,
    inbound_rx: mpsc::Receiver<Envelope>,
}

fn node(name: &str, byte: u8) -> (TestNode, mpsc::Receiver<TransportEvent>) {
    let ed_seed = [byte; 32];
    let x_keys = AgreementKeyPair::from_seed(&[byte ^ 0xFF; 32]).unwrap();
    let trust = Arc::new(TrustStore::new(name.to_string()));
    let channels = Arc::new(ChannelManager::new(name.to_string(), trust.clone()));
    let (transport, events) = Transport::new(name.to_string(), 256);
    let transport = Arc::new(transport);
    let signer = Arc::new(TestSigner {
        id: name.to_string(),
        seed: ed_seed,
    });
    let (router, inbound_rx) = Router::new(
        trust.clone(),
        channels.clone(),
        transport.clone(),
        signer,
    );
    (
        TestNode {
            id: name.to_string(),
            ed_seed,
            x_keys,
            trust,
            channels,
            transport,
            router: Arc::new(router),
            inbound_rx,
        },
        events,
    )
}

fn ed_public(seed: &[u8; 32]) -> [u8; 32] {
    SigningKeyPair::from_seed(seed).unwrap().public_bytes()
}

/// Everyone trusts everyone at Medium, with real keys.
fn introduce(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id != b.id {
                a.trust
                    .add_peer_local(
                        b.id.clone(),
                        ed_public(&b.ed_seed),
                        b.x_keys.public_bytes(),
                        TrustLevel::Medium,
                    )
                    .unwrap();
            }
        }
    }
}

/// Open complementary channels between two nodes.
fn open_channels(a: &TestNode, b: &TestNode) {
    let shared_ab = a.x_keys.agree(&b.x_keys.public_bytes()).unwrap();
    let shared_ba = b.x_keys.agree(&a.x_keys.public_bytes()).unwrap();
    a.channels.open(&b.id, &shared_ab).unwrap();
    b.channels.open(&a.id, &shared_ba).unwrap();
}

/// Feed transport frames into the router until the event stream ends.
fn pump(router: Arc<Router>, mut events: mpsc::Receiver<TransportEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let TransportEvent::Frame { peer_id, bytes } = event {
                // Protocol rejections are counted in router stats.
                let _ = router.receive(&peer_id, &bytes).await;
            }
        }
    });
}

/// A -- B -- C line topology with routes from the edges through B.
async fn line_topology() -> (TestNode, TestNode, TestNode) {
    let (a, a_events) = node("node-a", 0xA1);
    let (b, b_events) = node("node-b", 0xB2);
    let (c, c_events) = node("node-c", 0xC3);
    introduce(&[&a, &b, &c]);

    let b_addr = b.transport.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    a.transport.connect(b_addr).await.unwrap();
    c.transport.connect(b_addr).await.unwrap();

    // Wait until B sees both peers.
    timeout(Duration::from_secs(5), async {
        while b.transport.connected_peers().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers connected");

    open_channels(&a, &b);
    open_channels(&b, &c);

    a.router.add_route("node-c".into(), "node-b".into(), 2);
    c.router.add_route("node-a".into(), "node-b".into(), 2);

    pump(a.router.clone(), a_events);
    pump(b.router.clone(), b_events);
    pump(c.router.clone(), c_events);

    (a, b, c)
}

fn gossip_envelope(from: &TestNode, to: &str, text: &str) -> Envelope {
    let signer = TestSigner {
        id: from.id.clone(),
        seed: from.ed_seed,
    };
    Envelope::build(
        &signer,
        to.to_string(),
        "gossip",
        serde_json::json!({ "data": text.as_bytes() })
            .to_string()
            .into_bytes(),
    )
    .unwrap()
}

#[tokio::test]
async fn ttl_two_reaches_across_one_forwarder() {
    let (a, b, mut c) = line_topology().await;

    let envelope = gossip_envelope(&a, "node-c", "hello across the relay");
    let receipt = a
        .router
        .send_with_ttl("node-c", envelope.clone(), 2)
        .await
        .unwrap();
    assert_eq!(receipt.next_hop, "node-b");

    let delivered = timeout(Duration::from_secs(5), c.inbound_rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(delivered.from, "node-a");
    assert_eq!(delivered.kind, "gossip");
    assert_eq!(delivered.body, envelope.body);
    assert_eq!(b.router.stats().forwarded, 1);
}

#[tokio::test]
async fn ttl_one_expires_at_the_forwarder() {
    let (a, b, mut c) = line_topology().await;

    let envelope = gossip_envelope(&a, "node-c", "should not arrive");
    a.router
        .send_with_ttl("node-c", envelope, 1)
        .await
        .unwrap();

    // B drops the message once it arrives.
    timeout(Duration::from_secs(5), async {
        while b.router.stats().ttl_expired == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ttl drop counted at forwarder");

    assert!(
        timeout(Duration::from_millis(300), c.inbound_rx.recv())
            .await
            .is_err(),
        "nothing may reach node-c"
    );
}

#[tokio::test]
async fn prior_forwarder_in_hop_list_is_a_loop() {
    let (a, b, _c) = line_topology().await;

    // Craft a message that claims to have already traversed B.
    let envelope = gossip_envelope(&a, "node-c", "looping");
    let mut message = RoutedMessage {
        src: "node-a".into(),
        dst: "node-c".into(),
        ttl: 6,
        payload: envelope.encode(),
        hops: Vec::new(),
    };
    let digest = message.hop_digest(&message.hops);
    message.hops.push(HopSignature {
        peer_id: "node-b".into(),
        signature: sign_detached(&b.ed_seed, &digest).unwrap().to_vec(),
    });

    // Seal it on A's channel to B exactly as the router would.
    let ad = format!("haven.routed.v1:{}>{}", a.id, b.id);
    let (_, frame) = a
        .channels
        .seal("node-b", &message.encode(), ad.as_bytes())
        .unwrap();
    a.transport.send("node-b", frame).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while b.router.stats().loops == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("loop drop counted at forwarder");
}

#[tokio::test]
async fn duplicate_envelope_nonce_is_replay_dropped() {
    let (a, b, mut c) = line_topology().await;

    let envelope = gossip_envelope(&a, "node-c", "once only");
    a.router
        .send_with_ttl("node-c", envelope.clone(), 4)
        .await
        .unwrap();
    let first = timeout(Duration::from_secs(5), c.inbound_rx.recv())
        .await
        .expect("first copy delivered")
        .unwrap();
    assert_eq!(first.nonce, envelope.nonce);

    // Re-send the identical envelope; B has seen (from, nonce).
    a.router
        .send_with_ttl("node-c", envelope, 4)
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while b.router.stats().replays == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replay counted at forwarder");
}
