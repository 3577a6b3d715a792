//! Full-node boot, shutdown and restart behavior.

use haven::{Node, NodeConfig, ServiceState};
use lib_crypto::blake2b_256;

fn test_config(dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.env_dir = dir.join("env");
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.http_addr = "127.0.0.1:0".parse().unwrap();
    config.mnemonic_words = 12;
    config
}

#[tokio::test]
async fn boots_restarts_with_stable_identity() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let password = "correct horse battery staple";

    let mut node = Node::build(config.clone(), password).await.unwrap();
    let phrase = node.mnemonic.clone().expect("first boot yields a phrase");
    assert_eq!(phrase.split_whitespace().count(), 12);

    // The node id is the BLAKE2b-256 of the Ed25519 public key.
    let node_id = node.ctx.node_id.clone();
    assert_eq!(node_id, hex::encode(blake2b_256(&node.ctx.ed25519_public)));

    // Core modules are discoverable through the registry.
    assert!(node
        .registry
        .lookup::<lib_trust::TrustStore>("trust")
        .is_some());

    node.supervisor.start_all().await.unwrap();
    for status in node.supervisor.statuses().await {
        assert_eq!(status.state, ServiceState::Running, "{}", status.name);
    }

    node.shutdown().await;
    for status in node.supervisor.statuses().await {
        assert_eq!(status.state, ServiceState::Stopped, "{}", status.name);
    }

    // Same env, same password: identical identity, no new phrase.
    let node2 = Node::build(config, password).await.unwrap();
    assert!(node2.mnemonic.is_none());
    assert_eq!(node2.ctx.node_id, node_id);
}

#[tokio::test]
async fn wrong_password_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let node = Node::build(config.clone(), "right password").await.unwrap();
    drop(node);

    let err = Node::build(config, "wrong password").await.unwrap_err();
    assert!(err.to_string().contains("unlocking vault"));
}
