//! Loopback HTTP surface: authentication, lockout and owner commands.

use std::net::SocketAddr;

use serde_json::{json, Value};

use haven::{Node, NodeConfig};

const PASSWORD: &str = "correct horse battery staple";

async fn booted_http_node(dir: &std::path::Path) -> (Node, SocketAddr) {
    let mut config = NodeConfig::default();
    config.env_dir = dir.join("env");
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.http_addr = "127.0.0.1:0".parse().unwrap();
    config.mnemonic_words = 12;

    let node = Node::build(config, PASSWORD).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = node.ctx.clone();
    tokio::spawn(async move {
        let _ = haven::api::serve_http(ctx, listener).await;
    });
    (node, addr)
}

#[tokio::test]
async fn health_is_public_and_named() {
    let dir = tempfile::tempdir().unwrap();
    let (_node, addr) = booted_http_node(dir.path()).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["core_name"], "haven");
}

#[tokio::test]
async fn login_lockout_after_five_failures() {
    let dir = tempfile::tempdir().unwrap();
    let (_node, addr) = booted_http_node(dir.path()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/auth/login");

    for _ in 0..5 {
        let response = client
            .post(&url)
            .json(&json!({ "password": "not the password 1!" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    // Sixth attempt is refused outright; no token even with the right
    // password until the window expires.
    let response = client
        .post(&url)
        .json(&json!({ "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
}

#[tokio::test]
async fn token_flow_and_owner_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (node, addr) = booted_http_node(dir.path()).await;
    let client = reqwest::Client::new();

    // Login issues both tokens.
    let login: Value = client
        .post(format!("http://{addr}/api/auth/login"))
        .json(&json!({ "password": PASSWORD }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let access = login["accessToken"].as_str().unwrap().to_string();
    assert!(login["refreshToken"].as_str().is_some());
    assert_eq!(login["expiresIn"], 900);

    // Refresh rotates the access token.
    let refreshed: Value = client
        .post(format!("http://{addr}/api/auth/refresh"))
        .json(&json!({ "refreshToken": login["refreshToken"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(refreshed["accessToken"].as_str().is_some());

    // Identity is stable and public-halves only.
    let identity: Value = reqwest::get(format!("http://{addr}/api/identity"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(identity["node_id"], node.ctx.node_id.as_str());
    let again: Value = reqwest::get(format!("http://{addr}/api/identity"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(identity, again);

    // Mutations without a token are refused.
    let denied = client
        .post(format!("http://{addr}/api/trust"))
        .json(&json!({ "id": "peer-1", "pubkey": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    // Trust add/list/remove with the bearer token.
    let pubkey = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([7u8; 32])
    };
    let added = client
        .post(format!("http://{addr}/api/trust"))
        .bearer_auth(&access)
        .json(&json!({ "id": "peer-1", "pubkey": pubkey, "level": "medium" }))
        .send()
        .await
        .unwrap();
    assert_eq!(added.status(), 200);

    let listed: Value = reqwest::get(format!("http://{addr}/api/trust"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["peers"][0]["id"], "peer-1");
    assert_eq!(listed["peers"][0]["level"], "medium");

    // Bad public keys are rejected with 400.
    let rejected = client
        .post(format!("http://{addr}/api/trust"))
        .bearer_auth(&access)
        .json(&json!({ "id": "peer-2", "pubkey": "dG9vLXNob3J0" }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);

    // Encrypted KV through the API.
    let stored = client
        .post(format!("http://{addr}/api/storage/kv"))
        .bearer_auth(&access)
        .json(&json!({ "key": "greeting", "value": "hello haven" }))
        .send()
        .await
        .unwrap();
    assert_eq!(stored.status(), 200);

    let fetched: Value = client
        .get(format!("http://{addr}/api/storage/kv"))
        .bearer_auth(&access)
        .query(&[("key", "greeting")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["value"], "hello haven");

    let removed = client
        .delete(format!("http://{addr}/api/trust"))
        .bearer_auth(&access)
        .query(&[("id", "peer-1")])
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), 200);
}
