//! Local command surface over a UNIX-domain socket
//!
//! Newline-delimited textual commands, single-line JSON responses. The
//! first line of a session must be `AUTH <token>`; after that the
//! session stays authenticated until `LOGOUT` or close. The socket file
//! is permissioned to the owning user.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use lib_crypto::SecretBuffer;
use lib_network::Envelope;
use lib_trust::TrustLevel;

use crate::api::http::{ApiContext, MAX_JSON_BODY};
use crate::api::tokens::TokenKind;

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    State,
    Identity,
    Services,
    TrustList,
    TrustAdd { id: String, pubkey: String },
    TrustRemove { id: String },
    RouterRoutes,
    RouterAdd { peer_id: String, pubkey: String },
    RouterRemove { peer_id: String },
    RouterSend { peer_id: String, payload: String },
    RouterPing { peer_id: String },
    Logout,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line == "LOGOUT" {
            return Ok(Command::Logout);
        }
        let mut words = line.splitn(3, ' ');
        let verb = words.next().unwrap_or_default();
        match verb {
            "state" => Ok(Command::State),
            "identity" => Ok(Command::Identity),
            "services" => Ok(Command::Services),
            "trust:list" => Ok(Command::TrustList),
            "trust:add" => {
                let id = words.next().ok_or("usage: trust:add <id> <pubkey>")?;
                let pubkey = words.next().ok_or("usage: trust:add <id> <pubkey>")?;
                Ok(Command::TrustAdd {
                    id: id.to_string(),
                    pubkey: pubkey.to_string(),
                })
            }
            "trust:remove" => {
                let id = words.next().ok_or("usage: trust:remove <id>")?;
                Ok(Command::TrustRemove { id: id.to_string() })
            }
            "router:routes" => Ok(Command::RouterRoutes),
            "router:add" => {
                let peer_id = words.next().ok_or("usage: router:add <peerId> <pubkey>")?;
                let pubkey = words.next().ok_or("usage: router:add <peerId> <pubkey>")?;
                Ok(Command::RouterAdd {
                    peer_id: peer_id.to_string(),
                    pubkey: pubkey.to_string(),
                })
            }
            "router:remove" => {
                let peer_id = words.next().ok_or("usage: router:remove <peerId>")?;
                Ok(Command::RouterRemove {
                    peer_id: peer_id.to_string(),
                })
            }
            "router:send" => {
                let peer_id = words.next().ok_or("usage: router:send <peerId> <json>")?;
                let payload = words.next().ok_or("usage: router:send <peerId> <json>")?;
                Ok(Command::RouterSend {
                    peer_id: peer_id.to_string(),
                    payload: payload.to_string(),
                })
            }
            "router:ping" => {
                let peer_id = words.next().ok_or("usage: router:ping <peerId>")?;
                Ok(Command::RouterPing {
                    peer_id: peer_id.to_string(),
                })
            }
            other => Err(format!("unknown command {other}")),
        }
    }
}

/// Bind the socket and accept sessions until aborted.
pub async fn serve_control(ctx: Arc<ApiContext>, path: PathBuf) -> Result<()> {
    let _ = tokio::fs::remove_file(&path).await;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding control socket {}", path.display()))?;
    std::fs::set_permissions(&path, {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(0o600)
    })?;
    info!(socket = %path.display(), "control surface listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_session(ctx, stream).await {
                debug!("control session ended: {e}");
            }
        });
    }
}

fn authenticated(ctx: &ApiContext, token: &str) -> bool {
    if ctx.tokens.verify(token, TokenKind::Access).is_ok() {
        return true;
    }
    SecretBuffer::from_slice(ctx.ipc_token.as_bytes()).ct_eq(token.as_bytes())
}

async fn handle_session(ctx: Arc<ApiContext>, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // First line must authenticate the session.
    let first = lines.next_line().await?.unwrap_or_default();
    match first.strip_prefix("AUTH ") {
        Some(token) if authenticated(&ctx, token.trim()) => {
            write_line(&mut write_half, &json!({ "status": "ok" })).await?;
        }
        _ => {
            warn!("control session rejected: bad AUTH");
            write_line(&mut write_half, &json!({ "error": "unauthorized" })).await?;
            return Ok(());
        }
    }

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match Command::parse(&line) {
            Ok(Command::Logout) => {
                write_line(&mut write_half, &json!({ "status": "bye" })).await?;
                break;
            }
            Ok(command) => execute(&ctx, command).await,
            Err(message) => json!({ "error": message }),
        };
        write_line(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn write_line(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    value: &Value,
) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;
    Ok(())
}

async fn execute(ctx: &ApiContext, command: Command) -> Value {
    match command {
        Command::State => {
            json!({
                "startedAt": ctx.started_at,
                "node_id": ctx.node_id,
                "trustPeers": ctx.trust.len(),
                "routes": ctx.router.list_routes().len(),
            })
        }
        Command::Identity => json!({
            "node_id": ctx.node_id,
            "ed25519_public": BASE64.encode(ctx.ed25519_public),
            "x25519_public": BASE64.encode(ctx.x25519_public),
        }),
        Command::Services => {
            let services: Vec<Value> = ctx
                .supervisor
                .statuses()
                .await
                .into_iter()
                .map(|s| json!({ "name": s.name, "state": s.state.to_string() }))
                .collect();
            json!({ "services": services })
        }
        Command::TrustList => {
            let peers: Vec<Value> = ctx
                .trust
                .list()
                .into_iter()
                .map(|p| json!({ "id": p.id, "level": p.level.to_string() }))
                .collect();
            json!({ "peers": peers })
        }
        Command::TrustAdd { id, pubkey } => {
            if id.len() > 256 {
                return json!({ "error": "peer id too long" });
            }
            let key: [u8; 32] = match BASE64.decode(&pubkey).ok().and_then(|b| b.try_into().ok()) {
                Some(key) => key,
                None => return json!({ "error": "pubkey must be 32 base64 bytes" }),
            };
            let payload = lib_trust::update::encode_add_payload(&key, &[0u8; 32], TrustLevel::Low);
            match crate::node::produce_and_broadcast(ctx, lib_trust::TrustOp::Add, id.clone(), payload)
                .await
            {
                Ok(_) => json!({ "added": id }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Command::TrustRemove { id } => {
            if ctx.trust.get(&id).is_none() {
                return json!({ "error": format!("no trust record for {id}") });
            }
            match crate::node::produce_and_broadcast(ctx, lib_trust::TrustOp::Remove, id.clone(), Vec::new())
                .await
            {
                Ok(_) => json!({ "removed": id }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Command::RouterRoutes => {
            let routes: Vec<Value> = ctx
                .router
                .list_routes()
                .into_iter()
                .map(|r| json!({ "dst": r.dst, "nextHop": r.next_hop, "metric": r.metric }))
                .collect();
            json!({ "routes": routes })
        }
        Command::RouterAdd { peer_id, pubkey } => {
            if BASE64
                .decode(&pubkey)
                .map(|b| b.len() != 32)
                .unwrap_or(true)
            {
                return json!({ "error": "pubkey must be 32 base64 bytes" });
            }
            if ctx.trust.get(&peer_id).is_none() {
                return json!({ "error": "peer is not in the trust store" });
            }
            ctx.router.add_route(peer_id.clone(), peer_id.clone(), 1);
            json!({ "routed": peer_id })
        }
        Command::RouterRemove { peer_id } => {
            if ctx.router.remove_route(&peer_id) {
                json!({ "removed": peer_id })
            } else {
                json!({ "error": "no such route" })
            }
        }
        Command::RouterSend { peer_id, payload } => {
            if payload.len() > MAX_JSON_BODY {
                return json!({ "error": "payload exceeds 64 KiB" });
            }
            if serde_json::from_str::<Value>(&payload).is_err() {
                return json!({ "error": "payload is not valid JSON" });
            }
            let envelope = match Envelope::build(
                ctx.signer.as_ref(),
                peer_id.clone(),
                "gossip",
                payload.into_bytes(),
            ) {
                Ok(envelope) => envelope,
                Err(e) => return json!({ "error": e.to_string() }),
            };
            match ctx.router.send(&peer_id, envelope).await {
                Ok(receipt) => json!({
                    "sent": peer_id,
                    "messageId": receipt.message_id,
                    "nextHop": receipt.next_hop,
                }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Command::RouterPing { peer_id } => {
            let envelope = match Envelope::build(
                ctx.signer.as_ref(),
                peer_id.clone(),
                "ping",
                b"null".to_vec(),
            ) {
                Ok(envelope) => envelope,
                Err(e) => return json!({ "error": e.to_string() }),
            };
            match ctx.router.send(&peer_id, envelope).await {
                Ok(receipt) => json!({ "pinged": peer_id, "messageId": receipt.message_id }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Command::Logout => json!({ "status": "bye" }),
    }
}
