//! Loopback HTTP control surface
//!
//! Bound to the loopback address by default. `GET /health` is public;
//! mutating calls require `Authorization: Bearer <token>` (or
//! `ApiKey <key>` with the persisted IPC token). JSON bodies are capped
//! at 64 KiB and CORS is restricted to the configured allow-list.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as HttpRouter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use lib_crypto::SecretBuffer;
use lib_network::{MessageSigner, Router};
use lib_storage::KvStore;
use lib_trust::{TrustLevel, TrustStore};
use lib_vault::KeyVault;

use crate::api::tokens::{LoginLimiter, TokenKind, TokenService};
use crate::config::NodeConfig;
use crate::events::{EventBus, NodeEvent};
use crate::supervisor::Supervisor;

pub const MAX_JSON_BODY: usize = 64 * 1024;
pub const MAX_PEER_ID_CHARS: usize = 256;

/// Everything the handlers need, shared behind one `Arc`.
pub struct ApiContext {
    pub config: NodeConfig,
    pub node_id: String,
    pub started_at: u64,
    pub ed25519_public: [u8; 32],
    pub x25519_public: [u8; 32],
    pub vault: Arc<Mutex<KeyVault>>,
    pub trust: Arc<TrustStore>,
    pub router: Arc<Router>,
    pub signer: Arc<dyn MessageSigner>,
    pub supervisor: Arc<Supervisor>,
    pub kv: Arc<KvStore>,
    pub tokens: Arc<TokenService>,
    pub limiter: Arc<LoginLimiter>,
    pub ipc_token: String,
    pub bus: EventBus,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Locked,
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Locked => (
                StatusCode::TOO_MANY_REQUESTS,
                "locked out, retry later".to_string(),
            ),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(e.to_string())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Bearer access token, or the persisted IPC token via `ApiKey`.
fn authorize(ctx: &ApiContext, headers: &HeaderMap) -> Result<(), ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if let Some(token) = value.strip_prefix("Bearer ") {
        ctx.tokens
            .verify(token, TokenKind::Access)
            .map(|_| ())
            .map_err(|_| ApiError::Unauthorized)
    } else if let Some(key) = value.strip_prefix("ApiKey ") {
        let expected = SecretBuffer::from_slice(ctx.ipc_token.as_bytes());
        if expected.ct_eq(key.as_bytes()) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn validate_peer_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() || id.len() > MAX_PEER_ID_CHARS {
        return Err(ApiError::BadRequest(
            "peer id must be 1..=256 characters".into(),
        ));
    }
    Ok(())
}

fn decode_key32(value: &str) -> Result<[u8; 32], ApiError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ApiError::BadRequest("public key is not valid base64".into()))?;
    bytes
        .try_into()
        .map_err(|_| ApiError::BadRequest("public key must decode to exactly 32 bytes".into()))
}

fn parse_level(value: Option<&str>) -> Result<TrustLevel, ApiError> {
    match value.unwrap_or("low") {
        "unknown" => Ok(TrustLevel::Unknown),
        "low" => Ok(TrustLevel::Low),
        "medium" => Ok(TrustLevel::Medium),
        "high" => Ok(TrustLevel::High),
        "ultimate" => Ok(TrustLevel::Ultimate),
        other => Err(ApiError::BadRequest(format!("unknown trust level {other}"))),
    }
}

pub fn router(ctx: Arc<ApiContext>) -> HttpRouter {
    let origins: Vec<HeaderValue> = ctx
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    HttpRouter::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/state", get(state))
        .route("/api/identity", get(identity))
        .route("/api/services", get(services))
        .route("/api/trust", get(trust_list).post(trust_add).delete(trust_remove))
        .route("/api/routing", get(routing_list).post(routing_add))
        .route("/api/storage/kv", get(kv_get).post(kv_put))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_JSON_BODY))
        .layer(cors)
        .with_state(ctx)
}

/// Serve until the listener is dropped or the task is aborted.
pub async fn serve_http(
    ctx: Arc<ApiContext>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http control surface listening");
    axum::serve(
        listener,
        router(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "core_name": "haven" }))
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

async fn login(
    State(ctx): State<Arc<ApiContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    let source = addr.ip().to_string();
    if ctx.limiter.is_locked(&source) {
        return Err(ApiError::Locked);
    }

    // scrypt is deliberately slow; keep it off the async workers.
    let vault = ctx.vault.clone();
    let password = request.password;
    let valid = tokio::task::spawn_blocking(move || vault.lock().verify_password(&password))
        .await
        .map_err(internal)?
        .map_err(internal)?;

    if !valid {
        ctx.limiter.record_failure(&source);
        return Err(ApiError::Unauthorized);
    }
    ctx.limiter.clear(&source);

    let (access, expires_in) = ctx.tokens.issue(&ctx.node_id, TokenKind::Access);
    let (refresh, _) = ctx.tokens.issue(&ctx.node_id, TokenKind::Refresh);
    Ok(Json(json!({
        "accessToken": access,
        "refreshToken": refresh,
        "expiresIn": expires_in,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    State(ctx): State<Arc<ApiContext>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    let subject = ctx
        .tokens
        .verify(&request.refresh_token, TokenKind::Refresh)
        .map_err(|_| ApiError::Unauthorized)?;
    let (access, expires_in) = ctx.tokens.issue(&subject, TokenKind::Access);
    Ok(Json(json!({ "accessToken": access, "expiresIn": expires_in })))
}

async fn state(State(ctx): State<Arc<ApiContext>>) -> Json<Value> {
    let services: Vec<Value> = ctx
        .supervisor
        .statuses()
        .await
        .into_iter()
        .map(|s| json!({ "name": s.name, "state": s.state.to_string() }))
        .collect();
    Json(json!({
        "startedAt": ctx.started_at,
        "uptimeSecs": now_secs().saturating_sub(ctx.started_at),
        "node_id": ctx.node_id,
        "ecdh_public": BASE64.encode(ctx.x25519_public),
        "trust": { "peers": ctx.trust.len() },
        "services": services,
    }))
}

async fn identity(State(ctx): State<Arc<ApiContext>>) -> Json<Value> {
    // Public halves only; private keys never leave the vault.
    Json(json!({
        "node_id": ctx.node_id,
        "ed25519_public": BASE64.encode(ctx.ed25519_public),
        "x25519_public": BASE64.encode(ctx.x25519_public),
    }))
}

async fn services(State(ctx): State<Arc<ApiContext>>) -> Json<Value> {
    let services: Vec<Value> = ctx
        .supervisor
        .statuses()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "state": s.state.to_string(),
                "deps": s.deps,
                "restarts": s.restarts,
                "lastError": s.last_error,
            })
        })
        .collect();
    Json(json!({ "services": services }))
}

fn trust_peer_json(peer: &lib_trust::TrustPeer) -> Value {
    json!({
        "id": peer.id,
        "level": peer.level.to_string(),
        "addedAt": peer.added_at,
        "lastSeq": peer.last_seq,
        "ed25519Public": BASE64.encode(peer.ed25519_public),
        "x25519Public": BASE64.encode(peer.x25519_public),
    })
}

async fn trust_list(State(ctx): State<Arc<ApiContext>>) -> Json<Value> {
    let peers: Vec<Value> = ctx.trust.list().iter().map(trust_peer_json).collect();
    Json(json!({ "peers": peers }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustAddRequest {
    id: String,
    pubkey: String,
    #[serde(default)]
    ecdh_pubkey: Option<String>,
    #[serde(default)]
    level: Option<String>,
}

async fn trust_add(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(request): Json<TrustAddRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&ctx, &headers)?;
    validate_peer_id(&request.id)?;
    let ed25519 = decode_key32(&request.pubkey)?;
    let x25519 = match &request.ecdh_pubkey {
        Some(value) => decode_key32(value)?,
        None => [0u8; 32],
    };
    let level = parse_level(request.level.as_deref())?;

    // Owner changes ride the sync protocol: a signed update on our own
    // chain, applied locally and broadcast to peers at Medium or above.
    let payload = lib_trust::update::encode_add_payload(&ed25519, &x25519, level);
    crate::node::produce_and_broadcast(&ctx, lib_trust::TrustOp::Add, request.id.clone(), payload)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    ctx.bus.publish(NodeEvent::TrustUpdated {
        peer_id: request.id.clone(),
    });
    Ok(Json(json!({ "added": request.id, "level": level.to_string() })))
}

#[derive(Deserialize)]
struct IdQuery {
    id: String,
}

async fn trust_remove(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&ctx, &headers)?;
    if ctx.trust.get(&query.id).is_none() {
        return Err(ApiError::NotFound(format!(
            "no trust record for {}",
            query.id
        )));
    }
    crate::node::produce_and_broadcast(
        &ctx,
        lib_trust::TrustOp::Remove,
        query.id.clone(),
        Vec::new(),
    )
    .await
    .map_err(internal)?;
    ctx.bus.publish(NodeEvent::TrustUpdated {
        peer_id: query.id.clone(),
    });
    Ok(Json(json!({ "removed": query.id })))
}

async fn routing_list(State(ctx): State<Arc<ApiContext>>) -> Json<Value> {
    let routes: Vec<Value> = ctx
        .router
        .list_routes()
        .into_iter()
        .map(|r| json!({ "dst": r.dst, "nextHop": r.next_hop, "metric": r.metric }))
        .collect();
    Json(json!({ "routes": routes }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingAddRequest {
    peer_id: String,
    pubkey: String,
}

async fn routing_add(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(request): Json<RoutingAddRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&ctx, &headers)?;
    validate_peer_id(&request.peer_id)?;
    let x25519 = decode_key32(&request.pubkey)?;

    // A route only makes sense toward a trusted peer; the key lets the
    // channel layer reach it directly.
    let peer = ctx
        .trust
        .get(&request.peer_id)
        .ok_or_else(|| ApiError::BadRequest("peer is not in the trust store".into()))?;
    if peer.x25519_public != x25519 && peer.x25519_public != [0u8; 32] {
        return Err(ApiError::BadRequest(
            "pubkey conflicts with the trusted record".into(),
        ));
    }

    ctx.router
        .add_route(request.peer_id.clone(), request.peer_id.clone(), 1);
    Ok(Json(json!({ "routed": request.peer_id })))
}

#[derive(Deserialize)]
struct KvPutRequest {
    key: String,
    value: String,
}

async fn kv_put(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(request): Json<KvPutRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.kv
        .put(&request.key, request.value.as_bytes())
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "stored": request.key })))
}

#[derive(Deserialize)]
struct KeyQuery {
    key: String,
}

async fn kv_get(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Json<Value>, ApiError> {
    authorize(&ctx, &headers)?;
    let value = ctx.kv.get(&query.key).await.map_err(|e| match e {
        lib_storage::StorageError::NotFound(_) => ApiError::NotFound(query.key.clone()),
        other => internal(other),
    })?;
    Ok(Json(json!({
        "key": query.key,
        "value": String::from_utf8_lossy(&value),
    })))
}
