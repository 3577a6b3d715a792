//! Node assembly and lifecycle
//!
//! Builds every component from an unlocked vault, registers them as
//! supervised services and runs until a termination signal. All
//! long-lived state hangs off the shared context; modules get
//! back-references for lookup only.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lib_crypto::ScryptParams;
use lib_network::{
    ChannelManager, Dispatcher, Envelope, MessageSigner, Router, Transport, TransportEvent,
};
use lib_storage::{blob, FileStore, KvStore};
use lib_trust::{TrustLevel, TrustOp, TrustSnapshot, TrustStore, TrustUpdate};
use lib_vault::{KeyVault, NodeIdentity, SubKeyPurpose};

use crate::api::http::ApiContext;
use crate::api::tokens::{LoginLimiter, TokenService};
use crate::api::{control, serve_http};
use crate::config::NodeConfig;
use crate::events::{EventBus, NodeEvent};
use crate::supervisor::snapshot::{
    write_snapshot, NodeSnapshot, RouteDescriptor, ServiceDescriptor,
};
use crate::supervisor::{ModuleRegistry, RestartPolicy, Service, Supervisor};

const TRUST_STORE_AAD: &[u8] = b"haven.trust-store.v1";
const TRUST_UPDATE_KIND: &str = "trust-update";
/// Hop budget for trust-update broadcasts.
const TRUST_BROADCAST_TTL: u8 = 4;

/// Vault-backed envelope and hop signer.
pub struct NodeSigner {
    identity: Arc<NodeIdentity>,
}

impl MessageSigner for NodeSigner {
    fn id(&self) -> &str {
        self.identity.node_id()
    }
    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.identity.sign(message)
    }
}

/// Generic supervised task: the factory is invoked on every (re)start,
/// stop aborts the running task.
struct TaskService {
    name: String,
    deps: Vec<String>,
    factory: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskService {
    fn new(
        name: &str,
        deps: &[&str],
        factory: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            factory: Box::new(factory),
            handle: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Service for TaskService {
    fn name(&self) -> &str {
        &self.name
    }
    fn deps(&self) -> Vec<String> {
        self.deps.clone()
    }
    async fn start(&self) -> Result<()> {
        let task = tokio::spawn((self.factory)());
        *self.handle.lock() = Some(task);
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
        Ok(())
    }
    async fn health(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

/// Listener lifecycle for the peer transport.
struct TransportService {
    transport: Arc<Transport>,
    listen_addr: std::net::SocketAddr,
}

#[async_trait]
impl Service for TransportService {
    fn name(&self) -> &str {
        "transport"
    }
    async fn start(&self) -> Result<()> {
        self.transport.listen(self.listen_addr).await?;
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        for peer in self.transport.connected_peers() {
            self.transport.disconnect(&peer);
        }
        Ok(())
    }
}

pub struct Node {
    pub config: NodeConfig,
    pub ctx: Arc<ApiContext>,
    pub supervisor: Arc<Supervisor>,
    pub registry: Arc<ModuleRegistry>,
    pub bus: EventBus,
    channels: Arc<ChannelManager>,
    vault: Arc<Mutex<KeyVault>>,
    /// First-boot recovery phrase, surfaced exactly once to the owner.
    pub mnemonic: Option<String>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Node {
    /// Unlock (or initialize) the vault and assemble every component.
    pub async fn build(config: NodeConfig, password: &str) -> Result<Node> {
        std::fs::create_dir_all(&config.env_dir)
            .with_context(|| format!("creating {}", config.env_dir.display()))?;

        let mut vault = KeyVault::new(&config.env_dir, ScryptParams::default());
        let mnemonic = if vault.is_initialized() {
            vault.unlock(password).context("unlocking vault")?;
            None
        } else {
            let mnemonic = vault
                .initialize(password, config.mnemonic_words)
                .context("initializing vault")?;
            info!("vault initialized at first boot");
            Some(mnemonic.to_string())
        };

        let identity = Arc::new(vault.identity()?);
        let node_id = identity.node_id().to_string();
        info!(%node_id, "node identity ready");

        // Storage facades under the vault's storage sub-key.
        let storage_key = vault.derive_subkey(SubKeyPurpose::Storage)?;
        let files = FileStore::new(config.data_dir(), storage_key);
        let kv = Arc::new(KvStore::new(files));

        // Trust store: sealed snapshot if present, fresh otherwise.
        let trust_key = Arc::new(vault.derive_subkey_raw(b"trust-store", 32)?);
        let trust = Arc::new(load_trust_store(&config, &trust_key, &node_id)?);

        // Control-surface tokens.
        let token_key = vault.derive_subkey(SubKeyPurpose::ApiToken)?;
        let tokens = Arc::new(TokenService::new(token_key));
        let ipc_token = issue_ipc_token(&config)?;

        let bus = EventBus::default();
        let signer: Arc<dyn MessageSigner> = Arc::new(NodeSigner {
            identity: identity.clone(),
        });

        let channels = Arc::new(ChannelManager::new(node_id.clone(), trust.clone()));
        let (transport, transport_events) = Transport::new(node_id.clone(), 256);
        let transport = Arc::new(transport);
        let (router, inbound) = Router::new(
            trust.clone(),
            channels.clone(),
            transport.clone(),
            signer.clone(),
        );
        let router = Arc::new(router);
        let (dispatcher, _dispatch_events) = Dispatcher::new(node_id.clone(), 256);
        let dispatcher = Arc::new(dispatcher);

        let vault = Arc::new(Mutex::new(vault));
        let supervisor = Arc::new(Supervisor::new(
            bus.clone(),
            Duration::from_secs(config.shutdown_budget_secs),
        ));

        let ctx = Arc::new(ApiContext {
            config: config.clone(),
            node_id: node_id.clone(),
            started_at: now_secs(),
            ed25519_public: identity.ed25519_public(),
            x25519_public: identity.x25519_public(),
            vault: vault.clone(),
            trust: trust.clone(),
            router: router.clone(),
            signer: signer.clone(),
            supervisor: supervisor.clone(),
            kv: kv.clone(),
            tokens,
            limiter: Arc::new(LoginLimiter::new()),
            ipc_token,
            bus: bus.clone(),
        });

        // Shared lookups for anything composed on top of the kernel.
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("trust", trust.clone())?;
        registry.register("router", router.clone())?;
        registry.register("channels", channels.clone())?;
        registry.register("kv", kv.clone())?;

        let node = Node {
            config: config.clone(),
            ctx: ctx.clone(),
            supervisor: supervisor.clone(),
            registry,
            bus: bus.clone(),
            channels: channels.clone(),
            vault,
            mnemonic,
        };

        node.register_services(ctx, transport, transport_events, inbound, dispatcher, identity, trust_key)
            .await?;
        Ok(node)
    }

    #[allow(clippy::too_many_arguments)]
    async fn register_services(
        &self,
        ctx: Arc<ApiContext>,
        transport: Arc<Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        inbound: mpsc::Receiver<Envelope>,
        dispatcher: Arc<Dispatcher>,
        identity: Arc<NodeIdentity>,
        trust_key: Arc<lib_crypto::SecretBuffer>,
    ) -> Result<()> {
        let supervisor = &self.supervisor;

        supervisor
            .register(
                Arc::new(TransportService {
                    transport: transport.clone(),
                    listen_addr: self.config.listen_addr,
                }),
                RestartPolicy::OnFailure,
            )
            .await?;

        // Transport events -> channels + router.
        let events = Arc::new(tokio::sync::Mutex::new(Some(transport_events)));
        let pump_ctx = ctx.clone();
        let pump_channels = self.channels.clone();
        let pump_identity = identity;
        supervisor
            .register(
                TaskService::new("router-pump", &["transport"], move || {
                    let events = events.clone();
                    let ctx = pump_ctx.clone();
                    let channels = pump_channels.clone();
                    let identity = pump_identity.clone();
                    Box::pin(async move {
                        let Some(mut events) = events.lock().await.take() else {
                            warn!("transport event stream already consumed");
                            return;
                        };
                        while let Some(event) = events.recv().await {
                            match event {
                                TransportEvent::Connected { peer_id, .. } => {
                                    open_channel_if_trusted(&ctx, &channels, &identity, &peer_id);
                                    ctx.bus.publish(NodeEvent::PeerConnected { peer_id });
                                }
                                TransportEvent::Disconnected { peer_id, reason } => {
                                    channels.close(&peer_id, &reason);
                                    ctx.bus.publish(NodeEvent::PeerDisconnected { peer_id });
                                }
                                TransportEvent::Frame { peer_id, bytes } => {
                                    if let Err(e) = ctx.router.receive(&peer_id, &bytes).await {
                                        debug!(peer = %peer_id, "inbound frame rejected: {e}");
                                    }
                                }
                            }
                        }
                    })
                }),
                RestartPolicy::OnFailure,
            )
            .await?;

        // Accepted envelopes -> protocol dispatch and trust sync.
        let inbound = Arc::new(tokio::sync::Mutex::new(Some(inbound)));
        let dispatch_ctx = ctx.clone();
        supervisor
            .register(
                TaskService::new("dispatch", &["router-pump"], move || {
                    let inbound = inbound.clone();
                    let ctx = dispatch_ctx.clone();
                    let dispatcher = dispatcher.clone();
                    Box::pin(async move {
                        let Some(mut inbound) = inbound.lock().await.take() else {
                            warn!("inbound envelope stream already consumed");
                            return;
                        };
                        while let Some(envelope) = inbound.recv().await {
                            handle_envelope(&ctx, &dispatcher, envelope).await;
                        }
                    })
                }),
                RestartPolicy::OnFailure,
            )
            .await?;

        // Loopback HTTP API.
        let http_ctx = ctx.clone();
        let http_addr = self.config.http_addr;
        supervisor
            .register(
                TaskService::new("http-api", &[], move || {
                    let ctx = http_ctx.clone();
                    Box::pin(async move {
                        let listener = match tokio::net::TcpListener::bind(http_addr).await {
                            Ok(listener) => listener,
                            Err(e) => {
                                warn!("http bind failed: {e}");
                                return;
                            }
                        };
                        if let Err(e) = serve_http(ctx, listener).await {
                            warn!("http surface ended: {e}");
                        }
                    })
                }),
                RestartPolicy::OnFailure,
            )
            .await?;

        // Local socket command surface.
        let control_ctx = ctx.clone();
        let socket_path = self.config.control_socket_path();
        supervisor
            .register(
                TaskService::new("control-api", &[], move || {
                    let ctx = control_ctx.clone();
                    let path = socket_path.clone();
                    Box::pin(async move {
                        if let Err(e) = control::serve_control(ctx, path).await {
                            warn!("control surface ended: {e}");
                        }
                    })
                }),
                RestartPolicy::OnFailure,
            )
            .await?;

        // Periodic snapshots + sealed trust store persistence.
        let snap_ctx = ctx.clone();
        let snap_config = self.config.clone();
        supervisor
            .register(
                TaskService::new("snapshots", &[], move || {
                    let ctx = snap_ctx.clone();
                    let config = snap_config.clone();
                    let trust_key = trust_key.clone();
                    Box::pin(async move {
                        let mut seq: u64 = now_secs();
                        let mut ticker = tokio::time::interval(Duration::from_secs(
                            config.snapshot_interval_secs.max(1),
                        ));
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        loop {
                            ticker.tick().await;
                            seq += 1;
                            if let Err(e) = persist_state(&ctx, &config, &trust_key, seq).await {
                                warn!("snapshot failed: {e}");
                            }
                        }
                    })
                }),
                RestartPolicy::OnFailure,
            )
            .await?;

        Ok(())
    }

    /// Start everything and keep running until a termination signal.
    pub async fn run(mut self) -> Result<()> {
        self.supervisor.start_all().await?;
        let monitor = self
            .supervisor
            .clone()
            .spawn_health_monitor(Duration::from_secs(self.config.health_interval_secs.max(1)));
        info!(node_id = %self.ctx.node_id, "haven node running");

        wait_for_shutdown_signal().await;

        monitor.abort();
        self.shutdown().await;
        Ok(())
    }

    /// Reverse-order stop, then wipe every resident secret.
    pub async fn shutdown(&mut self) {
        info!("shutting down");
        self.supervisor.stop_all().await;
        self.channels.close_all("shutdown");
        self.vault.lock().lock();
        info!("shutdown complete, secrets wiped");
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
    let mut sighup = signal(SignalKind::hangup()).expect("sighup handler");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                break;
            }
            _ = sighup.recv() => {
                // Advisory only: operators re-point log filters via config.
                info!("SIGHUP received, configuration reload is advisory");
            }
        }
    }
}

fn load_trust_store(
    config: &NodeConfig,
    trust_key: &lib_crypto::SecretBuffer,
    node_id: &str,
) -> Result<TrustStore> {
    let path = config.trust_store_path();
    match std::fs::read(&path) {
        Ok(sealed) => {
            let bytes = blob::open(trust_key, &sealed, TRUST_STORE_AAD)
                .context("trust store failed integrity check; manual recovery required")?;
            let snapshot: TrustSnapshot =
                bincode::deserialize(&bytes).context("decoding trust snapshot")?;
            let store = TrustStore::from_snapshot(node_id.to_string(), snapshot);
            info!(peers = store.len(), "trust store loaded");
            Ok(store)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(TrustStore::new(node_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Fresh per-boot token for the local endpoint, owner-readable only.
fn issue_ipc_token(config: &NodeConfig) -> Result<String> {
    let token = hex::encode(lib_crypto::random_bytes(32));
    let path = config.ipc_token_path();
    std::fs::write(&path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(token)
}

fn open_channel_if_trusted(
    ctx: &ApiContext,
    channels: &ChannelManager,
    identity: &NodeIdentity,
    peer_id: &str,
) {
    let Some(peer) = ctx.trust.get(peer_id) else {
        debug!(peer = %peer_id, "connected peer not in trust store, no channel");
        return;
    };
    if peer.level < TrustLevel::Low || peer.x25519_public == [0u8; 32] {
        return;
    }
    match identity.agree(&peer.x25519_public) {
        Ok(shared) => {
            if let Err(e) = channels.open(peer_id, &shared) {
                warn!(peer = %peer_id, "channel open failed: {e}");
            }
        }
        Err(e) => warn!(peer = %peer_id, "key agreement failed: {e}"),
    }
}

/// Dispatch one accepted envelope: trust updates feed the sync
/// protocol, everything else goes through the typed dispatcher and any
/// reply is routed back to the sender.
async fn handle_envelope(ctx: &ApiContext, dispatcher: &Dispatcher, envelope: Envelope) {
    ctx.bus.publish(NodeEvent::EnvelopeDelivered {
        from: envelope.from.clone(),
        kind: envelope.kind.clone(),
    });

    if envelope.kind == TRUST_UPDATE_KIND {
        ingest_trust_update(ctx, &envelope).await;
        return;
    }

    match dispatcher.handle(&envelope).await {
        Ok(Some(reply)) => {
            let Ok(body) = reply.body() else { return };
            match Envelope::build(ctx.signer.as_ref(), envelope.from.clone(), reply.kind(), body) {
                Ok(reply_envelope) => {
                    if let Err(e) = ctx.router.send(&envelope.from, reply_envelope).await {
                        debug!(peer = %envelope.from, "reply not delivered: {e}");
                    }
                }
                Err(e) => debug!("reply build failed: {e}"),
            }
        }
        Ok(None) => {}
        Err(e) => debug!(peer = %envelope.from, "dispatch rejected envelope: {e}"),
    }
}

async fn ingest_trust_update(ctx: &ApiContext, envelope: &Envelope) {
    let update: TrustUpdate = match bincode::deserialize(&envelope.body) {
        Ok(update) => update,
        Err(e) => {
            debug!(peer = %envelope.from, "malformed trust update: {e}");
            return;
        }
    };
    let target = update.target.clone();
    match ctx.trust.ingest(update.clone()) {
        Ok(()) => {
            ctx.bus.publish(NodeEvent::TrustUpdated { peer_id: target });
            // Rebroadcast once, excluding where it came from.
            broadcast_trust_update(ctx, &update, Some(&envelope.from)).await;
        }
        Err(e) => debug!(peer = %envelope.from, "trust update rejected: {e}"),
    }
}

/// Send a trust update to every peer at or above `Medium`, hop budget 4.
pub async fn broadcast_trust_update(
    ctx: &ApiContext,
    update: &TrustUpdate,
    exclude: Option<&str>,
) {
    let body = match bincode::serialize(update) {
        Ok(body) => body,
        Err(e) => {
            warn!("trust update encode failed: {e}");
            return;
        }
    };
    for peer in ctx.trust.peers_at_or_above(TrustLevel::Medium) {
        if peer.id == ctx.node_id || Some(peer.id.as_str()) == exclude {
            continue;
        }
        let envelope = match Envelope::build(
            ctx.signer.as_ref(),
            peer.id.clone(),
            TRUST_UPDATE_KIND,
            body.clone(),
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("trust update envelope failed: {e}");
                continue;
            }
        };
        if let Err(e) = ctx
            .router
            .send_with_ttl(&peer.id, envelope, TRUST_BROADCAST_TTL)
            .await
        {
            debug!(peer = %peer.id, "trust broadcast skipped: {e}");
        }
    }
}

/// Produce a signed trust operation on our own chain and broadcast it.
pub async fn produce_and_broadcast(
    ctx: &ApiContext,
    op: TrustOp,
    target: String,
    payload: Vec<u8>,
) -> lib_trust::Result<TrustUpdate> {
    let signer = ctx.signer.clone();
    let update = ctx
        .trust
        .produce(op, target, payload, move |bytes| signer.sign(bytes))?;
    broadcast_trust_update(ctx, &update, None).await;
    Ok(update)
}

/// Write the supervisor snapshot and the sealed trust store.
async fn persist_state(
    ctx: &ApiContext,
    config: &NodeConfig,
    trust_key: &lib_crypto::SecretBuffer,
    seq: u64,
) -> Result<()> {
    let services = ctx
        .supervisor
        .statuses()
        .await
        .into_iter()
        .map(|s| ServiceDescriptor {
            name: s.name,
            state: s.state.to_string(),
            deps: s.deps,
            restarts: s.restarts,
        })
        .collect();
    let routes = ctx
        .router
        .list_routes()
        .into_iter()
        .map(|r| RouteDescriptor {
            dst: r.dst,
            next_hop: r.next_hop,
            metric: r.metric,
        })
        .collect();

    let snapshot = NodeSnapshot {
        seq,
        taken_at: now_secs(),
        node_id: ctx.node_id.clone(),
        services,
        routes,
        trust: ctx.trust.to_snapshot(),
    };
    write_snapshot(&config.snapshot_dir(), &snapshot, config.snapshots_kept).await?;

    // Trust store rides its own sealed file for startup loading.
    let trust_bytes = bincode::serialize(&snapshot.trust)?;
    let sealed = blob::seal(trust_key, &trust_bytes, TRUST_STORE_AAD)?;
    let path = config.trust_store_path();
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &sealed).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}
