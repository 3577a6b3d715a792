//! Service supervisor and module registry
//!
//! Owns every service's lifecycle: dependency-ordered startup, reverse
//! dependency-ordered shutdown with a per-service budget, periodic
//! health probes with crash detection, and policy-driven restart with
//! exponential backoff. A service that fails during startup is never
//! restarted silently; only services that crashed after reaching
//! `Running` qualify.

pub mod error;
pub mod snapshot;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::events::{EventBus, NodeEvent};

pub use error::SupervisorError;

/// Backoff floor, doubling per restart attempt.
const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RESTARTS: u32 = 5;
const HEALTH_FAILURE_THRESHOLD: u32 = 3;

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Names of services that must be `Running` first.
    fn deps(&self) -> Vec<String> {
        Vec::new()
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Periodic liveness probe; `false` counts toward crash detection.
    async fn health(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Initializing,
    Ready,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Crashed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Created => "created",
            ServiceState::Initializing => "initializing",
            ServiceState::Ready => "ready",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
            ServiceState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    OnDemand,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub policy: RestartPolicy,
    pub deps: Vec<String>,
    pub restarts: u32,
    pub last_error: Option<String>,
}

struct Entry {
    service: Arc<dyn Service>,
    state: ServiceState,
    policy: RestartPolicy,
    restarts: u32,
    health_failures: u32,
    last_error: Option<String>,
}

pub struct Supervisor {
    entries: RwLock<HashMap<String, Entry>>,
    bus: EventBus,
    shutdown_budget: Duration,
}

impl Supervisor {
    pub fn new(bus: EventBus, shutdown_budget: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus,
            shutdown_budget,
        }
    }

    /// One-shot registration per name.
    pub async fn register(
        &self,
        service: Arc<dyn Service>,
        policy: RestartPolicy,
    ) -> Result<(), SupervisorError> {
        let name = service.name().to_string();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&name) {
            return Err(SupervisorError::AlreadyRegistered(name));
        }
        entries.insert(
            name.clone(),
            Entry {
                service,
                state: ServiceState::Created,
                policy,
                restarts: 0,
                health_failures: 0,
                last_error: None,
            },
        );
        drop(entries);
        self.bus.publish(NodeEvent::ServiceRegistered { name });
        Ok(())
    }

    pub async fn statuses(&self) -> Vec<ServiceStatus> {
        let entries = self.entries.read().await;
        let mut statuses: Vec<_> = entries
            .iter()
            .map(|(name, entry)| ServiceStatus {
                name: name.clone(),
                state: entry.state,
                policy: entry.policy,
                deps: entry.service.deps(),
                restarts: entry.restarts,
                last_error: entry.last_error.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.entries.read().await.get(name).map(|e| e.state)
    }

    /// Kahn's algorithm over the declared dependency edges.
    async fn topo_order(&self) -> Result<Vec<String>, SupervisorError> {
        let entries = self.entries.read().await;
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for (name, entry) in entries.iter() {
            indegree.entry(name.clone()).or_insert(0);
            for dep in entry.service.deps() {
                if !entries.contains_key(&dep) {
                    return Err(SupervisorError::MissingDependency {
                        service: name.clone(),
                        dependency: dep,
                    });
                }
                *indegree.entry(name.clone()).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(name.clone());
            }
        }

        let mut roots: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        roots.sort(); // deterministic order among independents
        let mut queue: VecDeque<String> = roots.into();

        let mut order = Vec::with_capacity(entries.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.clone());
            for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                let d = indegree.get_mut(&dependent).expect("known service");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != entries.len() {
            return Err(SupervisorError::DependencyCycle);
        }
        Ok(order)
    }

    /// Start every service in dependency order. A startup failure is
    /// fatal; nothing gets silently restarted here.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        let order = self.topo_order().await?;
        info!(?order, "starting services");
        for name in order {
            self.bring_up(&name).await?;
        }
        Ok(())
    }

    async fn bring_up(&self, name: &str) -> Result<(), SupervisorError> {
        let service = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
            entry.state = ServiceState::Initializing;
            entry.service.clone()
        };
        self.bus.publish(NodeEvent::ServiceInit {
            name: name.to_string(),
        });

        if let Err(e) = service.init().await {
            return Err(self.mark_failed(name, "init", &e).await);
        }
        self.set_state(name, ServiceState::Ready).await;

        self.set_state(name, ServiceState::Starting).await;
        self.bus.publish(NodeEvent::ServiceStart {
            name: name.to_string(),
        });
        if let Err(e) = service.start().await {
            return Err(self.mark_failed(name, "start", &e).await);
        }
        self.set_state(name, ServiceState::Running).await;
        info!(service = name, "service running");
        Ok(())
    }

    /// Stop everything in reverse dependency order. A service that
    /// overruns the budget is detached and marked stopped; its drop
    /// impls are responsible for wiping what it owned.
    pub async fn stop_all(&self) {
        let order = match self.topo_order().await {
            Ok(order) => order,
            Err(e) => {
                error!("cannot order services for shutdown: {e}");
                self.entries.read().await.keys().cloned().collect()
            }
        };

        for name in order.into_iter().rev() {
            let (service, state) = {
                let entries = self.entries.read().await;
                match entries.get(&name) {
                    Some(entry) => (entry.service.clone(), entry.state),
                    None => continue,
                }
            };
            if !matches!(state, ServiceState::Running | ServiceState::Starting) {
                continue;
            }

            self.set_state(&name, ServiceState::Stopping).await;
            match tokio::time::timeout(self.shutdown_budget, service.stop()).await {
                Ok(Ok(())) => {
                    self.set_state(&name, ServiceState::Stopped).await;
                    self.bus.publish(NodeEvent::ServiceStop { name: name.clone() });
                    info!(service = %name, "service stopped");
                }
                Ok(Err(e)) => {
                    warn!(service = %name, "stop failed: {e}");
                    self.set_state(&name, ServiceState::Stopped).await;
                }
                Err(_) => {
                    warn!(service = %name, "stop exceeded budget, detaching");
                    self.set_state(&name, ServiceState::Stopped).await;
                }
            }
        }
    }

    /// Probe health of every running service; on the third consecutive
    /// failure the service is crashed. Returns the names that crashed
    /// this round so the monitor can apply restart policies.
    pub async fn probe_health(&self) -> Vec<String> {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut crashed_now = Vec::new();
        for name in names {
            let (service, state) = {
                let entries = self.entries.read().await;
                match entries.get(&name) {
                    Some(entry) => (entry.service.clone(), entry.state),
                    None => continue,
                }
            };
            if state != ServiceState::Running {
                continue;
            }

            let healthy = service.health().await;
            let mut crashed = false;
            {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(&name) {
                    if healthy {
                        entry.health_failures = 0;
                    } else {
                        entry.health_failures += 1;
                        if entry.health_failures >= HEALTH_FAILURE_THRESHOLD {
                            entry.state = ServiceState::Crashed;
                            entry.health_failures = 0;
                            crashed = true;
                        }
                    }
                }
            }
            if crashed {
                warn!(service = %name, "health checks exhausted, service crashed");
                self.bus.publish(NodeEvent::ServiceCrashed { name: name.clone() });
                crashed_now.push(name);
            }
        }
        crashed_now
    }

    /// Spawn the periodic health monitor; crashed services are
    /// restarted per policy with capped exponential backoff. Only
    /// services that previously reached `Running` get here.
    pub fn spawn_health_monitor(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for name in self.probe_health().await {
                    schedule_restart(Arc::clone(&self), name).await;
                }
            }
        })
    }

    async fn set_state(&self, name: &str, state: ServiceState) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.state = state;
        }
    }

    async fn mark_failed(
        &self,
        name: &str,
        phase: &'static str,
        error: &anyhow::Error,
    ) -> SupervisorError {
        let message = format!("{error:#}");
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(name) {
                entry.state = ServiceState::Error;
                entry.last_error = Some(message.clone());
            }
        }
        self.bus.publish(NodeEvent::ServiceError {
            name: name.to_string(),
            message: message.clone(),
        });
        SupervisorError::ServiceFailed {
            name: name.to_string(),
            phase,
            message,
        }
    }
}

/// Apply the restart policy to one crashed service: spawn a delayed
/// restart attempt with capped exponential backoff.
async fn schedule_restart(supervisor: Arc<Supervisor>, name: String) {
    let (policy, restarts) = {
        let entries = supervisor.entries.read().await;
        match entries.get(&name) {
            Some(entry) => (entry.policy, entry.restarts),
            None => return,
        }
    };
    if policy == RestartPolicy::OnDemand {
        return;
    }
    if restarts >= MAX_RESTARTS {
        error!(service = %name, "restart cap reached, leaving crashed");
        return;
    }

    let backoff = RESTART_BACKOFF_BASE
        .saturating_mul(1u32 << restarts.min(6))
        .min(RESTART_BACKOFF_CAP);
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        {
            let mut entries = supervisor.entries.write().await;
            if let Some(entry) = entries.get_mut(&name) {
                entry.restarts += 1;
            }
        }
        match supervisor.bring_up(&name).await {
            Ok(()) => info!(service = %name, "service restarted"),
            Err(e) => error!(service = %name, "restart failed: {e}"),
        }
    });
}

/// Name -> shared handle table; registration is one-shot per name.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: parking_lot::RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(
        &self,
        name: &str,
        module: Arc<T>,
    ) -> Result<(), SupervisorError> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(SupervisorError::ModuleAlreadyRegistered(name.to_string()));
        }
        entries.insert(name.to_string(), module);
        Ok(())
    }

    pub fn lookup<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .and_then(|module| module.downcast::<T>().ok())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use parking_lot::Mutex;

    struct Recorder {
        name: String,
        deps: Vec<String>,
        log: Arc<Mutex<Vec<String>>>,
        healthy: Arc<std::sync::atomic::AtomicBool>,
        fail_start: bool,
    }

    impl Recorder {
        fn new(name: &str, deps: &[&str], log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                deps: deps.iter().map(|s| s.to_string()).collect(),
                log,
                healthy: Arc::new(std::sync::atomic::AtomicBool::new(true)),
                fail_start: false,
            })
        }
    }

    #[async_trait]
    impl Service for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn deps(&self) -> Vec<String> {
            self.deps.clone()
        }
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                bail!("boom");
            }
            self.log.lock().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.log.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
        async fn health(&self) -> bool {
            self.healthy.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    fn supervisor() -> Arc<Supervisor> {
        Arc::new(Supervisor::new(EventBus::new(64), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn starts_in_dependency_order_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let supervisor = supervisor();

        supervisor
            .register(Recorder::new("vault", &[], log.clone()), RestartPolicy::Always)
            .await
            .unwrap();
        supervisor
            .register(
                Recorder::new("router", &["vault"], log.clone()),
                RestartPolicy::Always,
            )
            .await
            .unwrap();
        supervisor
            .register(
                Recorder::new("api", &["router"], log.clone()),
                RestartPolicy::Always,
            )
            .await
            .unwrap();

        supervisor.start_all().await.unwrap();
        supervisor.stop_all().await;

        let log = log.lock().clone();
        assert_eq!(
            log,
            vec![
                "start:vault",
                "start:router",
                "start:api",
                "stop:api",
                "stop:router",
                "stop:vault"
            ]
        );
    }

    #[tokio::test]
    async fn dependency_cycle_is_a_startup_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let supervisor = supervisor();
        supervisor
            .register(Recorder::new("a", &["b"], log.clone()), RestartPolicy::Always)
            .await
            .unwrap();
        supervisor
            .register(Recorder::new("b", &["a"], log.clone()), RestartPolicy::Always)
            .await
            .unwrap();

        assert!(matches!(
            supervisor.start_all().await.unwrap_err(),
            SupervisorError::DependencyCycle
        ));
    }

    #[tokio::test]
    async fn startup_failure_marks_error_and_propagates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let supervisor = supervisor();
        let mut failing = Recorder::new("bad", &[], log.clone());
        Arc::get_mut(&mut failing).unwrap().fail_start = true;
        supervisor.register(failing, RestartPolicy::Always).await.unwrap();

        match supervisor.start_all().await.unwrap_err() {
            SupervisorError::ServiceFailed { name, phase, .. } => {
                assert_eq!(name, "bad");
                assert_eq!(phase, "start");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            supervisor.state_of("bad").await.unwrap(),
            ServiceState::Error
        );
    }

    #[tokio::test]
    async fn failing_health_crashes_after_threshold() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let supervisor = supervisor();
        let service = Recorder::new("flaky", &[], log.clone());
        let healthy = service.healthy.clone();
        supervisor
            .register(service, RestartPolicy::OnDemand)
            .await
            .unwrap();
        supervisor.start_all().await.unwrap();

        healthy.store(false, std::sync::atomic::Ordering::Relaxed);
        for _ in 0..HEALTH_FAILURE_THRESHOLD {
            supervisor.probe_health().await;
        }
        assert_eq!(
            supervisor.state_of("flaky").await.unwrap(),
            ServiceState::Crashed
        );
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let supervisor = supervisor();
        supervisor
            .register(Recorder::new("dup", &[], log.clone()), RestartPolicy::Always)
            .await
            .unwrap();
        assert!(matches!(
            supervisor
                .register(Recorder::new("dup", &[], log), RestartPolicy::Always)
                .await
                .unwrap_err(),
            SupervisorError::AlreadyRegistered(_)
        ));
    }

    #[test]
    fn registry_is_one_shot_and_typed() {
        let registry = ModuleRegistry::new();
        registry.register("counter", Arc::new(42u64)).unwrap();
        assert!(registry.register("counter", Arc::new(7u64)).is_err());

        assert_eq!(registry.lookup::<u64>("counter").as_deref(), Some(&42));
        assert!(registry.lookup::<String>("counter").is_none());
        assert_eq!(registry.names(), vec!["counter".to_string()]);
    }
}
