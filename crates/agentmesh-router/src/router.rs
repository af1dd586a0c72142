use agentmesh_common::{
    AgentDescriptor, Clock, ConnectionHandle, ConnectorSet, EventSink, HealthStatus, MeshError,
    NoAgentReason, NoopEventSink, RegistryEvent, Result, RouterConfig, Stats, Strategy,
    SystemClock,
};
use agentmesh_pool::{PoolConfig, PoolManager};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::{AgentEntry, Directory};
use crate::health_monitor::{HealthMonitor, SweepReport};
use crate::load_balancer::{self, LoadBalancer, LoadSample};
use crate::mass_connector::{MassConnectReport, MassConnector};
use crate::scheduler::Shutdown;
use crate::scorer::{self, Candidate, Scored};
use crate::stats::{RouterStats, StatusCounts};

/// Selects the agents a broadcast goes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastFilter {
    /// Required capabilities (AND); empty matches every agent
    pub capabilities: Vec<String>,
}

impl BroadcastFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_capabilities<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

/// Capability-aware router over a fleet of agents.
///
/// The router owns the agent directory and every connection pool. A routing request
/// goes through four steps:
///
/// 1. **Match**: agents holding all required capabilities
/// 2. **Rank**: score by health, latency, success rate and load
/// 3. **Balance**: the load balancer picks among the `top_k` best agents with spare
///    capacity
/// 4. **Acquire**: borrow a pooled connection, dialing lazily; pool exhaustion and
///    connection failures fall through to the next candidate in score order
///
/// Health sweeps run in the background once [`start`](Self::start) is called, and
/// [`mass_connect`](Self::mass_connect) pre-warms pools for large fleets.
///
/// # Example
///
/// ```rust,no_run
/// use agentmesh_common::{AgentDescriptor, ConnectorSet, Protocol, RouterConfig, TcpConnector};
/// use agentmesh_router::Router;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let connectors = ConnectorSet::uniform(Arc::new(TcpConnector::new()));
/// let router = Router::new(RouterConfig::default(), connectors)?;
///
/// router.register(
///     AgentDescriptor::new("a1", "127.0.0.1:9001", Protocol::Rpc).with_capability("git", "2.0"),
/// )?;
///
/// let conn = router.resolve(&["git"], None).await?;
/// conn.send(b"clone").await?;
/// router.record_outcome(conn.agent_id(), true, 42)?;
/// router.release(conn).await;
///
/// router.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Router {
    config: RouterConfig,
    directory: Arc<Directory>,
    pools: Arc<PoolManager>,
    health: Arc<HealthMonitor>,
    mass: Arc<MassConnector>,
    balancer: RwLock<Arc<dyn LoadBalancer>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    shutdown: Shutdown,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Creates a router on the system clock that discards events.
    pub fn new(config: RouterConfig, connectors: ConnectorSet) -> Result<Self> {
        Self::with_parts(
            config,
            connectors,
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        )
    }

    /// Creates a router with an explicit clock and event sink.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration does not validate.
    pub fn with_parts(
        config: RouterConfig,
        connectors: ConnectorSet,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let directory = Arc::new(Directory::new(config.max_agents));
        let pools = Arc::new(PoolManager::new(
            connectors.clone(),
            clock.clone(),
            events.clone(),
            PoolConfig::default(),
        ));
        let health = Arc::new(HealthMonitor::new(
            directory.clone(),
            pools.clone(),
            connectors,
            clock.clone(),
            events.clone(),
            config.health.clone(),
        ));
        let mass = Arc::new(MassConnector::new(
            directory.clone(),
            pools.clone(),
            config.mass_connect.clone(),
            shutdown.signal(),
        ));

        info!(
            max_agents = config.max_agents,
            top_k = config.top_k,
            strategy = ?config.strategy,
            "Router initialized"
        );

        Ok(Self {
            balancer: RwLock::new(load_balancer::for_strategy(config.strategy)),
            config,
            directory,
            pools,
            health,
            mass,
            clock,
            events,
            shutdown,
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshError::Shutdown);
        }
        Ok(())
    }

    /// Starts the background health sweep. Calling it again is a no-op.
    pub fn start(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(self.health.clone().spawn(self.shutdown.signal()));
        }
    }

    /// Registers an agent with an empty pool, `unknown` health and zero stats.
    ///
    /// # Errors
    ///
    /// - `RegistryFull` when `max_agents` is reached
    /// - `DuplicateAgent` when the ID is already registered
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        self.ensure_open()?;
        let descriptor = self.directory.register(descriptor)?;
        self.pools.register_agent(&descriptor);

        info!(
            agent_id = %descriptor.id,
            capabilities = ?descriptor.capability_names(),
            "Agent registered"
        );
        self.events.emit(RegistryEvent::AgentRegistered {
            descriptor: descriptor.as_ref().clone(),
        });
        Ok(())
    }

    /// Removes an agent and closes its connections. Unknown IDs are a no-op.
    ///
    /// Returns whether the agent was registered.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        if !self.directory.contains(agent_id) {
            return false;
        }

        // The ID stays taken until its pool is gone
        let closed = self.pools.remove(agent_id).await;
        if self.directory.unregister(agent_id).is_none() {
            return false;
        }

        info!(agent_id = %agent_id, closed, "Agent unregistered");
        self.events.emit(RegistryEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        true
    }

    /// Borrows a connection to the best available agent holding every capability in
    /// `required`.
    ///
    /// When `deadline` passes first, any in-flight dial is abandoned and its pool slot
    /// released. Hand the connection back with [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// - `NoAvailableAgent(NoMatch)` when no agent has the capabilities
    /// - `NoAvailableAgent(Exhausted)` when every candidate failed to hand out a
    ///   connection
    /// - `NoAvailableAgent(DeadlineExceeded)` when the deadline elapsed
    pub async fn resolve<S: AsRef<str>>(
        &self,
        required: &[S],
        deadline: Option<Instant>,
    ) -> Result<ConnectionHandle> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.resolve_now(required))
                .await
                .unwrap_or(Err(MeshError::NoAvailableAgent(
                    NoAgentReason::DeadlineExceeded,
                ))),
            None => self.resolve_now(required).await,
        }
    }

    /// [`resolve`](Self::resolve) with a deadline `timeout` from now.
    pub async fn resolve_within<S: AsRef<str>>(
        &self,
        required: &[S],
        timeout: Duration,
    ) -> Result<ConnectionHandle> {
        self.resolve(required, Some(Instant::now() + timeout)).await
    }

    async fn resolve_now<S: AsRef<str>>(&self, required: &[S]) -> Result<ConnectionHandle> {
        self.ensure_open()?;

        let ranked = self.rank(required);
        if ranked.is_empty() {
            return Err(MeshError::NoAvailableAgent(NoAgentReason::NoMatch(
                required.iter().map(|s| s.as_ref().to_string()).collect(),
            )));
        }

        let order = self.attempt_order(&ranked);
        for &index in &order {
            let agent_id = ranked[index].candidate.id();
            match self.pools.acquire(agent_id).await {
                Ok(handle) => {
                    debug!(
                        agent_id = %agent_id,
                        score = ranked[index].score,
                        connection_id = handle.id(),
                        "Resolved agent"
                    );
                    return Ok(handle);
                }
                // Unknown here means the agent was unregistered after matching
                Err(e) if e.is_retryable() || matches!(e, MeshError::UnknownAgent(_)) => {
                    debug!(agent_id = %agent_id, "Candidate skipped: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            tried = order.len(),
            "No candidate could provide a connection"
        );
        Err(MeshError::NoAvailableAgent(NoAgentReason::Exhausted {
            tried: order.len(),
        }))
    }

    /// Matching agents, best first.
    pub fn rank<S: AsRef<str>>(&self, required: &[S]) -> Vec<Scored> {
        let candidates = self
            .directory
            .find_by_capabilities(required)
            .into_iter()
            .map(|entry| {
                let leased = self
                    .pools
                    .pool_load(&entry.descriptor.id)
                    .map_or(0, |load| load.leased);
                Candidate::new(entry, leased)
            })
            .collect();
        scorer::rank(candidates, required)
    }

    /// Indices into `ranked` in the order they should be tried: the load balancer's
    /// pick among the top-K candidates with spare capacity first, then everything
    /// else by score.
    fn attempt_order(&self, ranked: &[Scored]) -> Vec<usize> {
        let ready: Vec<usize> = (0..ranked.len())
            .filter(|&i| {
                self.pools
                    .pool_load(ranked[i].candidate.id())
                    .is_some_and(|load| load.has_capacity())
            })
            .take(self.config.top_k)
            .collect();

        let samples: Vec<LoadSample<'_>> = ready
            .iter()
            .map(|&i| LoadSample {
                agent_id: ranked[i].candidate.id(),
                active: ranked[i].candidate.active_connections,
            })
            .collect();

        let balancer = self.balancer.read().clone();
        let first = balancer.select(&samples).map(|pick| ready[pick]);

        let mut order = Vec::with_capacity(ranked.len());
        order.extend(first);
        order.extend((0..ranked.len()).filter(|&i| Some(i) != first));
        order
    }

    /// Returns a borrowed connection to its pool.
    pub async fn release(&self, handle: ConnectionHandle) {
        self.pools.release(handle).await;
    }

    /// Records one request outcome and re-derives the agent's success rate.
    pub fn record_outcome(&self, agent_id: &str, success: bool, latency_ms: u64) -> Result<Stats> {
        let stats = self
            .directory
            .record_outcome(agent_id, success, latency_ms, self.clock.now_ms())
            .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))?;

        self.events.emit(RegistryEvent::AgentStatsUpdated {
            agent_id: agent_id.to_string(),
            stats: stats.clone(),
        });
        Ok(stats)
    }

    /// Marks an agent degraded by consumer policy. The next probe result replaces it.
    pub fn mark_degraded(&self, agent_id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.directory
            .update_health(agent_id, |health| {
                health.set_status(HealthStatus::Degraded, now)
            })
            .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))?;
        info!(agent_id = %agent_id, "Agent marked degraded");
        Ok(())
    }

    /// Sends `message` over an idle open connection of every agent matching `filter`.
    ///
    /// Agents without an idle connection are skipped. Each send has the agent's own
    /// timeout and failures are isolated. Returns how many sends succeeded.
    pub async fn broadcast(&self, filter: &BroadcastFilter, message: &[u8]) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let targets: Vec<(ConnectionHandle, Duration)> = self
            .directory
            .find_by_capabilities(&filter.capabilities)
            .into_iter()
            .filter_map(|entry| {
                let timeout = Duration::from_millis(entry.descriptor.config.timeout_ms);
                self.pools
                    .try_acquire_idle(&entry.descriptor.id)
                    .map(|handle| (handle, timeout))
            })
            .collect();

        let attempted = targets.len();
        let sends = targets.into_iter().map(|(handle, timeout)| async move {
            let sent = match tokio::time::timeout(timeout, handle.send(message)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(agent_id = %handle.agent_id(), "Broadcast send failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!(
                        agent_id = %handle.agent_id(),
                        "Broadcast send timed out after {}ms",
                        timeout.as_millis()
                    );
                    false
                }
            };
            self.pools.release(handle).await;
            sent
        });

        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        debug!(attempted, delivered, "Broadcast finished");
        delivered
    }

    /// Pre-warms one connection for every registered agent, higher priority first.
    pub async fn mass_connect(&self) -> MassConnectReport {
        let mut agents: Vec<Arc<AgentDescriptor>> = self
            .directory
            .snapshot()
            .into_iter()
            .map(|entry| entry.descriptor)
            .collect();
        agents.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        let ids: Vec<String> = agents.iter().map(|d| d.id.clone()).collect();
        self.mass_connect_agents(&ids).await
    }

    /// Pre-warms the listed agents, in order.
    pub async fn mass_connect_agents(&self, agent_ids: &[String]) -> MassConnectReport {
        if self.closed.load(Ordering::Acquire) {
            return MassConnectReport {
                cancelled: true,
                ..MassConnectReport::default()
            };
        }
        self.mass.connect_all(agent_ids).await
    }

    /// Runs one health sweep immediately.
    pub async fn sweep_health(&self) -> SweepReport {
        self.health.sweep_once().await
    }

    /// Swaps the load-balancing strategy. In-flight connections are unaffected.
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.balancer.write() = load_balancer::for_strategy(strategy);
        info!(strategy = ?strategy, "Load balancing strategy changed");
    }

    pub fn strategy(&self) -> Strategy {
        self.balancer.read().strategy()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentEntry> {
        self.directory.get(agent_id)
    }

    pub fn agent_count(&self) -> usize {
        self.directory.len()
    }

    pub fn stats(&self) -> RouterStats {
        let status_counts = StatusCounts::from_map(&self.directory.status_counts());
        RouterStats {
            total_agents: self.directory.len(),
            healthy_agents: status_counts.healthy,
            status_counts,
            active_connections: self.pools.open_connections(),
            capability_coverage: self.directory.capability_coverage(),
            failed_connections: self.mass.failed_connections(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the health sweep and reconnect watchers, closes every connection and
    /// clears the registry. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.trigger();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
        }

        let closed = self.pools.drain_all().await;
        let removed = self.directory.clear();
        info!(
            agents = removed.len(),
            connections = closed,
            "Router shut down"
        );
    }
}
