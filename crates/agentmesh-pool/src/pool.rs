use agentmesh_common::{
    AgentDescriptor, Clock, Connection, ConnectionHandle, ConnectorSet, DialError, EventSink,
    MeshError, Protocol, RegistryEvent, Result,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Dial retry configuration shared by every agent pool.
///
/// The number of retries comes from each agent's `retry_attempts`; this only shapes
/// the backoff between attempts.
///
/// # Default Configuration
///
/// - `initial_backoff_ms`: 50
/// - `max_backoff_ms`: 1000
/// - `backoff_multiplier`: 2.0
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PoolConfig {
    fn next_backoff(&self, current_ms: u64) -> u64 {
        std::cmp::min(
            (current_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// Point-in-time view of one agent's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLoad {
    /// Live connections, idle or leased
    pub active: usize,
    /// Connections currently borrowed by callers
    pub leased: usize,
    pub idle: usize,
    /// Dials in flight
    pub pending: usize,
    pub max_size: usize,
}

impl PoolLoad {
    pub fn has_capacity(&self) -> bool {
        self.idle > 0 || self.active + self.pending < self.max_size
    }
}

struct AgentPool {
    agent_id: Arc<str>,
    endpoint: String,
    protocol: Protocol,
    max_size: usize,
    dial_timeout: Duration,
    retry_attempts: u32,
    state: Mutex<PoolState>,
}

impl AgentPool {
    fn matches(&self, descriptor: &AgentDescriptor) -> bool {
        self.endpoint == descriptor.connection.endpoint
            && self.protocol == descriptor.connection.protocol
            && self.max_size == descriptor.connection.max_pool_size
            && self.dial_timeout == Duration::from_millis(descriptor.config.timeout_ms)
            && self.retry_attempts == descriptor.config.retry_attempts
    }
}

#[derive(Default)]
struct PoolState {
    /// Every live connection of the current generation
    connections: Vec<ConnectionHandle>,
    /// Subset of `connections` waiting to be borrowed (LIFO)
    idle: Vec<ConnectionHandle>,
    pending: usize,
    /// Replaced on every drain; handles from older generations are closed on return
    generation: u64,
}

impl PoolState {
    fn forget(&mut self, id: u64) {
        self.connections.retain(|h| h.id() != id);
        self.idle.retain(|h| h.id() != id);
    }

    fn load(&self, max_size: usize) -> PoolLoad {
        PoolLoad {
            active: self.connections.len(),
            leased: self.connections.len().saturating_sub(self.idle.len()),
            idle: self.idle.len(),
            pending: self.pending,
            max_size,
        }
    }
}

/// A dial slot reserved against the pool bound.
///
/// Dropping it (for instance when the caller's deadline cancels the dial) gives the
/// slot back.
struct Reservation {
    pool: Arc<AgentPool>,
    generation: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }
}

/// Connection pool manager for every registered agent.
///
/// Each agent gets its own bounded pool, created when the agent is registered. Pools
/// start empty; connections are dialed lazily on the first [`acquire`](Self::acquire)
/// and handed back with [`release`](Self::release).
///
/// # Architecture
///
/// - Pools are keyed by agent ID in a sharded map, so unrelated agents never contend
/// - Each pool's bookkeeping sits behind its own short-lived mutex that is never held
///   across a dial
/// - Idle connections are reused LIFO; connections found closed are discarded
/// - A drain moves the pool to a fresh generation so handles still on loan are closed
///   when they come back instead of re-entering the pool. Generations are unique across
///   every pool the manager ever created, so a re-registered agent never shares one
///   with its predecessor
///
/// # Example
///
/// ```rust,no_run
/// use agentmesh_common::{AgentDescriptor, ConnectorSet, Protocol, SystemClock, NoopEventSink, TcpConnector};
/// use agentmesh_pool::{PoolConfig, PoolManager};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pools = PoolManager::new(
///     ConnectorSet::uniform(Arc::new(TcpConnector::new())),
///     Arc::new(SystemClock),
///     Arc::new(NoopEventSink),
///     PoolConfig::default(),
/// );
/// pools.register_agent(&AgentDescriptor::new("a1", "127.0.0.1:9001", Protocol::Rpc));
///
/// let handle = pools.acquire("a1").await?;
/// handle.send(b"work").await?;
/// pools.release(handle).await;
/// # Ok(())
/// # }
/// ```
pub struct PoolManager {
    connectors: ConnectorSet,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: PoolConfig,
    pools: DashMap<String, Arc<AgentPool>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl PoolManager {
    pub fn new(
        connectors: ConnectorSet,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: PoolConfig,
    ) -> Self {
        Self {
            connectors,
            clock,
            events,
            config,
            pools: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Creates an empty pool for the agent.
    ///
    /// An existing pool with the same endpoint and limits is kept as is. One built from
    /// different connection settings is replaced and its connections are closed.
    pub fn register_agent(&self, descriptor: &AgentDescriptor) {
        let replaced = match self.pools.entry(descriptor.id.clone()) {
            Entry::Occupied(existing) if existing.get().matches(descriptor) => return,
            Entry::Occupied(mut existing) => Some(existing.insert(self.new_pool(descriptor))),
            Entry::Vacant(slot) => {
                slot.insert(self.new_pool(descriptor));
                None
            }
        };

        if let Some(stale) = replaced {
            let handles = self.reset(&stale);
            tracing::info!(
                agent_id = %descriptor.id,
                closing = handles.len(),
                "Replaced connection pool with new connection settings"
            );
            if handles.is_empty() {
                return;
            }
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    for handle in handles {
                        handle.close().await;
                    }
                });
            }
        }
    }

    fn new_pool(&self, descriptor: &AgentDescriptor) -> Arc<AgentPool> {
        Arc::new(AgentPool {
            agent_id: Arc::from(descriptor.id.as_str()),
            endpoint: descriptor.connection.endpoint.clone(),
            protocol: descriptor.connection.protocol,
            max_size: descriptor.connection.max_pool_size,
            dial_timeout: Duration::from_millis(descriptor.config.timeout_ms),
            retry_attempts: descriptor.config.retry_attempts,
            state: Mutex::new(PoolState {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                ..PoolState::default()
            }),
        })
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.pools.contains_key(agent_id)
    }

    fn pool(&self, agent_id: &str) -> Result<Arc<AgentPool>> {
        self.pools
            .get(agent_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))
    }

    /// Borrows a connection to the agent, dialing a new one if none is idle.
    ///
    /// # Errors
    ///
    /// - `UnknownAgent` if the agent has no pool
    /// - `PoolExhausted` if every slot is leased or being dialed
    /// - `Connection` / `ConnectionTimeout` if the dial fails; the slot is not consumed
    pub async fn acquire(&self, agent_id: &str) -> Result<ConnectionHandle> {
        let pool = self.pool(agent_id)?;
        self.acquire_from(&pool).await
    }

    async fn acquire_from(&self, pool: &Arc<AgentPool>) -> Result<ConnectionHandle> {
        let reservation = {
            let mut state = pool.state.lock();
            if let Some(handle) = Self::take_idle(&mut state) {
                return Ok(handle);
            }
            if state.connections.len() + state.pending >= pool.max_size {
                return Err(MeshError::PoolExhausted {
                    agent_id: pool.agent_id.to_string(),
                    max: pool.max_size,
                });
            }
            state.pending += 1;
            Reservation {
                pool: pool.clone(),
                generation: state.generation,
            }
        };

        // Dial without holding the pool lock
        let conn = self.dial_with_retry(pool).await?;
        self.commit(reservation, conn).await
    }

    /// Pops the most recently returned open connection, discarding closed ones.
    fn take_idle(state: &mut PoolState) -> Option<ConnectionHandle> {
        while let Some(handle) = state.idle.pop() {
            if handle.is_open() {
                return Some(handle);
            }
            tracing::debug!(
                agent_id = %handle.agent_id(),
                connection_id = handle.id(),
                "Removing closed connection from pool"
            );
            let id = handle.id();
            state.connections.retain(|h| h.id() != id);
        }
        None
    }

    /// Borrows an already-open connection without dialing.
    pub fn try_acquire_idle(&self, agent_id: &str) -> Option<ConnectionHandle> {
        let pool = self.pool(agent_id).ok()?;
        let mut state = pool.state.lock();
        Self::take_idle(&mut state)
    }

    async fn dial_with_retry(&self, pool: &AgentPool) -> Result<Arc<dyn Connection>> {
        let factory = self
            .connectors
            .get(pool.protocol)
            .ok_or(MeshError::NoConnector(pool.protocol))?;

        let mut attempt = 0;
        let mut backoff_ms = self.config.initial_backoff_ms;
        loop {
            let dialed = tokio::time::timeout(
                pool.dial_timeout,
                factory.dial(&pool.endpoint, pool.protocol, pool.dial_timeout),
            )
            .await;

            let err = match dialed {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(DialError::Failed(cause))) => MeshError::Connection {
                    agent_id: pool.agent_id.to_string(),
                    protocol: pool.protocol,
                    cause,
                },
                Ok(Err(DialError::TimedOut(timeout_ms))) => MeshError::ConnectionTimeout {
                    agent_id: pool.agent_id.to_string(),
                    timeout_ms,
                },
                Err(_) => MeshError::ConnectionTimeout {
                    agent_id: pool.agent_id.to_string(),
                    timeout_ms: pool.dial_timeout.as_millis() as u64,
                },
            };

            if attempt >= pool.retry_attempts {
                return Err(err);
            }
            attempt += 1;
            tracing::warn!(
                agent_id = %pool.agent_id,
                attempt,
                "Dial failed: {}, retrying in {}ms",
                err,
                backoff_ms
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = self.config.next_backoff(backoff_ms);
        }
    }

    /// Turns a successful dial into a leased handle, unless the pool was drained or
    /// removed while the dial was in flight.
    async fn commit(
        &self,
        reservation: Reservation,
        conn: Arc<dyn Connection>,
    ) -> Result<ConnectionHandle> {
        let pool = reservation.pool.clone();
        let still_current = self
            .pools
            .get(pool.agent_id.as_ref())
            .map(|p| Arc::ptr_eq(p.value(), &pool))
            .unwrap_or(false);

        let handle = {
            let mut state = pool.state.lock();
            if !still_current || state.generation != reservation.generation {
                None
            } else {
                let handle = ConnectionHandle::new(
                    self.next_id.fetch_add(1, Ordering::Relaxed),
                    pool.agent_id.clone(),
                    pool.protocol,
                    self.clock.now_ms(),
                    state.generation,
                    conn.clone(),
                );
                state.connections.push(handle.clone());
                Some(handle)
            }
        };
        drop(reservation);

        match handle {
            Some(handle) => {
                tracing::debug!(
                    agent_id = %pool.agent_id,
                    connection_id = handle.id(),
                    protocol = %pool.protocol,
                    "Connection created"
                );
                self.events.emit(RegistryEvent::ConnectionCreated {
                    agent_id: pool.agent_id.to_string(),
                    connection_id: handle.id(),
                    protocol: pool.protocol,
                });
                Ok(handle)
            }
            None => {
                conn.close().await;
                Err(MeshError::Connection {
                    agent_id: pool.agent_id.to_string(),
                    protocol: pool.protocol,
                    cause: "pool drained while dialing".to_string(),
                })
            }
        }
    }

    /// Returns a borrowed connection to its pool.
    ///
    /// The connection stays open. Handles whose pool has since been drained or removed
    /// are closed instead, and handles found closed are dropped from the pool.
    pub async fn release(&self, handle: ConnectionHandle) {
        let Ok(pool) = self.pool(handle.agent_id()) else {
            handle.close().await;
            return;
        };

        let stale = {
            let mut state = pool.state.lock();
            let tracked = state.connections.iter().any(|h| h.id() == handle.id());
            if handle.generation() != state.generation || !tracked {
                true
            } else if !handle.is_open() {
                state.forget(handle.id());
                false
            } else {
                if !state.idle.iter().any(|h| h.id() == handle.id()) {
                    state.idle.push(handle.clone());
                }
                false
            }
        };

        if stale {
            handle.close().await;
        }
    }

    /// Closes and forgets one connection, e.g. after the remote side hung up.
    pub async fn evict(&self, handle: &ConnectionHandle) {
        if let Ok(pool) = self.pool(handle.agent_id()) {
            let mut state = pool.state.lock();
            if handle.generation() == state.generation {
                state.forget(handle.id());
            }
        }
        handle.close().await;
    }

    /// Closes every connection of the agent and resets its pool to empty.
    ///
    /// The pool stays registered; the next acquire dials afresh. Returns the number
    /// of connections closed.
    pub async fn drain(&self, agent_id: &str) -> usize {
        let Ok(pool) = self.pool(agent_id) else {
            return 0;
        };
        let handles = self.reset(&pool);
        let closed = handles.len();
        for handle in handles {
            handle.close().await;
        }
        if closed > 0 {
            tracing::info!(agent_id = %agent_id, closed, "Drained connection pool");
        }
        closed
    }

    fn reset(&self, pool: &AgentPool) -> Vec<ConnectionHandle> {
        let mut state = pool.state.lock();
        state.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        state.idle.clear();
        std::mem::take(&mut state.connections)
    }

    /// Drains the agent's pool and forgets it.
    pub async fn remove(&self, agent_id: &str) -> usize {
        let Some((_, pool)) = self.pools.remove(agent_id) else {
            return 0;
        };
        let handles = self.reset(&pool);
        let closed = handles.len();
        for handle in handles {
            handle.close().await;
        }
        closed
    }

    /// Removes every pool, closing all connections. Returns the number closed.
    pub async fn drain_all(&self) -> usize {
        let ids: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            closed += self.remove(&id).await;
        }
        closed
    }

    /// Makes sure the agent has at least one open connection and leaves it idle.
    ///
    /// Returns the warm connection so the caller can watch it for remote closure.
    pub async fn prewarm(&self, agent_id: &str) -> Result<ConnectionHandle> {
        let handle = self.acquire(agent_id).await?;
        self.release(handle.clone()).await;
        Ok(handle)
    }

    /// Whether the handle still belongs to its agent's live pool generation.
    ///
    /// False once the pool was drained or removed after the handle was created.
    pub fn is_current(&self, handle: &ConnectionHandle) -> bool {
        self.pools
            .get(handle.agent_id())
            .map(|p| p.value().state.lock().generation == handle.generation())
            .unwrap_or(false)
    }

    pub fn pool_load(&self, agent_id: &str) -> Option<PoolLoad> {
        let pool = self.pool(agent_id).ok()?;
        let state = pool.state.lock();
        Some(state.load(pool.max_size))
    }

    /// Live connections across all pools.
    pub fn open_connections(&self) -> usize {
        self.pools
            .iter()
            .map(|p| p.value().state.lock().connections.len())
            .sum()
    }

    pub fn agent_count(&self) -> usize {
        self.pools.len()
    }
}
