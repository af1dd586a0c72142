use agentmesh_common::{ConnectionHandle, MassConnectConfig, MeshError, Result};
use agentmesh_pool::PoolManager;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::scheduler::ShutdownSignal;

/// Outcome of one [`MassConnector::connect_all`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MassConnectReport {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
    /// Shutdown stopped the run before every batch was attempted
    pub cancelled: bool,
}

/// Pre-warms pools for a large fleet in fixed-size batches.
///
/// Within a batch every agent is dialed concurrently and the whole batch settles
/// before the next one starts; failures are counted and logged, never propagated.
/// With auto-reconnect enabled a warm connection of each agent is watched, and a remote
/// close schedules a fresh dial after a fixed backoff. An agent has at most one watcher
/// per pool generation, however many runs pre-warmed it.
pub struct MassConnector {
    directory: Arc<Directory>,
    pools: Arc<PoolManager>,
    config: MassConnectConfig,
    signal: ShutdownSignal,
    failed_connections: AtomicU64,
    watchers: DashMap<String, Watcher>,
    next_watcher: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Watcher {
    token: u64,
    generation: u64,
}

impl MassConnector {
    pub fn new(
        directory: Arc<Directory>,
        pools: Arc<PoolManager>,
        config: MassConnectConfig,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            directory,
            pools,
            config,
            signal,
            failed_connections: AtomicU64::new(0),
            watchers: DashMap::new(),
            next_watcher: AtomicU64::new(1),
        }
    }

    /// Connection attempts that failed or timed out since startup, reconnects included.
    pub fn failed_connections(&self) -> u64 {
        self.failed_connections.load(Ordering::Relaxed)
    }

    /// Connects every listed agent, batch by batch, in the given order.
    pub async fn connect_all(self: &Arc<Self>, agent_ids: &[String]) -> MassConnectReport {
        let mut report = MassConnectReport::default();
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[String]> = agent_ids.chunks(batch_size).collect();
        let total = batches.len();

        info!(
            agents = agent_ids.len(),
            batches = total,
            batch_size,
            "Starting mass connect"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            if self.signal.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let results = join_all(batch.iter().map(|id| self.connect_one(id))).await;
            report.attempted += results.len();
            for result in results {
                match result {
                    Ok(()) => report.connected += 1,
                    Err(_) => report.failed += 1,
                }
            }
            debug!(
                batch = index + 1,
                of = total,
                connected = report.connected,
                failed = report.failed,
                "Batch settled"
            );

            if index + 1 < total && !self.pause_between_batches().await {
                report.cancelled = true;
                break;
            }
        }

        info!(
            attempted = report.attempted,
            connected = report.connected,
            failed = report.failed,
            cancelled = report.cancelled,
            "Mass connect finished"
        );
        report
    }

    /// Sleeps the inter-batch delay. Returns `false` if shutdown interrupted it.
    async fn pause_between_batches(&self) -> bool {
        let mut signal = self.signal.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.config.batch_delay()) => true,
            _ = signal.cancelled() => false,
        }
    }

    async fn connect_one(self: &Arc<Self>, agent_id: &str) -> Result<()> {
        let handle = self.attempt(agent_id).await?;
        if self.config.auto_reconnect {
            self.watch(handle);
        }
        Ok(())
    }

    /// One pre-warm attempt under the per-attempt timeout. Failures are counted.
    async fn attempt(&self, agent_id: &str) -> Result<ConnectionHandle> {
        let timeout = self.config.attempt_timeout();
        let result = match tokio::time::timeout(timeout, self.pools.prewarm(agent_id)).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::ConnectionTimeout {
                agent_id: agent_id.to_string(),
                timeout_ms: self.config.attempt_timeout_ms,
            }),
        };

        if let Err(e) = &result {
            self.failed_connections.fetch_add(1, Ordering::Relaxed);
            warn!(agent_id = %agent_id, "Connection attempt failed: {}", e);
        }
        result
    }

    /// Registers a watcher for the handle's agent unless one already covers its pool
    /// generation. Returns the new watcher's token.
    fn claim_watch(&self, handle: &ConnectionHandle) -> Option<u64> {
        let watcher = Watcher {
            token: self.next_watcher.fetch_add(1, Ordering::Relaxed),
            generation: handle.generation(),
        };
        match self.watchers.entry(handle.agent_id().to_string()) {
            Entry::Occupied(mut slot) if slot.get().generation < watcher.generation => {
                slot.insert(watcher);
            }
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(watcher);
            }
        }
        Some(watcher.token)
    }

    /// Reconnects after the remote side closes `handle`.
    ///
    /// The watcher stops on shutdown, when the agent is unregistered, when the pool
    /// was drained (local closes move the pool to a new generation) or when the
    /// reconnect fails.
    fn watch(self: &Arc<Self>, handle: ConnectionHandle) {
        let Some(token) = self.claim_watch(&handle) else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let agent_id = handle.agent_id().to_string();
            this.follow(handle, token).await;
            this.watchers.remove_if(&agent_id, |_, w| w.token == token);
            debug!(agent_id = %agent_id, "Reconnect watcher stopped");
        });
    }

    async fn follow(&self, mut handle: ConnectionHandle, token: u64) {
        let mut signal = self.signal.clone();
        loop {
            tokio::select! {
                _ = handle.closed() => {}
                _ = signal.cancelled() => return,
            }
            if !self.pools.is_current(&handle) {
                return;
            }
            self.pools.evict(&handle).await;

            let agent_id = handle.agent_id().to_string();
            info!(
                agent_id = %agent_id,
                "Connection closed by remote, reconnecting in {}ms",
                self.config.reconnect_backoff_ms
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_backoff()) => {}
                _ = signal.cancelled() => return,
            }
            if !self.directory.contains(&agent_id) {
                return;
            }

            let Ok(fresh) = self.attempt(&agent_id).await else {
                return;
            };
            info!(agent_id = %agent_id, "Reconnected");
            match self.watchers.get_mut(&agent_id) {
                Some(mut w) if w.token == token => w.generation = fresh.generation(),
                // Another watcher took over this agent
                _ => return,
            }
            handle = fresh;
        }
    }
}
