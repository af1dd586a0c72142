use agentmesh_common::{
    Clock, ConnectorSet, EventSink, HealthConfig, HealthStatus, ProbeOutcome, RegistryEvent,
};
use agentmesh_pool::PoolManager;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::{AgentEntry, Directory};
use crate::scheduler::{ShutdownSignal, Ticker};

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Agents that were due and got probed
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Agents whose pools were drained after staying unhealthy past the grace period
    pub drained: usize,
}

/// Periodic, staggered liveness prober.
///
/// Each sweep only probes agents whose last check is older than half the sweep
/// interval (or that were never checked), so agents registered at different times
/// spread their probes over successive sweeps. In-flight probes are capped by
/// `max_concurrent_probes`.
///
/// Probe failures never escape a sweep: every outcome becomes a health update, an
/// `agent.health.checked` event and, for failures, a warning.
pub struct HealthMonitor {
    directory: Arc<Directory>,
    pools: Arc<PoolManager>,
    connectors: ConnectorSet,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        directory: Arc<Directory>,
        pools: Arc<PoolManager>,
        connectors: ConnectorSet,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: HealthConfig,
    ) -> Self {
        Self {
            directory,
            pools,
            connectors,
            clock,
            events,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Starts the sweep loop; it runs until `signal` fires.
    pub fn spawn(self: Arc<Self>, signal: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(signal).await;
        })
    }

    async fn run(&self, signal: ShutdownSignal) {
        info!(
            interval_ms = self.config.interval_ms,
            "Health monitor started"
        );
        let mut ticker = Ticker::new(self.config.interval(), signal);
        while ticker.tick().await {
            let report = self.sweep_once().await;
            if report.probed > 0 {
                debug!(
                    probed = report.probed,
                    healthy = report.healthy,
                    degraded = report.degraded,
                    unhealthy = report.unhealthy,
                    drained = report.drained,
                    "Health sweep completed"
                );
            }
        }
        info!("Health monitor stopped");
    }

    fn is_due(&self, entry: &AgentEntry, now: u64) -> bool {
        match entry.health.last_checked_at {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.config.interval_ms / 2,
        }
    }

    /// Probes every due agent once and applies the results.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let due: Vec<AgentEntry> = self
            .directory
            .snapshot()
            .into_iter()
            .filter(|entry| self.is_due(entry, now))
            .collect();

        let mut report = SweepReport {
            probed: due.len(),
            ..SweepReport::default()
        };

        let outcomes: Vec<(String, u64, ProbeOutcome)> = stream::iter(due)
            .map(|entry| async move {
                let checked_at = self.clock.now_ms();
                let outcome = self.probe(&entry).await;
                (entry.descriptor.id.clone(), checked_at, outcome)
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await;

        for (agent_id, checked_at, outcome) in outcomes {
            match &outcome {
                ProbeOutcome::Healthy { .. } => report.healthy += 1,
                ProbeOutcome::Degraded { .. } => report.degraded += 1,
                ProbeOutcome::Failed { .. } => report.unhealthy += 1,
            }
            self.apply(&agent_id, checked_at, &outcome);
        }

        report.drained = self.drain_expired().await;
        report
    }

    /// Probes one agent through its protocol's connection factory, with a timeout.
    async fn probe(&self, entry: &AgentEntry) -> ProbeOutcome {
        let connection = &entry.descriptor.connection;
        let Some(factory) = self.connectors.get(connection.protocol) else {
            return ProbeOutcome::Failed {
                reason: format!("no connector for protocol {}", connection.protocol),
            };
        };

        let timeout = self.config.probe_timeout();
        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(
            timeout,
            factory.probe(&connection.endpoint, connection.protocol, timeout),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(())) => self.classify(entry, latency_ms),
            Ok(Err(e)) => ProbeOutcome::Failed {
                reason: e.to_string(),
            },
            Err(_) => ProbeOutcome::Failed {
                reason: format!("probe timed out after {}ms", self.config.probe_timeout_ms),
            },
        }
    }

    /// Applies the optional soft thresholds to a successful probe.
    fn classify(&self, entry: &AgentEntry, latency_ms: u64) -> ProbeOutcome {
        let slow = self
            .config
            .degraded_latency_ms
            .is_some_and(|limit| latency_ms > limit);
        let unreliable = self
            .config
            .degraded_success_rate
            .is_some_and(|floor| entry.health.success_rate < floor);

        if slow || unreliable {
            ProbeOutcome::Degraded { latency_ms }
        } else {
            ProbeOutcome::Healthy { latency_ms }
        }
    }

    fn apply(&self, agent_id: &str, checked_at: u64, outcome: &ProbeOutcome) {
        let applied = self.directory.update_health(agent_id, |health| {
            health
                .apply_probe(checked_at, outcome)
                .then(|| (health.status, health.latency_ms))
        });

        // Agent unregistered mid-probe, or a newer result already landed
        let Some(Some((status, latency_ms))) = applied else {
            return;
        };

        if let ProbeOutcome::Failed { reason } = outcome {
            warn!(agent_id = %agent_id, "Health probe failed: {}", reason);
        }

        self.events.emit(RegistryEvent::AgentHealthChecked {
            agent_id: agent_id.to_string(),
            status,
            latency_ms,
            checked_at,
        });
    }

    /// Drains pools of agents that stayed unhealthy longer than the grace period.
    async fn drain_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .directory
            .snapshot()
            .into_iter()
            .filter(|entry| entry.health.status == HealthStatus::Unhealthy)
            .filter(|entry| {
                entry
                    .health
                    .unhealthy_for(now)
                    .is_some_and(|elapsed| elapsed > self.config.unhealthy_grace_ms)
            })
            .map(|entry| entry.descriptor.id.clone())
            .collect();

        let mut drained = 0;
        for agent_id in expired {
            let has_connections = self
                .pools
                .pool_load(&agent_id)
                .is_some_and(|load| load.active > 0);
            if has_connections {
                let closed = self.pools.drain(&agent_id).await;
                warn!(
                    agent_id = %agent_id,
                    closed,
                    "Agent unhealthy past grace period, drained its pool"
                );
                drained += 1;
            }
        }
        drained
    }
}
