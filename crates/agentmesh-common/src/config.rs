use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::descriptor::AgentDescriptor;
use crate::error::{MeshError, Result};

/// Load-balancing strategy used among the top-ranked candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

impl std::str::FromStr for Strategy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "random" => Ok(Strategy::Random),
            other => Err(MeshError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

/// Health sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Sweep interval `T`; agents checked within `T/2` are skipped
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// How long an agent may stay unhealthy before its pool is drained
    pub unhealthy_grace_ms: u64,
    pub max_concurrent_probes: usize,
    /// Probe latency above which a live agent is reported degraded
    pub degraded_latency_ms: Option<u64>,
    /// Success rate below which a live agent is reported degraded
    pub degraded_success_rate: Option<f64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            unhealthy_grace_ms: 30_000,
            max_concurrent_probes: 256,
            degraded_latency_ms: None,
            degraded_success_rate: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Bulk connection establishment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MassConnectConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub auto_reconnect: bool,
}

impl Default for MassConnectConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay_ms: 100,
            attempt_timeout_ms: 10_000,
            reconnect_backoff_ms: 5_000,
            auto_reconnect: true,
        }
    }
}

impl MassConnectConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_agents: usize,
    /// How many of the best-scoring agents the load balancer chooses among
    pub top_k: usize,
    pub strategy: Strategy,
    pub health: HealthConfig,
    pub mass_connect: MassConnectConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_agents: 5_000,
            top_k: 1,
            strategy: Strategy::RoundRobin,
            health: HealthConfig::default(),
            mass_connect: MassConnectConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Applies `AGENTMESH_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with a custom lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("AGENTMESH_MAX_AGENTS") {
            self.max_agents = parse_number("AGENTMESH_MAX_AGENTS", &value)?;
        }
        if let Some(value) = lookup("AGENTMESH_TOP_K") {
            self.top_k = parse_number("AGENTMESH_TOP_K", &value)?;
        }
        if let Some(value) = lookup("AGENTMESH_HEALTH_INTERVAL_MS") {
            self.health.interval_ms = parse_number("AGENTMESH_HEALTH_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("AGENTMESH_BATCH_SIZE") {
            self.mass_connect.batch_size = parse_number("AGENTMESH_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("AGENTMESH_STRATEGY") {
            self.strategy = value.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(MeshError::Config("max_agents must be at least 1".to_string()));
        }
        if self.top_k == 0 {
            return Err(MeshError::Config("top_k must be at least 1".to_string()));
        }
        if self.health.interval_ms == 0 {
            return Err(MeshError::Config(
                "health.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.health.max_concurrent_probes == 0 {
            return Err(MeshError::Config(
                "health.max_concurrent_probes must be at least 1".to_string(),
            ));
        }
        if self.mass_connect.batch_size == 0 {
            return Err(MeshError::Config(
                "mass_connect.batch_size must be at least 1".to_string(),
            ));
        }
        if let Some(rate) = self.health.degraded_success_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(MeshError::Config(format!(
                    "health.degraded_success_rate must be within [0, 1], got {}",
                    rate
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MeshError::Config(format!("{} must be a number, got '{}'", key, value)))
}

/// A fleet definition: router settings plus the agents to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

impl FleetFile {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let fleet: FleetFile = serde_json::from_str(json)?;
        fleet.router.validate()?;
        for agent in &fleet.agents {
            agent.validate()?;
        }
        Ok(fleet)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|e| match e {
            MeshError::JsonSerialization(err) => {
                MeshError::Config(format!("{}: {}", path.display(), err))
            }
            other => other,
        })
    }
}
