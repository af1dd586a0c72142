//! Candidate ranking.
//!
//! A score is the sum of four components with a fixed ceiling of 100:
//!
//! | Component    | Range  | Source                                            |
//! |--------------|--------|---------------------------------------------------|
//! | Health       | 0..40  | healthy 40, degraded 20, unhealthy 5, unknown 0   |
//! | Latency      | 0..30  | `max(0, 30 - latency_ms / 100)`                   |
//! | Success rate | 0..20  | `success_rate * 20`                               |
//! | Load         | 0..10  | `max(0, 10 - leased / max_pool_size * 10)`        |

use agentmesh_common::{AgentDescriptor, HealthState, HealthStatus, Stats};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::directory::AgentEntry;

pub const MAX_SCORE: f64 = 100.0;

/// Everything the scorer looks at for one agent.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub descriptor: Arc<AgentDescriptor>,
    pub health: HealthState,
    pub stats: Stats,
    /// Connections currently leased from the agent's pool
    pub active_connections: usize,
}

impl Candidate {
    pub fn new(entry: AgentEntry, active_connections: usize) -> Self {
        Self {
            descriptor: entry.descriptor,
            health: entry.health,
            stats: entry.stats,
            active_connections,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Observed request latency once the agent has served traffic, probe latency before.
    pub fn latency_ms(&self) -> f64 {
        self.stats
            .observed_latency_ms()
            .unwrap_or(self.health.latency_ms as f64)
    }
}

/// A candidate with its computed score.
#[derive(Debug, Clone)]
pub struct Scored {
    pub candidate: Candidate,
    pub score: f64,
}

fn health_component(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 40.0,
        HealthStatus::Degraded => 20.0,
        HealthStatus::Unhealthy => 5.0,
        HealthStatus::Unknown => 0.0,
    }
}

fn latency_component(latency_ms: f64) -> f64 {
    (30.0 - latency_ms / 100.0).max(0.0)
}

fn success_component(success_rate: f64) -> f64 {
    success_rate.clamp(0.0, 1.0) * 20.0
}

fn load_component(active: usize, max_pool_size: usize) -> f64 {
    if max_pool_size == 0 {
        return 0.0;
    }
    (10.0 - (active as f64 / max_pool_size as f64) * 10.0).max(0.0)
}

/// Scores one candidate. Deterministic and side-effect free.
pub fn score(candidate: &Candidate) -> f64 {
    health_component(candidate.health.status)
        + latency_component(candidate.latency_ms())
        + success_component(candidate.health.success_rate)
        + load_component(
            candidate.active_connections,
            candidate.descriptor.connection.max_pool_size,
        )
}

/// Best first: score descending, then priority descending, then ID ascending.
fn compare(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| {
            b.candidate
                .descriptor
                .priority
                .cmp(&a.candidate.descriptor.priority)
        })
        .then_with(|| a.candidate.id().cmp(b.candidate.id()))
}

/// Drops candidates lacking any of `required`, then scores and sorts the rest.
pub fn rank<S: AsRef<str>>(candidates: Vec<Candidate>, required: &[S]) -> Vec<Scored> {
    let mut scored: Vec<Scored> = candidates
        .into_iter()
        .filter(|c| c.descriptor.has_all(required))
        .map(|candidate| Scored {
            score: score(&candidate),
            candidate,
        })
        .collect();
    scored.sort_by(compare);
    scored
}
