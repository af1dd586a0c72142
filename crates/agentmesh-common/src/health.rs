use serde::{Deserialize, Serialize};

/// Success rate assumed for an agent that has not served any request yet.
pub const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

/// Liveness classification of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Result of one liveness probe, already classified by the health policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy { latency_ms: u64 },
    /// Probe answered, but past a soft latency or success-rate threshold
    Degraded { latency_ms: u64 },
    Failed { reason: String },
}

/// Mutable health of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    /// Clock milliseconds of the most recent applied probe
    pub last_checked_at: Option<u64>,
    pub latency_ms: u64,
    pub success_rate: f64,
    /// Set when the agent entered `Unhealthy`, cleared when it leaves it
    pub unhealthy_since: Option<u64>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked_at: None,
            latency_ms: 0,
            success_rate: NEUTRAL_SUCCESS_RATE,
            unhealthy_since: None,
        }
    }
}

impl HealthState {
    /// Applies a probe result taken at `checked_at`.
    ///
    /// Results older than the last applied probe are dropped so that
    /// `last_checked_at` only moves forward. Returns whether the result was applied.
    pub fn apply_probe(&mut self, checked_at: u64, outcome: &ProbeOutcome) -> bool {
        if matches!(self.last_checked_at, Some(last) if checked_at < last) {
            return false;
        }
        self.last_checked_at = Some(checked_at);

        match outcome {
            ProbeOutcome::Healthy { latency_ms } => {
                self.latency_ms = *latency_ms;
                self.set_status(HealthStatus::Healthy, checked_at);
            }
            ProbeOutcome::Degraded { latency_ms } => {
                self.latency_ms = *latency_ms;
                self.set_status(HealthStatus::Degraded, checked_at);
            }
            ProbeOutcome::Failed { .. } => {
                self.set_status(HealthStatus::Unhealthy, checked_at);
            }
        }
        true
    }

    /// Moves to `status`, keeping `unhealthy_since` in step.
    pub fn set_status(&mut self, status: HealthStatus, at: u64) {
        match (self.status, status) {
            (HealthStatus::Unhealthy, HealthStatus::Unhealthy) => {}
            (_, HealthStatus::Unhealthy) => self.unhealthy_since = Some(at),
            _ => self.unhealthy_since = None,
        }
        self.status = status;
    }

    /// How long the agent has been unhealthy as of `now`, if it is.
    pub fn unhealthy_for(&self, now: u64) -> Option<u64> {
        self.unhealthy_since.map(|since| now.saturating_sub(since))
    }

    pub fn refresh_success_rate(&mut self, stats: &Stats) {
        self.success_rate = stats.success_rate();
    }
}

/// Request outcome statistics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub average_latency_ms: f64,
    pub last_used_at: Option<u64>,
}

impl Stats {
    /// Folds one request outcome into the counters and the running latency mean.
    pub fn record(&mut self, success: bool, latency_ms: u64, at: u64) {
        self.total_requests = self.total_requests.saturating_add(1);
        if success {
            self.successful_requests = self.successful_requests.saturating_add(1);
        }
        let n = self.total_requests as f64;
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / n;
        self.last_used_at = Some(at);
    }

    /// Success rate smoothed towards the neutral prior.
    ///
    /// Computed as `(successes + 1) / (total + 2)`, which is exactly
    /// [`NEUTRAL_SUCCESS_RATE`] before any request and converges to the raw ratio.
    pub fn success_rate(&self) -> f64 {
        (self.successful_requests as f64 + 1.0) / (self.total_requests as f64 + 2.0)
    }

    /// Latency the scorer should use: observed request latency once there is any.
    pub fn observed_latency_ms(&self) -> Option<f64> {
        (self.total_requests > 0).then_some(self.average_latency_ms)
    }
}
