// Copyright 2025 agentmesh Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use agentmesh_common::HealthStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent counts per health status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn from_map(counts: &BTreeMap<HealthStatus, usize>) -> Self {
        let get = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            healthy: get(HealthStatus::Healthy),
            degraded: get(HealthStatus::Degraded),
            unhealthy: get(HealthStatus::Unhealthy),
            unknown: get(HealthStatus::Unknown),
        }
    }
}

/// Point-in-time router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub status_counts: StatusCounts,
    /// Open connections across all pools, idle or leased
    pub active_connections: usize,
    /// Registered agents per capability name
    pub capability_coverage: BTreeMap<String, usize>,
    /// Failed mass-connect and reconnect attempts since startup
    pub failed_connections: u64,
}

impl RouterStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counts_from_map() {
        let mut map = BTreeMap::new();
        map.insert(HealthStatus::Healthy, 3);
        map.insert(HealthStatus::Unknown, 1);

        let counts = StatusCounts::from_map(&map);
        assert_eq!(counts.healthy, 3);
        assert_eq!(counts.degraded, 0);
        assert_eq!(counts.unknown, 1);
    }

    #[test]
    fn test_stats_serialization() {
        let mut coverage = BTreeMap::new();
        coverage.insert("git".to_string(), 2);
        let stats = RouterStats {
            total_agents: 2,
            healthy_agents: 1,
            status_counts: StatusCounts {
                healthy: 1,
                unknown: 1,
                ..StatusCounts::default()
            },
            active_connections: 4,
            capability_coverage: coverage,
            failed_connections: 1,
        };

        let json = stats.to_json();
        assert_eq!(json["total_agents"], 2);
        assert_eq!(json["healthy_agents"], 1);
        assert_eq!(json["status_counts"]["unknown"], 1);
        assert_eq!(json["capability_coverage"]["git"], 2);
        assert_eq!(json["failed_connections"], 1);

        let parsed: RouterStats = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, stats);
    }
}
