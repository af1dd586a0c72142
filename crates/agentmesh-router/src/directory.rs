use agentmesh_common::{AgentDescriptor, HealthState, HealthStatus, MeshError, Result, Stats};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Registered agent together with its mutable health and statistics.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub descriptor: Arc<AgentDescriptor>,
    pub health: HealthState,
    pub stats: Stats,
}

impl AgentEntry {
    fn new(descriptor: AgentDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            health: HealthState::default(),
            stats: Stats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// In-memory agent store with a capability index.
///
/// Both maps are sharded, so registrations of unrelated agents do not contend. Writes
/// always lock the agent entry before any capability bucket, which serializes
/// register and unregister of the same ID without a global lock.
///
/// Invariants:
/// - every bucket in the index is non-empty and only names registered agents
/// - an agent ID is either fully registered (entry plus all buckets) or absent
pub struct Directory {
    max_agents: usize,
    agents: DashMap<String, AgentEntry>,
    capabilities: DashMap<String, HashSet<String>>,
    /// Registered plus in-flight registrations; bounds the agent count
    reserved: AtomicUsize,
}

impl Directory {
    pub fn new(max_agents: usize) -> Self {
        Self {
            max_agents,
            agents: DashMap::new(),
            capabilities: DashMap::new(),
            reserved: AtomicUsize::new(0),
        }
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    /// Adds an agent with zero stats and `unknown` health.
    ///
    /// # Errors
    ///
    /// - `RegistryFull` if `max_agents` agents are already registered
    /// - `DuplicateAgent` if the ID is taken
    /// - `Config` if the descriptor is invalid
    ///
    /// The directory is unchanged on error.
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<Arc<AgentDescriptor>> {
        descriptor.validate()?;

        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_agents).then_some(n + 1)
            })
            .map_err(|_| MeshError::RegistryFull {
                max: self.max_agents,
            })?;

        match self.agents.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => {
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                Err(MeshError::DuplicateAgent(descriptor.id))
            }
            Entry::Vacant(vacant) => {
                let entry = AgentEntry::new(descriptor);
                for name in entry.descriptor.capability_names() {
                    self.capabilities
                        .entry(name.to_string())
                        .or_default()
                        .insert(entry.descriptor.id.clone());
                }
                let descriptor = entry.descriptor.clone();
                vacant.insert(entry);
                Ok(descriptor)
            }
        }
    }

    /// Removes an agent and every index entry naming it. Returns `None` if absent.
    pub fn unregister(&self, agent_id: &str) -> Option<AgentEntry> {
        let Entry::Occupied(occupied) = self.agents.entry(agent_id.to_string()) else {
            return None;
        };

        for name in occupied.get().descriptor.capability_names() {
            if let Some(mut bucket) = self.capabilities.get_mut(name) {
                bucket.remove(agent_id);
            }
            self.capabilities.remove_if(name, |_, bucket| bucket.is_empty());
        }

        let (_, entry) = occupied.remove_entry();
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    /// Agents holding every capability in `required`.
    ///
    /// An empty requirement matches every agent. Never fails; no match is an empty list.
    pub fn find_by_capabilities<S: AsRef<str>>(&self, required: &[S]) -> Vec<AgentEntry> {
        if required.is_empty() {
            return self.snapshot();
        }

        // Walk the smallest bucket and check the rest on the descriptor
        let ids: Vec<String> = {
            let mut smallest: Option<Vec<String>> = None;
            for name in required {
                let Some(bucket) = self.capabilities.get(name.as_ref()) else {
                    return Vec::new();
                };
                if smallest.as_ref().map_or(true, |s| bucket.len() < s.len()) {
                    smallest = Some(bucket.iter().cloned().collect());
                }
            }
            smallest.unwrap_or_default()
        };

        ids.iter()
            .filter_map(|id| self.agents.get(id).map(|e| e.value().clone()))
            .filter(|entry| entry.descriptor.has_all(required))
            .collect()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentEntry> {
        self.agents.get(agent_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn snapshot(&self) -> Vec<AgentEntry> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    /// Runs `f` on the agent's health state. Returns `None` if the agent is gone.
    pub fn update_health<R>(
        &self,
        agent_id: &str,
        f: impl FnOnce(&mut HealthState) -> R,
    ) -> Option<R> {
        self.agents
            .get_mut(agent_id)
            .map(|mut entry| f(&mut entry.health))
    }

    /// Folds one request outcome into the agent's stats and re-derives its success
    /// rate. Returns the updated stats.
    pub fn record_outcome(
        &self,
        agent_id: &str,
        success: bool,
        latency_ms: u64,
        at: u64,
    ) -> Option<Stats> {
        let mut entry = self.agents.get_mut(agent_id)?;
        let AgentEntry { health, stats, .. } = &mut *entry;
        stats.record(success, latency_ms, at);
        health.refresh_success_rate(stats);
        Some(stats.clone())
    }

    /// Number of registered agents per capability name.
    pub fn capability_coverage(&self) -> BTreeMap<String, usize> {
        self.capabilities
            .iter()
            .map(|bucket| (bucket.key().clone(), bucket.value().len()))
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<HealthStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.agents.iter() {
            *counts.entry(entry.health.status).or_insert(0) += 1;
        }
        counts
    }

    /// Drops every agent. Returns the IDs that were registered.
    pub fn clear(&self) -> Vec<String> {
        let ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.unregister(id);
        }
        ids
    }
}
