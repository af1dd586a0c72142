use agentmesh_common::Strategy;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a load balancer sees of each ready candidate, best-scored first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSample<'a> {
    pub agent_id: &'a str,
    /// Connections currently leased from the agent's pool
    pub active: usize,
}

/// Picks one of several ready candidates.
///
/// Implementations only choose an index; they never touch connections, so swapping
/// the balancer on a live router leaves in-flight requests alone.
pub trait LoadBalancer: Send + Sync {
    /// Index into `candidates`, or `None` when it is empty.
    fn select(&self, candidates: &[LoadSample<'_>]) -> Option<usize>;

    fn strategy(&self) -> Strategy;
}

/// Builds the balancer for a configured strategy.
pub fn for_strategy(strategy: Strategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        Strategy::RoundRobin => Arc::new(RoundRobin::new()),
        Strategy::LeastConnections => Arc::new(LeastConnections),
        Strategy::Random => Arc::new(RandomChoice),
    }
}

/// Round-robin over a shared cursor that wraps at the candidate count.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, candidates: &[LoadSample<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn strategy(&self) -> Strategy {
        Strategy::RoundRobin
    }
}

/// Fewest leased connections; ties go to the earlier (better-scored) candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastConnections;

impl LoadBalancer for LeastConnections {
    fn select(&self, candidates: &[LoadSample<'_>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, sample)| sample.active)
            .map(|(index, _)| index)
    }

    fn strategy(&self) -> Strategy {
        Strategy::LeastConnections
    }
}

/// Uniformly random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomChoice;

impl LoadBalancer for RandomChoice {
    fn select(&self, candidates: &[LoadSample<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Random
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(active: &[usize]) -> Vec<LoadSample<'static>> {
        const IDS: [&str; 5] = ["a", "b", "c", "d", "e"];
        active
            .iter()
            .enumerate()
            .map(|(i, &active)| LoadSample {
                agent_id: IDS[i],
                active,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_wraps() {
        let lb = RoundRobin::new();
        let candidates = samples(&[0, 0, 0]);
        let picks: Vec<_> = (0..4).filter_map(|_| lb.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_single_candidate() {
        let lb = RoundRobin::new();
        let candidates = samples(&[3]);
        assert_eq!(lb.select(&candidates), Some(0));
        assert_eq!(lb.select(&candidates), Some(0));
    }

    #[test]
    fn test_empty_candidates_return_none() {
        for strategy in [Strategy::RoundRobin, Strategy::LeastConnections, Strategy::Random] {
            let lb = for_strategy(strategy);
            assert_eq!(lb.select(&[]), None);
            assert_eq!(lb.strategy(), strategy);
        }
    }

    #[test]
    fn test_least_connections_prefers_idle_then_position() {
        let lb = LeastConnections;
        assert_eq!(lb.select(&samples(&[3, 1, 2])), Some(1));
        assert_eq!(lb.select(&samples(&[2, 0, 0])), Some(1));
        assert_eq!(lb.select(&samples(&[0, 0])), Some(0));
    }

    #[test]
    fn test_random_stays_in_range_and_covers_all() {
        let lb = RandomChoice;
        let candidates = samples(&[0, 0, 0]);
        let mut seen = [false; 3];
        for _ in 0..300 {
            let index = lb.select(&candidates).unwrap();
            seen[index] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_round_robin_is_shared_across_threads() {
        let lb = Arc::new(RoundRobin::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                std::thread::spawn(move || {
                    let candidates = samples(&[0, 0]);
                    (0..250).filter_map(|_| lb.select(&candidates)).sum::<usize>()
                })
            })
            .collect();
        let ones: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 1000 picks over two candidates alternate exactly
        assert_eq!(ones, 500);
    }
}
