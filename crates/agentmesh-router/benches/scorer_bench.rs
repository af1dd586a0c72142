// Criterion benchmarks for agentmesh-router
//
// Run benchmarks with:
//   cargo bench -p agentmesh-router
//
// For detailed output with plots:
//   cargo bench -p agentmesh-router -- --save-baseline main

use agentmesh_common::{AgentDescriptor, HealthState, HealthStatus, Protocol, Stats};
use agentmesh_router::load_balancer::{LeastConnections, LoadBalancer, LoadSample, RoundRobin};
use agentmesh_router::scorer::{self, Candidate};
use agentmesh_router::Directory;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| {
            let descriptor = AgentDescriptor::new(format!("agent-{}", i), "h:1", Protocol::Rpc)
                .with_capability("git", "1")
                .with_priority((i % 3) as i32);
            let status = match i % 4 {
                0 => HealthStatus::Healthy,
                1 => HealthStatus::Degraded,
                2 => HealthStatus::Unhealthy,
                _ => HealthStatus::Unknown,
            };
            Candidate {
                descriptor: Arc::new(descriptor),
                health: HealthState {
                    status,
                    latency_ms: (i as u64 * 37) % 4_000,
                    ..HealthState::default()
                },
                stats: Stats::default(),
                active_connections: i % 4,
            }
        })
        .collect()
}

fn bench_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("rank");

    for count in [10, 100, 1_000, 5_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let input = candidates(count);
            b.iter(|| scorer::rank(black_box(input.clone()), &["git"]));
        });
    }

    group.finish();
}

fn bench_find_by_capabilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_by_capabilities");

    for count in [100, 1_000, 5_000].iter() {
        let directory = Directory::new(*count);
        for i in 0..*count {
            let mut descriptor =
                AgentDescriptor::new(format!("agent-{}", i), "h:1", Protocol::Http)
                    .with_capability("base", "1");
            if i % 10 == 0 {
                descriptor = descriptor.with_capability("gpu", "1");
            }
            // Directory sized to fit exactly
            let _ = directory.register(descriptor);
        }

        group.bench_with_input(BenchmarkId::new("rare", count), &directory, |b, dir| {
            b.iter(|| dir.find_by_capabilities(black_box(&["base", "gpu"])));
        });
        group.bench_with_input(BenchmarkId::new("common", count), &directory, |b, dir| {
            b.iter(|| dir.find_by_capabilities(black_box(&["base"])));
        });
    }

    group.finish();
}

fn bench_load_balancer_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer_select");
    let ids: Vec<String> = (0..8).map(|i| format!("agent-{}", i)).collect();
    let samples: Vec<LoadSample<'_>> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| LoadSample {
            agent_id: id,
            active: (i * 7) % 5,
        })
        .collect();

    group.bench_function("round_robin", |b| {
        let lb = RoundRobin::new();
        b.iter(|| lb.select(black_box(&samples)));
    });
    group.bench_function("least_connections", |b| {
        let lb = LeastConnections;
        b.iter(|| lb.select(black_box(&samples)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_rank,
    bench_find_by_capabilities,
    bench_load_balancer_select
);
criterion_main!(benches);
