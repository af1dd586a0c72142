//! Router integration tests
//!
//! Drives the public `Router` API end to end against the in-memory `MockConnector`.

use agentmesh_common::transport::{MockBehavior, MockConnector};
use agentmesh_common::{
    AgentDescriptor, ChannelEventSink, ConnectorSet, HealthStatus, ManualClock, MeshError,
    NoAgentReason, NoopEventSink, Protocol, RegistryEvent, RouterConfig, Strategy,
};
use agentmesh_router::{BroadcastFilter, Router};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn router(config: RouterConfig) -> (Router, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::new());
    let router = Router::with_parts(
        config,
        ConnectorSet::uniform(connector.clone()),
        Arc::new(ManualClock::new(10_000)),
        Arc::new(NoopEventSink),
    )
    .unwrap();
    (router, connector)
}

fn agent(id: &str, caps: &[&str]) -> AgentDescriptor {
    caps.iter().fold(
        AgentDescriptor::new(id, format!("{}.local:7000", id), Protocol::Rpc),
        |d, cap| d.with_capability(*cap, "1.0"),
    )
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_registry_full_leaves_state_unchanged() {
    let config = RouterConfig {
        max_agents: 2,
        ..RouterConfig::default()
    };
    let (router, _) = router(config);
    router.register(agent("a1", &["git"])).unwrap();
    router.register(agent("a2", &["http"])).unwrap();
    let before = router.stats();

    let err = router.register(agent("a3", &["docker"])).unwrap_err();
    assert!(matches!(err, MeshError::RegistryFull { max: 2 }));
    assert_eq!(router.stats(), before);
    assert!(router.agent("a3").is_none());
}

#[tokio::test]
async fn test_duplicate_registration_fails() {
    let (router, _) = router(RouterConfig::default());
    router.register(agent("a1", &["git"])).unwrap();
    assert!(matches!(
        router.register(agent("a1", &["git"])),
        Err(MeshError::DuplicateAgent(_))
    ));
    assert_eq!(router.agent_count(), 1);
}

#[tokio::test]
async fn test_unregister_is_idempotent_and_closes_connections() {
    let (router, connector) = router(RouterConfig::default());
    router.register(agent("a1", &["git", "http"])).unwrap();
    let handle = router.resolve(&["git"], None).await.unwrap();

    assert!(router.unregister("a1").await);
    assert!(!router.unregister("a1").await);
    assert!(!router.unregister("nobody").await);

    assert!(!handle.is_open());
    assert_eq!(connector.connections("a1.local:7000").len(), 1);
    let stats = router.stats();
    assert_eq!(stats.total_agents, 0);
    assert!(stats.capability_coverage.is_empty());

    // Returning a handle after unregister just closes it
    router.release(handle).await;
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_capability_and_matching() {
    let (router, _) = router(RouterConfig::default());
    router.register(agent("a1", &["git"])).unwrap();
    router.register(agent("a2", &["git", "http"])).unwrap();

    let handle = router.resolve(&["git", "http"], None).await.unwrap();
    assert_eq!(handle.agent_id(), "a2");
    router.release(handle).await;

    let err = router.resolve(&["git", "docker"], None).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::NoAvailableAgent(NoAgentReason::NoMatch(_))
    ));
}

#[tokio::test]
async fn test_pool_bound_then_fall_through() {
    let (router, _) = router(RouterConfig::default());
    router
        .register(agent("a1", &["git"]).with_max_pool_size(2).with_priority(10))
        .unwrap();
    router
        .register(agent("a2", &["git"]).with_max_pool_size(1))
        .unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(router.resolve(&["git"], None).await.unwrap());
    }
    let mut agents: Vec<&str> = held.iter().map(|h| h.agent_id()).collect();
    agents.sort();
    assert_eq!(agents, vec!["a1", "a1", "a2"]);

    // Every pool is at its bound
    let err = router.resolve(&["git"], None).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::NoAvailableAgent(NoAgentReason::Exhausted { tried: 2 })
    ));

    let freed = held.pop().unwrap();
    let freed_agent = freed.agent_id().to_string();
    router.release(freed).await;
    let again = router.resolve(&["git"], None).await.unwrap();
    assert_eq!(again.agent_id(), freed_agent);
}

#[tokio::test]
async fn test_degraded_agent_wins_once_healthy_one_fails() {
    let (router, _) = router(RouterConfig::default());
    router.register(agent("a1", &["git"])).unwrap();
    router.register(agent("a2", &["git", "http"])).unwrap();

    router.sweep_health().await;
    router.mark_degraded("a1").unwrap();
    assert_eq!(router.agent("a2").unwrap().health.status, HealthStatus::Healthy);

    let first = router.resolve(&["git"], None).await.unwrap();
    assert_eq!(first.agent_id(), "a2");
    router.release(first).await;

    loop {
        let stats = router.record_outcome("a2", false, 5_000).unwrap();
        if stats.success_rate() < 0.3 {
            break;
        }
    }
    assert!(router.agent("a2").unwrap().health.success_rate < 0.3);

    let second = router.resolve(&["git"], None).await.unwrap();
    assert_eq!(second.agent_id(), "a1");
}

#[tokio::test]
async fn test_least_connections_prefers_idle_agent() {
    let config = RouterConfig {
        top_k: 3,
        strategy: Strategy::LeastConnections,
        ..RouterConfig::default()
    };
    let (router, _) = router(config);
    for id in ["a1", "a2", "a3"] {
        router
            .register(agent(id, &["git"]).with_max_pool_size(10))
            .unwrap();
    }

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(router.resolve(&["git"], None).await.unwrap());
    }
    let mut agents: Vec<String> = held.iter().map(|h| h.agent_id().to_string()).collect();
    agents.sort();
    assert_eq!(agents, vec!["a1", "a2", "a3"]);
}

#[tokio::test]
async fn test_deadline_exceeded_during_slow_dial() {
    tokio::time::pause();
    let (router, connector) = router(RouterConfig::default());
    router.register(agent("a1", &["git"])).unwrap();
    connector.set_behavior(
        "a1.local:7000",
        MockBehavior::Delay(Duration::from_millis(500)),
    );

    let err = router
        .resolve_within(&["git"], Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MeshError::NoAvailableAgent(NoAgentReason::DeadlineExceeded)
    ));

    // The abandoned reservation does not count against the pool
    connector.set_behavior("a1.local:7000", MockBehavior::Accept);
    assert!(router.resolve(&["git"], None).await.is_ok());
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_one_hung_probe_does_not_block_sweep() {
    tokio::time::pause();
    let (router, connector) = router(RouterConfig::default());
    for i in 0..20 {
        router.register(agent(&format!("a{}", i), &["git"])).unwrap();
    }
    connector.set_probe_behavior("a7.local:7000", MockBehavior::Hang);

    let report = router.sweep_health().await;
    assert_eq!(report.probed, 20);
    assert_eq!(report.unhealthy, 1);

    let stats = router.stats();
    assert_eq!(stats.healthy_agents, 19);
    assert_eq!(stats.status_counts.unhealthy, 1);
}

// ============================================================================
// Mass connect, broadcast and stats
// ============================================================================

#[tokio::test]
async fn test_mass_connect_then_broadcast() {
    tokio::time::pause();
    let mut config = RouterConfig::default();
    config.mass_connect.batch_size = 4;
    let (router, connector) = router(config);
    for i in 0..10 {
        router
            .register(agent(&format!("a{}", i), &["git", "http"]))
            .unwrap();
    }
    connector.set_behavior("a3.local:7000", MockBehavior::Refuse);

    let report = router.mass_connect().await;
    assert_eq!(report.attempted, 10);
    assert_eq!(report.connected, 9);
    assert_eq!(report.failed, 1);

    let stats = router.stats();
    assert_eq!(stats.total_agents, 10);
    assert_eq!(stats.active_connections, 9);
    assert_eq!(stats.failed_connections, 1);
    assert_eq!(stats.capability_coverage.get("git"), Some(&10));

    let filter = BroadcastFilter::with_capabilities(["http"]);
    assert_eq!(router.broadcast(&filter, b"reload").await, 9);
    assert_eq!(connector.sent_to("a0.local:7000"), vec![b"reload".to_vec()]);
}

#[tokio::test]
async fn test_hung_recipient_does_not_stall_broadcast() {
    tokio::time::pause();
    let (router, connector) = router(RouterConfig::default());
    for id in ["a0", "a1", "a2"] {
        router
            .register(agent(id, &["http"]).with_timeout_ms(200))
            .unwrap();
    }
    assert_eq!(router.mass_connect().await.connected, 3);
    connector.connections("a1.local:7000")[0].set_hang_sends(true);

    let started = tokio::time::Instant::now();
    let delivered = router.broadcast(&BroadcastFilter::all(), b"reload").await;
    let elapsed = started.elapsed();

    assert_eq!(delivered, 2);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250));
    assert_eq!(connector.sent_to("a0.local:7000"), vec![b"reload".to_vec()]);
    assert!(connector.sent_to("a1.local:7000").is_empty());

    // The connection that timed out is still pooled for the next caller
    let handle = router.resolve(&["http"], None).await.unwrap();
    router.release(handle).await;
    assert_eq!(router.stats().active_connections, 3);
}

#[tokio::test]
async fn test_events_are_typed_and_ordered() {
    let (sink, mut rx) = ChannelEventSink::channel(64);
    let router = Router::with_parts(
        RouterConfig::default(),
        ConnectorSet::uniform(Arc::new(MockConnector::new())),
        Arc::new(ManualClock::new(0)),
        Arc::new(sink),
    )
    .unwrap();

    router.register(agent("a1", &["git"])).unwrap();
    router.sweep_health().await;
    router.unregister("a1").await;

    let first = rx.recv().await.unwrap();
    assert!(matches!(first, RegistryEvent::AgentRegistered { ref descriptor } if descriptor.id == "a1"));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.name(), "agent.health.checked");
    let third = rx.recv().await.unwrap();
    assert_eq!(
        third,
        RegistryEvent::AgentUnregistered {
            agent_id: "a1".to_string()
        }
    );

    let json = serde_json::to_value(&third).unwrap();
    assert_eq!(json["event"], "agent.unregistered");
}

#[tokio::test]
async fn test_shutdown_stops_background_work() {
    tokio::time::pause();
    let (router, connector) = router(RouterConfig::default());
    router.register(agent("a1", &["git"])).unwrap();
    router.start();
    router.mass_connect().await;

    router.shutdown().await;
    let probes = connector.probe_count("a1.local:7000");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.probe_count("a1.local:7000"), probes);
    assert_eq!(router.stats().total_agents, 0);
    assert!(router.broadcast(&BroadcastFilter::all(), b"x").await == 0);
}
