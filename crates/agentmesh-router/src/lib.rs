//! agentmesh router
//!
//! Capability-indexed agent registry and connection router for large agent fleets.
//!
//! # Components
//!
//! - [`Directory`]: agent store with a capability index
//! - [`scorer`]: ranks candidates by health, latency, success rate and load
//! - [`HealthMonitor`]: staggered background liveness probes
//! - [`MassConnector`]: batched pool pre-warming with auto-reconnect
//! - [`LoadBalancer`]: round-robin, least-connections or random choice among the best
//! - [`Router`]: the composition root exposing `resolve`, `broadcast` and friends
//!
//! Connection pooling lives in `agentmesh-pool`; shared types, config and transports
//! in `agentmesh-common`.

pub mod directory;
pub mod health_monitor;
pub mod load_balancer;
pub mod mass_connector;
pub mod router;
pub mod scheduler;
pub mod scorer;
pub mod stats;

pub use directory::{AgentEntry, Directory};
pub use health_monitor::{HealthMonitor, SweepReport};
pub use load_balancer::{LeastConnections, LoadBalancer, LoadSample, RandomChoice, RoundRobin};
pub use mass_connector::{MassConnectReport, MassConnector};
pub use router::{BroadcastFilter, Router};
pub use scheduler::{Shutdown, ShutdownSignal, Ticker};
pub use scorer::{Candidate, Scored};
pub use stats::{RouterStats, StatusCounts};
