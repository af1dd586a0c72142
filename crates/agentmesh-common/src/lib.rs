//! agentmesh shared types
//!
//! This crate holds everything the pool, router and CLI crates agree on:
//!
//! - **Data model**: [`AgentDescriptor`], [`HealthState`], [`Stats`]
//! - **Errors**: [`MeshError`] and the [`Result`] alias
//! - **Connections**: the [`Connection`] / [`ConnectionFactory`] seams, the
//!   per-protocol [`ConnectorSet`] and pooled [`ConnectionHandle`]s
//! - **Events**: typed [`RegistryEvent`]s delivered through an [`EventSink`]
//! - **Time**: the injectable [`Clock`]
//! - **Configuration**: [`RouterConfig`] and the JSON [`FleetFile`]
//! - **Transport**: the default [`TcpConnector`]

pub mod clock;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod health;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FleetFile, HealthConfig, MassConnectConfig, RouterConfig, Strategy};
pub use connection::{Connection, ConnectionFactory, ConnectionHandle, ConnectorSet, DialError};
pub use descriptor::{AgentConfig, AgentDescriptor, Capability, ConnectionSpec, Protocol};
pub use error::{MeshError, NoAgentReason, Result};
pub use events::{ChannelEventSink, EventSink, NoopEventSink, RegistryEvent};
pub use health::{HealthState, HealthStatus, ProbeOutcome, Stats, NEUTRAL_SUCCESS_RATE};
pub use transport::TcpConnector;
