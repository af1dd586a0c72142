use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::descriptor::Protocol;
use crate::error::Result;

/// Failure reported by a connection factory.
///
/// Factories know nothing about agent identities; the pool attaches the agent ID when
/// turning this into a [`MeshError`](crate::MeshError).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0}ms")]
    TimedOut(u64),
}

/// A live connection to an agent, independent of its wire protocol.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one opaque message.
    async fn send(&self, message: &[u8]) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Closes the connection. Calling it twice is harmless.
    async fn close(&self);

    /// Resolves once the connection is closed, locally or by the remote side.
    async fn closed(&self);
}

/// Protocol-specific dialer supplied by the embedding application.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn dial(
        &self,
        endpoint: &str,
        protocol: Protocol,
        timeout: Duration,
    ) -> std::result::Result<Arc<dyn Connection>, DialError>;

    /// Lightweight liveness check. Defaults to a dial followed by an immediate close.
    async fn probe(
        &self,
        endpoint: &str,
        protocol: Protocol,
        timeout: Duration,
    ) -> std::result::Result<(), DialError> {
        let conn = self.dial(endpoint, protocol, timeout).await?;
        conn.close().await;
        Ok(())
    }
}

/// Connection factories keyed by protocol.
#[derive(Clone, Default)]
pub struct ConnectorSet {
    factories: HashMap<Protocol, Arc<dyn ConnectionFactory>>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One factory serving every protocol.
    pub fn uniform(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::new()
            .with(Protocol::Rpc, factory.clone())
            .with(Protocol::Http, factory.clone())
            .with(Protocol::WebSocket, factory)
    }

    pub fn with(mut self, protocol: Protocol, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.insert(protocol, factory);
        self
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn ConnectionFactory>> {
        self.factories.get(&protocol)
    }
}

impl std::fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<_> = self.factories.keys().collect();
        protocols.sort();
        f.debug_struct("ConnectorSet")
            .field("protocols", &protocols)
            .finish()
    }
}

/// A pooled connection plus the bookkeeping the pool needs to take it back.
///
/// Cloning a handle does not open a new connection; both clones refer to the same one.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    agent_id: Arc<str>,
    protocol: Protocol,
    created_at: u64,
    generation: u64,
    connection: Arc<dyn Connection>,
}

impl ConnectionHandle {
    pub fn new(
        id: u64,
        agent_id: Arc<str>,
        protocol: Protocol,
        created_at: u64,
        generation: u64,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            id,
            agent_id,
            protocol,
            created_at,
            generation,
            connection,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Pool generation the handle was created in; replaced on every drain.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn send(&self, message: &[u8]) -> Result<()> {
        self.connection.send(message).await
    }

    pub async fn close(&self) {
        self.connection.close().await
    }

    pub async fn closed(&self) {
        self.connection.closed().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("protocol", &self.protocol)
            .field("created_at", &self.created_at)
            .field("generation", &self.generation)
            .field("open", &self.is_open())
            .finish()
    }
}
