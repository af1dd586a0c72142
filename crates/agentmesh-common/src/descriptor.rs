use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{MeshError, Result};

/// Wire protocol an agent is reached over.
///
/// The router never speaks these protocols itself; each variant is dispatched to
/// the connection factory registered for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rpc,
    Http,
    WebSocket,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Rpc => "rpc",
            Protocol::Http => "http",
            Protocol::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Protocol {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rpc" => Ok(Protocol::Rpc),
            "http" => Ok(Protocol::Http),
            "websocket" | "ws" => Ok(Protocol::WebSocket),
            other => Err(MeshError::Config(format!("unknown protocol '{}'", other))),
        }
    }
}

/// A named, versioned feature an agent declares support for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// How to reach an agent and how many connections it may hold open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub endpoint: String,
    pub protocol: Protocol,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

fn default_max_pool_size() -> usize {
    4
}

/// Per-agent tuning carried alongside the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Concurrent requests the agent advertises it can take
    pub max_concurrency: usize,
    /// Dial timeout used when the pool opens a connection lazily
    pub timeout_ms: u64,
    /// Extra dial attempts after the first one fails
    pub retry_attempts: u32,
    pub cache_ttl_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            timeout_ms: 10_000,
            retry_attempts: 0,
            cache_ttl_ms: 60_000,
        }
    }
}

/// Identity and capability declaration for a remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub priority: i32,
    pub connection: ConnectionSpec,
    #[serde(default)]
    pub config: AgentConfig,
}

impl AgentDescriptor {
    /// Creates a descriptor with no capabilities, priority 0 and default tuning.
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            priority: 0,
            connection: ConnectionSpec {
                endpoint: endpoint.into(),
                protocol,
                max_pool_size: default_max_pool_size(),
            },
            config: AgentConfig::default(),
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.capabilities.insert(Capability::new(name, version));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.connection.max_pool_size = max_pool_size;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.config.retry_attempts = retry_attempts;
        self
    }

    /// Distinct capability names, in sorted order.
    pub fn capability_names(&self) -> BTreeSet<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn has_all<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|name| self.has_capability(name.as_ref()))
    }

    /// Rejects descriptors the registry could never serve.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MeshError::Config("agent id must not be empty".to_string()));
        }
        if self.connection.endpoint.trim().is_empty() {
            return Err(MeshError::Config(format!(
                "agent {} has an empty endpoint",
                self.id
            )));
        }
        if self.connection.max_pool_size == 0 {
            return Err(MeshError::Config(format!(
                "agent {} must allow at least one pooled connection",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let agent = AgentDescriptor::new("a1", "127.0.0.1:9001", Protocol::Rpc)
            .with_capability("git", "2")
            .with_capability("http", "1")
            .with_priority(3)
            .with_max_pool_size(8);

        assert_eq!(agent.id, "a1");
        assert_eq!(agent.priority, 3);
        assert_eq!(agent.connection.max_pool_size, 8);
        assert!(agent.has_capability("git"));
        assert!(!agent.has_capability("ssh"));
        assert!(agent.has_all(&["git", "http"]));
        assert!(!agent.has_all(&["git", "http", "ssh"]));
        assert_eq!(
            agent.capability_names().into_iter().collect::<Vec<_>>(),
            vec!["git", "http"]
        );
    }

    #[test]
    fn test_same_capability_declared_twice_is_one_entry() {
        let agent = AgentDescriptor::new("a1", "e", Protocol::Http)
            .with_capability("git", "2")
            .with_capability("git", "2");
        assert_eq!(agent.capabilities.len(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_descriptors() {
        assert!(AgentDescriptor::new("", "e", Protocol::Http).validate().is_err());
        assert!(AgentDescriptor::new("a", " ", Protocol::Http).validate().is_err());
        assert!(AgentDescriptor::new("a", "e", Protocol::Http)
            .with_max_pool_size(0)
            .validate()
            .is_err());
        assert!(AgentDescriptor::new("a", "e", Protocol::Http).validate().is_ok());
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("rpc".parse::<Protocol>().unwrap(), Protocol::Rpc);
        assert_eq!("WebSocket".parse::<Protocol>().unwrap(), Protocol::WebSocket);
        assert_eq!("ws".parse::<Protocol>().unwrap(), Protocol::WebSocket);
        assert!("smtp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::WebSocket.to_string(), "websocket");
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = r#"{
            "id": "a1",
            "capabilities": [{"name": "git", "version": "2"}],
            "connection": {"endpoint": "127.0.0.1:9001", "protocol": "websocket"}
        }"#;
        let agent: AgentDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(agent.connection.protocol, Protocol::WebSocket);
        assert_eq!(agent.connection.max_pool_size, 4);
        assert_eq!(agent.priority, 0);
        assert_eq!(agent.config, AgentConfig::default());
    }
}
