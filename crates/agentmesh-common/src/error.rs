use crate::descriptor::Protocol;
use thiserror::Error;

/// Why a `resolve` call could not produce a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoAgentReason {
    /// No registered agent holds every required capability.
    NoMatch(Vec<String>),
    /// Candidates existed but every one of them failed to hand out a connection.
    Exhausted { tried: usize },
    /// The caller's deadline elapsed before a connection was acquired.
    DeadlineExceeded,
}

impl std::fmt::Display for NoAgentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoAgentReason::NoMatch(caps) => {
                write!(f, "no agent matches capabilities [{}]", caps.join(", "))
            }
            NoAgentReason::Exhausted { tried } => {
                write!(f, "all {} candidate agents exhausted", tried)
            }
            NoAgentReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Registry full: maximum of {max} agents reached")]
    RegistryFull { max: usize },

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Connection pool exhausted for agent {agent_id} (max {max})")]
    PoolExhausted { agent_id: String, max: usize },

    #[error("Connection error for agent {agent_id} over {protocol}: {cause}")]
    Connection {
        agent_id: String,
        protocol: Protocol,
        cause: String,
    },

    #[error("Connection to agent {agent_id} timed out after {timeout_ms}ms")]
    ConnectionTimeout { agent_id: String, timeout_ms: u64 },

    #[error("No connector registered for protocol {0}")]
    NoConnector(Protocol),

    #[error("No available agent: {0}")]
    NoAvailableAgent(NoAgentReason),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Router is shut down")]
    Shutdown,

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Connection-time failures that let the router move on to the next candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::PoolExhausted { .. }
                | MeshError::Connection { .. }
                | MeshError::ConnectionTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_error() {
        assert!(MeshError::PoolExhausted {
            agent_id: "a1".to_string(),
            max: 2
        }
        .is_retryable());
        assert!(MeshError::ConnectionTimeout {
            agent_id: "a1".to_string(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(MeshError::Connection {
            agent_id: "a1".to_string(),
            protocol: Protocol::Http,
            cause: "refused".to_string(),
        }
        .is_retryable());

        assert!(!MeshError::RegistryFull { max: 1 }.is_retryable());
        assert!(!MeshError::DuplicateAgent("a1".to_string()).is_retryable());
        assert!(!MeshError::NoAvailableAgent(NoAgentReason::DeadlineExceeded).is_retryable());
    }

    #[test]
    fn test_no_agent_reason_names_the_cause() {
        let err = MeshError::NoAvailableAgent(NoAgentReason::NoMatch(vec![
            "git".to_string(),
            "http".to_string(),
        ]));
        assert_eq!(
            err.to_string(),
            "No available agent: no agent matches capabilities [git, http]"
        );

        let err = MeshError::NoAvailableAgent(NoAgentReason::Exhausted { tried: 3 });
        assert_eq!(err.to_string(), "No available agent: all 3 candidate agents exhausted");
    }
}
