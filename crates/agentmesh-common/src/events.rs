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

use serde::Serialize;
use tokio::sync::mpsc;

use crate::descriptor::{AgentDescriptor, Protocol};
use crate::health::{HealthStatus, Stats};

/// Registry lifecycle notifications published to dashboards and loggers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum RegistryEvent {
    #[serde(rename = "agent.registered")]
    AgentRegistered { descriptor: AgentDescriptor },

    #[serde(rename = "agent.unregistered")]
    AgentUnregistered { agent_id: String },

    #[serde(rename = "connection.created")]
    ConnectionCreated {
        agent_id: String,
        connection_id: u64,
        protocol: Protocol,
    },

    #[serde(rename = "agent.health.checked")]
    AgentHealthChecked {
        agent_id: String,
        status: HealthStatus,
        latency_ms: u64,
        checked_at: u64,
    },

    #[serde(rename = "agent.stats.updated")]
    AgentStatsUpdated { agent_id: String, stats: Stats },
}

impl RegistryEvent {
    /// Dotted event name, e.g. `agent.registered`.
    pub fn name(&self) -> &'static str {
        match self {
            RegistryEvent::AgentRegistered { .. } => "agent.registered",
            RegistryEvent::AgentUnregistered { .. } => "agent.unregistered",
            RegistryEvent::ConnectionCreated { .. } => "connection.created",
            RegistryEvent::AgentHealthChecked { .. } => "agent.health.checked",
            RegistryEvent::AgentStatsUpdated { .. } => "agent.stats.updated",
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            RegistryEvent::AgentRegistered { descriptor } => &descriptor.id,
            RegistryEvent::AgentUnregistered { agent_id }
            | RegistryEvent::ConnectionCreated { agent_id, .. }
            | RegistryEvent::AgentHealthChecked { agent_id, .. }
            | RegistryEvent::AgentStatsUpdated { agent_id, .. } => agent_id,
        }
    }
}

/// Receiver side of registry notifications.
///
/// `emit` is called from hot paths and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RegistryEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: RegistryEvent) {}
}

/// Forwards events into a bounded channel.
///
/// When the consumer falls behind, new events are dropped with a warning instead of
/// back-pressuring registration or routing.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<RegistryEvent>,
}

impl ChannelEventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RegistryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: RegistryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    event = event.name(),
                    agent_id = %event.agent_id(),
                    "Event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
