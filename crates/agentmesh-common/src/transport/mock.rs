//! In-memory connector for tests.
//!
//! Behaviour is scripted per endpoint, and every dial, probe and send is recorded so
//! tests can assert on connection churn without opening sockets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionFactory, DialError};
use crate::descriptor::Protocol;
use crate::error::{MeshError, Result};

/// How an endpoint responds to dials and probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Accept,
    Refuse,
    /// Never completes, regardless of the timeout passed in
    Hang,
    /// Completes successfully after the given delay
    Delay(Duration),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct MockConnector {
    default: MockBehavior,
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    probe_behaviors: Mutex<HashMap<String, MockBehavior>>,
    dials: Mutex<HashMap<String, usize>>,
    probes: Mutex<HashMap<String, usize>>,
    connections: Mutex<HashMap<String, Vec<Arc<MockConnection>>>>,
    next_id: AtomicU64,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// A connector that accepts every endpoint unless told otherwise.
    pub fn new() -> Self {
        Self::with_default(MockBehavior::Accept)
    }

    pub fn with_default(default: MockBehavior) -> Self {
        Self {
            default,
            behaviors: Mutex::new(HashMap::new()),
            probe_behaviors: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Scripts both dials and probes for `endpoint`.
    pub fn set_behavior(&self, endpoint: &str, behavior: MockBehavior) {
        lock(&self.behaviors).insert(endpoint.to_string(), behavior);
    }

    /// Scripts only probes for `endpoint`, leaving dials alone.
    pub fn set_probe_behavior(&self, endpoint: &str, behavior: MockBehavior) {
        lock(&self.probe_behaviors).insert(endpoint.to_string(), behavior);
    }

    pub fn dial_count(&self, endpoint: &str) -> usize {
        lock(&self.dials).get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_dials(&self) -> usize {
        lock(&self.dials).values().sum()
    }

    pub fn probe_count(&self, endpoint: &str) -> usize {
        lock(&self.probes).get(endpoint).copied().unwrap_or(0)
    }

    pub fn connections(&self, endpoint: &str) -> Vec<Arc<MockConnection>> {
        lock(&self.connections)
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages delivered to any connection of `endpoint`.
    pub fn sent_to(&self, endpoint: &str) -> Vec<Vec<u8>> {
        self.connections(endpoint)
            .iter()
            .flat_map(|c| c.sent())
            .collect()
    }

    /// Simulates the remote side hanging up on every open connection to `endpoint`.
    pub fn disconnect(&self, endpoint: &str) {
        for conn in self.connections(endpoint) {
            conn.remote_close();
        }
    }

    fn behavior_for(&self, endpoint: &str) -> MockBehavior {
        lock(&self.behaviors)
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    async fn play(behavior: MockBehavior, endpoint: &str) -> std::result::Result<(), DialError> {
        match behavior {
            MockBehavior::Accept => Ok(()),
            MockBehavior::Refuse => Err(DialError::Failed(format!("{} refused", endpoint))),
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for MockConnector {
    async fn dial(
        &self,
        endpoint: &str,
        protocol: Protocol,
        _timeout: Duration,
    ) -> std::result::Result<Arc<dyn Connection>, DialError> {
        *lock(&self.dials).entry(endpoint.to_string()).or_insert(0) += 1;
        Self::play(self.behavior_for(endpoint), endpoint).await?;

        let conn = Arc::new(MockConnection::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            protocol,
        ));
        lock(&self.connections)
            .entry(endpoint.to_string())
            .or_default()
            .push(conn.clone());
        Ok(conn)
    }

    async fn probe(
        &self,
        endpoint: &str,
        _protocol: Protocol,
        _timeout: Duration,
    ) -> std::result::Result<(), DialError> {
        *lock(&self.probes).entry(endpoint.to_string()).or_insert(0) += 1;
        let behavior = lock(&self.probe_behaviors)
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.behavior_for(endpoint));
        Self::play(behavior, endpoint).await
    }
}

#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    protocol: Protocol,
    sent: Mutex<Vec<Vec<u8>>>,
    fail_sends: AtomicBool,
    hang_sends: AtomicBool,
    close_calls: AtomicUsize,
    closed: watch::Sender<bool>,
}

impl MockConnection {
    pub fn new(id: u64, protocol: Protocol) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            protocol,
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            hang_sends: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.sent).clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every later `send` block until the connection is closed.
    pub fn set_hang_sends(&self, hang: bool) {
        self.hang_sends.store(hang, Ordering::SeqCst);
    }

    /// Number of local `close` calls.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn remote_close(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, message: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(MeshError::Send("connection closed".to_string()));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MeshError::Send("scripted send failure".to_string()));
        }
        if self.hang_sends.load(Ordering::SeqCst) {
            self.closed().await;
            return Err(MeshError::Send("connection closed".to_string()));
        }
        lock(&self.sent).push(message.to_vec());
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
