use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::connection::{Connection, ConnectionFactory, DialError};
use crate::descriptor::Protocol;
use crate::error::{MeshError, Result};

/// Largest message a single frame may carry (100 MB).
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Default connection factory: plain TCP for every protocol variant.
///
/// Protocol-level handshakes belong to the embedding application; this connector only
/// opens the socket and frames outgoing messages.
///
/// # Wire Format
///
/// ```text
/// [4-byte length as u32 big-endian] [payload]
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnector {
    async fn dial(
        &self,
        endpoint: &str,
        protocol: Protocol,
        timeout: Duration,
    ) -> std::result::Result<Arc<dyn Connection>, DialError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| DialError::TimedOut(timeout.as_millis() as u64))?
            .map_err(|e| DialError::Failed(format!("failed to connect to {}: {}", endpoint, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| DialError::Failed(format!("failed to set TCP_NODELAY: {}", e)))?;

        tracing::debug!(endpoint = %endpoint, protocol = %protocol, "TCP connection established");
        Ok(Arc::new(TcpConnection::new(stream)))
    }
}

/// A framed TCP connection whose closed state tracks the remote side.
pub struct TcpConnection {
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: Arc<watch::Sender<bool>>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        tokio::spawn(watch_remote_close(read_half, closed.clone()));

        Self {
            writer: Mutex::new(Some(write_half)),
            closed,
        }
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }
}

/// Drains inbound bytes until the peer hangs up or the connection is closed locally.
async fn watch_remote_close(mut reader: OwnedReadHalf, closed: Arc<watch::Sender<bool>>) {
    let mut closed_rx = closed.subscribe();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
            _ = closed_rx.wait_for(|closed| *closed) => return,
        }
    }
    closed.send_replace(true);
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, message: &[u8]) -> Result<()> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(MeshError::Send(format!(
                "message too large: {} bytes (max {} bytes)",
                message.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| MeshError::Send("connection closed".to_string()))?;

        let len = message.len() as u32;
        let written = async {
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(message).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            guard.take();
            drop(guard);
            self.mark_closed();
            return Err(MeshError::Send(format!("write failed: {}", e)));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.mark_closed();
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
