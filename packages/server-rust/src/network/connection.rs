//! Connection registry and per-connection outbound handles.
//!
//! Each connection owns a bounded mpsc channel drained by its WebSocket
//! write loop; the registry tracks live handles in a `DashMap` so shutdown
//! can reach every peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use wsgate_core::Envelope;

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Error returned when an outbound envelope cannot be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    #[error("outbound channel full past send timeout")]
    Timeout,
    /// The write loop is gone; the receiver was dropped.
    #[error("connection closed")]
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    #[error("outbound channel full")]
    Full,
}

/// Sender side of a single connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<Envelope>,
    pub connected_at: Instant,
    /// Request path the connection was opened on.
    pub path: String,
}

impl ConnectionHandle {
    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// `SendError::Full` when the channel is at capacity,
    /// `SendError::Disconnected` when the write loop has exited.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Enqueues, waiting up to `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// `SendError::Timeout` if the channel remains full,
    /// `SendError::Disconnected` if the receiver has been dropped.
    pub async fn send_timeout(&self, envelope: Envelope, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Thread-safe registry of all live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection opened on `path`.
    ///
    /// The returned receiver belongs to the write loop.
    pub fn register(
        &self,
        path: &str,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Envelope>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            connected_at: Instant::now(),
            path: path.to_string(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        self.publish_count();
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&id).map(|(_, handle)| handle);
        self.publish_count();
        removed
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns every connection. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        self.publish_count();
        handles
    }
}

impl ConnectionRegistry {
    #[allow(clippy::cast_precision_loss)]
    fn publish_count(&self) {
        metrics::gauge!("wsgate_connections_active").set(self.count() as f64);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
