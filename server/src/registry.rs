//! Connection registry and fan-out for the telemetry relay.
//!
//! Connected clients are anonymous and interchangeable, so the registry is a
//! tokio broadcast channel: registering a connection subscribes a receiver,
//! dropping the [`Connection`] removes it. A broadcast reaches exactly the
//! receivers that exist at the moment of the send, which gives every
//! broadcast a consistent snapshot of membership without an explicit lock.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use telemetry_relay_server::registry::ConnectionRegistry;
//! use telemetry_relay_server::types::Frame;
//!
//! let registry = ConnectionRegistry::new();
//! let mut connection = registry.register();
//!
//! let delivered = registry.broadcast(Frame::single("stop", json!(4)));
//! assert_eq!(delivered, 1);
//! assert_eq!(connection.try_recv().unwrap().event, "stop");
//! ```

use tokio::sync::broadcast::{self, error::TryRecvError, Receiver, Sender};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::Frame;

/// Default channel capacity.
///
/// A connection that falls more than this many frames behind skips the
/// oldest ones and sees `RecvError::Lagged`.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Tracks live connections and delivers frames to all of them.
///
/// Cheap to clone; clones share the same membership.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    sender: Sender<Frame>,
}

/// One live connection's view of the registry.
///
/// The id only exists for log correlation; it is not persisted and a
/// reconnecting client gets a new one.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    receiver: Receiver<Frame>,
}

impl ConnectionRegistry {
    /// Creates a registry with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a registry with a custom per-connection backlog.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created connection registry");
        Self { sender }
    }

    /// Registers a new connection.
    ///
    /// The connection receives every frame broadcast after this call and is
    /// deregistered when dropped.
    #[must_use]
    pub fn register(&self) -> Connection {
        let connection = Connection {
            id: Uuid::new_v4(),
            receiver: self.sender.subscribe(),
        };
        debug!(
            connection_id = %connection.id,
            connections = self.connection_count(),
            "Connection registered"
        );
        connection
    }

    /// Sends a frame to every registered connection, including the one that
    /// produced it.
    ///
    /// Returns the number of connections the frame was queued for. Never
    /// blocks and never fails; with no connections the frame is discarded.
    pub fn broadcast(&self, frame: Frame) -> usize {
        trace!(event = %frame.event, "Broadcasting frame");

        match self.sender.send(frame) {
            Ok(receivers) => {
                trace!(receivers, "Broadcast queued");
                receivers
            }
            Err(_) => {
                trace!("No connections to receive frame");
                0
            }
        }
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the next broadcast frame.
    pub async fn recv(&mut self) -> Result<Frame, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Returns the next queued frame without waiting.
    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        self.receiver.try_recv()
    }
}
