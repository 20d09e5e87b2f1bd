//! Live space status received from the bus
//!
//! The bus task is the only writer. Readers take cheap snapshots and never
//! wait on the connection.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Connection and status notifications produced by a bus transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Broker accepted the connection
    Connected,
    /// A message arrived on the status topic
    Status(String),
    /// The connection dropped, with the transport's reason
    ConnectionLost(String),
}

/// Snapshot of the last status received
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoorStatus {
    /// Raw status string, empty when unknown
    pub value: String,
    /// When `value` arrived, `None` while unknown
    pub received_at: Option<Instant>,
    /// Whether the bus connection is currently up
    pub connected: bool,
}

impl DoorStatus {
    /// Time since the status was received
    pub fn age(&self) -> Option<Duration> {
        self.received_at.map(|at| at.elapsed())
    }
}

/// Shared, observable status cell
#[derive(Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<DoorStatus>>,
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DoorStatus::default());
        Self { tx: Arc::new(tx) }
    }

    /// Current status string
    pub fn current(&self) -> String {
        self.tx.borrow().value.clone()
    }

    /// Full snapshot including age and connection state
    pub fn snapshot(&self) -> DoorStatus {
        self.tx.borrow().clone()
    }

    /// Watch for status changes
    #[cfg(test)]
    pub(crate) fn subscribe(&self) -> watch::Receiver<DoorStatus> {
        self.tx.subscribe()
    }

    /// Apply a transport event
    pub fn apply(&self, event: BusEvent) {
        match event {
            BusEvent::Connected => {
                info!("connected");
                self.tx.send_modify(|status| status.connected = true);
            }
            BusEvent::Status(value) => {
                info!(status = %value, "got new status");
                self.tx.send_replace(DoorStatus {
                    value,
                    received_at: Some(Instant::now()),
                    connected: true,
                });
            }
            BusEvent::ConnectionLost(reason) => {
                warn!(error = %reason, "Connection lost.");
                // unknown until the broker delivers a fresh status
                self.tx.send_replace(DoorStatus::default());
            }
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
