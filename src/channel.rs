//! Publish/subscribe surface for value updates and status changes.
//!
//! Single producer (the state machine), any number of consumers. Delivery
//! order per characteristic matches the order the transport emitted values;
//! nothing is deduplicated and nothing beyond the snapshot's latest value is
//! retained, so consumers that need history must capture on delivery. A slow
//! consumer observes `Lagged` from the broadcast channel and resubscribes.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::central::LinkState;
use crate::transport::{DiscoveredPeripheral, FailureReason};

/// One published event.
#[derive(Debug, Clone)]
pub enum Update {
    /// Connection status changed. `message` is the human-readable form.
    Status { state: LinkState, message: String },
    /// A new peripheral appeared during the active scan session.
    DeviceDiscovered(DiscoveredPeripheral),
    /// Inbound characteristic value, from a read or a notification.
    Value { characteristic: Uuid, value: Vec<u8> },
    /// A write submitted with the given sequence number completed.
    WriteCompleted {
        characteristic: Uuid,
        seq: u64,
        result: Result<(), FailureReason>,
    },
}

/// Broadcast fan-out of [`Update`]s.
#[derive(Debug, Clone)]
pub struct DataChannel {
    tx: broadcast::Sender<Update>,
}

impl DataChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, update: Update) {
        // No receivers is fine; updates are best-effort.
        let _ = self.tx.send(update);
    }
}
