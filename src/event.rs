//! Settlement event system.

use crate::request::{RequestId, RequestStatus};
use alloy::primitives::TxHash;
use tokio::sync::broadcast;

/// Which detection path produced a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementSource {
    /// A third-party transfer observed in the token's log.
    Watch,
    /// A transfer sent by the operator and confirmed by its receipt.
    Send,
}

/// Events emitted by a settlement coordinator.
#[derive(Debug, Clone)]
pub enum SettlementEvent {
    /// Request fetched from the store.
    Loaded {
        /// Request identifier.
        id: RequestId,
        /// Status at load time.
        status: RequestStatus,
    },

    /// Passive watch armed.
    WatchStarted {
        /// Request identifier.
        id: RequestId,
    },

    /// Passive watch torn down.
    WatchStopped {
        /// Request identifier.
        id: RequestId,
    },

    /// The log source reported an error; the watch keeps running.
    WatchError {
        /// Request identifier.
        id: RequestId,
        /// Error message.
        message: String,
    },

    /// Operator transfer submitted and awaiting its receipt.
    TransferSubmitted {
        /// Request identifier.
        id: RequestId,
        /// Submitted transaction.
        tx_hash: TxHash,
    },

    /// Request recorded as paid.
    Settled {
        /// Request identifier.
        id: RequestId,
        /// Transaction recorded by the store.
        tx_hash: TxHash,
        /// Path that triggered the update.
        source: SettlementSource,
    },

    /// A settlement step failed; the operator may retry.
    SettlementFailed {
        /// Request identifier.
        id: RequestId,
        /// Error message.
        message: String,
    },
}

/// Channel for receiving settlement events.
pub type SettlementEventsChannel = broadcast::Receiver<SettlementEvent>;

/// Sender for settlement events.
pub type SettlementEventsSender = broadcast::Sender<SettlementEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (SettlementEventsSender, SettlementEventsChannel) {
    broadcast::channel(256)
}
