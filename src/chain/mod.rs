//! Chain data and wallet collaborators.
//!
//! Two seams separate the settlement logic from the blockchain:
//!
//! - [`ChainReader`] observes the token's transfer log and waits for
//!   receipts. Log observation is a [`TransferSubscription`]: a cancellable
//!   stream of transfer batches fed by whatever polls the node.
//! - [`Wallet`] connects an operator account, switches networks and submits
//!   the ERC-20 `transfer`.
//!
//! ```text
//!   log source task                      matcher
//!  ┌──────────────┐  batches (mpsc)   ┌──────────────────┐
//!  │ TransferFeed │ ────────────────▶ │ TransferSubscr.  │
//!  │              │ ◀──────────────── │                  │
//!  └──────────────┘  cancel (watch)   └──────────────────┘
//! ```
//!
//! Dropping the subscription cancels the feed, so a finished or abandoned
//! watch never keeps polling.

mod rpc;
mod wallet;

pub use rpc::{RpcChainReader, IERC20};
pub use wallet::LocalWallet;

use crate::error::{Error, Result};
use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

/// Number of undelivered batches a feed may buffer.
pub const FEED_BUFFER: usize = 64;

/// One ERC-20 `Transfer` log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    /// Sender.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Amount in atomic units.
    pub value: U256,
    /// Transaction that emitted the log.
    pub transaction_hash: TxHash,
    /// Block containing the log, when known.
    pub block_number: Option<u64>,
    /// Index of the log within its block, when known.
    pub log_index: Option<u64>,
}

impl TransferEvent {
    /// Position in the chain, if both block number and log index are known.
    #[must_use]
    pub fn position(&self) -> Option<(u64, u64)> {
        Some((self.block_number?, self.log_index?))
    }
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Transaction hash.
    pub transaction_hash: TxHash,
    /// False if the transaction reverted.
    pub success: bool,
    /// Block the transaction was mined in.
    pub block_number: Option<u64>,
}

/// A batch delivered by a log source, or the error it hit while polling.
pub type TransferBatch = Result<Vec<TransferEvent>>;

/// Create a connected subscription/feed pair.
#[must_use]
pub fn transfer_subscription(buffer: usize) -> (TransferSubscription, TransferFeed) {
    let (batches_tx, batches_rx) = mpsc::channel(buffer.max(1));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (
        TransferSubscription {
            batches: batches_rx,
            cancel: cancel_tx,
        },
        TransferFeed {
            batches: batches_tx,
            cancel: cancel_rx,
        },
    )
}

/// Consumer side of a transfer watch.
///
/// Cancelled explicitly with [`cancel`](Self::cancel) or implicitly on drop.
#[derive(Debug)]
pub struct TransferSubscription {
    batches: mpsc::Receiver<TransferBatch>,
    cancel: watch::Sender<bool>,
}

impl TransferSubscription {
    /// Wait for the next batch.
    ///
    /// Returns `None` once the feed has gone away or the subscription was
    /// cancelled and drained.
    pub async fn next_batch(&mut self) -> Option<TransferBatch> {
        self.batches.recv().await
    }

    /// Stop the feed. Batches already buffered remain readable.
    pub fn cancel(&mut self) {
        self.cancel.send_replace(true);
        self.batches.close();
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for TransferSubscription {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

/// Producer side of a transfer watch, held by the log source.
#[derive(Debug)]
pub struct TransferFeed {
    batches: mpsc::Sender<TransferBatch>,
    cancel: watch::Receiver<bool>,
}

impl TransferFeed {
    /// Deliver a batch. Returns false if the subscriber is gone.
    pub async fn deliver(&self, batch: Vec<TransferEvent>) -> bool {
        !self.is_cancelled() && self.batches.send(Ok(batch)).await.is_ok()
    }

    /// Report a polling failure. Returns false if the subscriber is gone.
    pub async fn report_error(&self, error: Error) -> bool {
        !self.is_cancelled() && self.batches.send(Err(error)).await.is_ok()
    }

    /// Returns true once the subscriber cancelled or went away.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.batches.is_closed()
    }

    /// Resolve once the subscriber cancels or goes away.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = self.batches.closed() => return,
            }
        }
    }
}

/// Read access to chain data.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Start delivering `Transfer` logs of `token` whose destination is `to`.
    ///
    /// Transfers mined at or after `since` are delivered, including those
    /// already on chain when the watch starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogSource`] if the watch cannot be established.
    async fn watch_transfers(
        &self,
        token: Address,
        to: Address,
        since: DateTime<Utc>,
    ) -> Result<TransferSubscription>;

    /// Wait until `tx_hash` is mined and return its receipt.
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt can never be obtained.
    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransferReceipt>;
}

/// An operator wallet able to send the requested transfer.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Connect (if not already connected) and return the active account.
    ///
    /// # Errors
    ///
    /// [`Error::WalletUnavailable`] or [`Error::ConnectionRejected`].
    async fn connect(&self) -> Result<Address>;

    /// Chain the wallet is currently on.
    ///
    /// # Errors
    ///
    /// [`Error::WalletUnavailable`] if not connected.
    async fn chain_id(&self) -> Result<u64>;

    /// Switch the wallet to `chain_id`.
    ///
    /// # Errors
    ///
    /// [`Error::WrongNetwork`] or [`Error::ConnectionRejected`] if the switch
    /// is declined or impossible.
    async fn switch_chain(&self, chain_id: u64) -> Result<()>;

    /// Submit `token.transfer(to, amount)` and return the transaction hash.
    ///
    /// # Errors
    ///
    /// [`Error::TransferRejected`] if the wallet refuses or submission fails.
    async fn send_token_transfer(&self, token: Address, to: Address, amount: U256)
        -> Result<TxHash>;
}
