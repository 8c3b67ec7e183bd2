//! Error types for paylink.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or settling a payment request.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or over-precise decimal amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed account or contract address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The requested record does not exist.
    #[error("payment request not found: {0}")]
    NotFound(String),

    /// No usable wallet is available.
    #[error("wallet unavailable: {0}")]
    WalletUnavailable(String),

    /// The operator declined the wallet connection.
    #[error("wallet connection rejected: {0}")]
    ConnectionRejected(String),

    /// The wallet is on a different network than the request.
    #[error("wrong network: expected chain {expected}, wallet is on chain {actual}")]
    WrongNetwork {
        /// Chain the request lives on.
        expected: u64,
        /// Chain the wallet is currently on.
        actual: u64,
    },

    /// The transfer was rejected by the wallet or reverted on-chain.
    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    /// Transient failure in the transfer log source.
    #[error("log source error: {0}")]
    LogSource(String),

    /// The record changed underneath a store update.
    #[error("store write conflict: {0}")]
    StoreWriteConflict(String),

    /// Transport or server failure talking to the store.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Another settlement attempt for the request is still running.
    #[error("settlement in progress: {0}")]
    SettlementInProgress(String),

    /// The owning session was torn down.
    #[error("settlement session closed")]
    Cancelled,
}

impl Error {
    /// Returns true if the operator may retry the failed step.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidAmount(_)
                | Self::InvalidAddress(_)
                | Self::NotFound(_)
                | Self::Config(_)
                | Self::Cancelled
        )
    }
}
