//! Payment request records.
//!
//! A request is created `Pending` and transitions to `Paid` exactly once.
//! Recipient, token, chain and amount never change after creation.

use crate::amount::decimal_string;
use crate::error::{Error, Result};
use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a payment request, as assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an identifier issued by a store.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Settlement status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    /// Awaiting a matching transfer.
    #[default]
    Pending,
    /// Settled by a confirmed transfer.
    Paid,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Paid => f.write_str("PAID"),
        }
    }
}

/// Fields supplied when creating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPaymentRequest {
    /// Account expected to receive the funds.
    #[serde(rename = "to")]
    pub recipient: Address,
    /// Token contract being requested.
    pub token_address: Address,
    /// Chain the token lives on.
    pub chain_id: u64,
    /// Exact amount in atomic units.
    #[serde(rename = "amountMicros", with = "decimal_string")]
    pub amount: U256,
}

/// A merchant's request for a fixed token amount.
///
/// The JSON shape matches the persistence service: `to`, `tokenAddress`,
/// `chainId`, `amountMicros` (decimal string), `status`, `txHash`, `paidAt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    id: RequestId,
    #[serde(rename = "to")]
    recipient: Address,
    token_address: Address,
    chain_id: u64,
    #[serde(rename = "amountMicros", with = "decimal_string")]
    amount: U256,
    #[serde(default)]
    status: RequestStatus,
    #[serde(rename = "txHash", default)]
    settlement_tx_hash: Option<TxHash>,
    #[serde(default)]
    paid_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl PaymentRequest {
    /// Build a freshly created, pending record.
    #[must_use]
    pub fn pending(id: RequestId, new: NewPaymentRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            recipient: new.recipient,
            token_address: new.token_address,
            chain_id: new.chain_id,
            amount: new.amount,
            status: RequestStatus::Pending,
            settlement_tx_hash: None,
            paid_at: None,
            created_at,
        }
    }

    /// Request identifier.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Expected recipient.
    #[must_use]
    pub fn recipient(&self) -> Address {
        self.recipient
    }

    /// Requested token contract.
    #[must_use]
    pub fn token_address(&self) -> Address {
        self.token_address
    }

    /// Target chain.
    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Exact amount in atomic units.
    #[must_use]
    pub fn amount(&self) -> U256 {
        self.amount
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Hash of the settling transaction, once paid.
    #[must_use]
    pub fn settlement_tx_hash(&self) -> Option<TxHash> {
        self.settlement_tx_hash
    }

    /// Settlement time, once paid.
    #[must_use]
    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns true once settled.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.status == RequestStatus::Paid
    }

    /// Apply the `Pending -> Paid` transition.
    ///
    /// First write wins: returns `false` and leaves the record untouched if
    /// it is already paid.
    pub fn mark_paid(&mut self, tx_hash: TxHash, paid_at: DateTime<Utc>) -> bool {
        if self.is_paid() {
            return false;
        }
        self.status = RequestStatus::Paid;
        self.settlement_tx_hash = Some(tx_hash);
        self.paid_at = Some(paid_at);
        true
    }

    /// Check that status, hash and payment time agree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] describing the inconsistency.
    pub fn validate(&self) -> Result<()> {
        let paid = self.is_paid();
        if paid != self.settlement_tx_hash.is_some() || paid != self.paid_at.is_some() {
            return Err(Error::Serialization(format!(
                "request {} is {} but txHash={:?} paidAt={:?}",
                self.id, self.status, self.settlement_tx_hash, self.paid_at
            )));
        }
        Ok(())
    }
}
