//! Payment request storage.
//!
//! Records live in an external persistence service. The core sees it only
//! through [`RequestStore`]: create, read, and the single `mark_paid`
//! transition, which must be first-write-wins.

mod http;
mod memory;

pub use http::HttpRequestStore;
pub use memory::MemoryRequestStore;

use crate::amount::to_atomic;
use crate::config::ChainConfig;
use crate::error::{Error, Result};
use crate::request::{NewPaymentRequest, PaymentRequest, RequestId};
use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Persistence collaborator contract.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Create a new `Pending` record. Never deduplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects or cannot be reached.
    async fn create(&self, request: NewPaymentRequest) -> Result<PaymentRequest>;

    /// Fetch a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has this id.
    async fn get(&self, id: &RequestId) -> Result<PaymentRequest>;

    /// Record the settling transaction.
    ///
    /// If the record is already paid this is a no-op returning it unchanged;
    /// a later hash never overwrites an earlier one.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the record is gone, [`Error::StoreWriteConflict`]
    /// if it changed underneath the update. A failed call leaves the status
    /// unchanged.
    async fn mark_paid(&self, id: &RequestId, tx_hash: TxHash) -> Result<PaymentRequest>;
}

/// Parse and canonicalize an account or contract address.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] for malformed input.
pub fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw.trim()).map_err(|e| Error::InvalidAddress(format!("{raw:?}: {e}")))
}

/// Validating front end to a [`RequestStore`].
///
/// Converts human input to atomic units before any store call, so invalid
/// amounts and addresses never reach the store.
pub struct RequestStoreClient<S> {
    store: Arc<S>,
    chain: Arc<ChainConfig>,
}

impl<S: RequestStore> RequestStoreClient<S> {
    /// Create a client issuing requests for the configured chain and token.
    #[must_use]
    pub fn new(store: Arc<S>, chain: Arc<ChainConfig>) -> Self {
        Self { store, chain }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a pay link for `amount` of the configured token.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAddress`] or [`Error::InvalidAmount`] for bad input
    /// (zero included), otherwise whatever the store reports.
    pub async fn create(&self, recipient: &str, amount: &str) -> Result<PaymentRequest> {
        self.create_for_token(
            recipient,
            amount,
            self.chain.token_address,
            self.chain.chain_id,
            self.chain.token_decimals,
        )
        .await
    }

    /// Create a pay link for an explicit token and chain.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create).
    pub async fn create_for_token(
        &self,
        recipient: &str,
        amount: &str,
        token_address: Address,
        chain_id: u64,
        decimals: u8,
    ) -> Result<PaymentRequest> {
        let recipient = parse_address(recipient)?;
        if recipient.is_zero() {
            return Err(Error::InvalidAddress(
                "recipient cannot be the zero address".to_string(),
            ));
        }

        let atomic = to_atomic(amount, decimals)?;
        if atomic.is_zero() {
            return Err(Error::InvalidAmount(format!(
                "{amount:?}: amount must be greater than zero"
            )));
        }

        let request = self
            .store
            .create(NewPaymentRequest {
                recipient,
                token_address,
                chain_id,
                amount: atomic,
            })
            .await?;
        info!(
            "Created pay link {} for {atomic} atomic units to {recipient} on chain {chain_id}",
            request.id()
        );
        Ok(request)
    }

    /// Fetch a record.
    ///
    /// # Errors
    ///
    /// As [`RequestStore::get`].
    pub async fn get(&self, id: &RequestId) -> Result<PaymentRequest> {
        self.store.get(id).await
    }

    /// Record the settling transaction.
    ///
    /// # Errors
    ///
    /// As [`RequestStore::mark_paid`].
    pub async fn mark_paid(&self, id: &RequestId, tx_hash: TxHash) -> Result<PaymentRequest> {
        self.store.mark_paid(id, tx_hash).await
    }
}
