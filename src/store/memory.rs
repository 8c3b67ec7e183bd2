//! In-process request store.

use crate::error::{Error, Result};
use crate::request::{NewPaymentRequest, PaymentRequest, RequestId};
use crate::store::RequestStore;
use alloy::primitives::TxHash;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// [`RequestStore`] keeping records in memory.
///
/// `mark_paid` runs under one lock, so concurrent callers see exactly one
/// winner.
#[derive(Clone, Default)]
pub struct MemoryRequestStore {
    records: Arc<Mutex<HashMap<RequestId, PaymentRequest>>>,
}

impl MemoryRequestStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, replacing any with the same id.
    pub fn insert(&self, request: PaymentRequest) {
        self.records.lock().insert(request.id().clone(), request);
    }

    /// Delete a record.
    pub fn remove(&self, id: &RequestId) -> Option<PaymentRequest> {
        self.records.lock().remove(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, request: NewPaymentRequest) -> Result<PaymentRequest> {
        let record = PaymentRequest::pending(RequestId::generate(), request, Utc::now());
        self.insert(record.clone());
        Ok(record)
    }

    async fn get(&self, id: &RequestId) -> Result<PaymentRequest> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn mark_paid(&self, id: &RequestId, tx_hash: TxHash) -> Result<PaymentRequest> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if record.mark_paid(tx_hash, Utc::now()) {
            info!("Request {id} paid by {tx_hash}");
        } else {
            debug!(
                "Request {id} already paid by {:?}, ignoring {tx_hash}",
                record.settlement_tx_hash()
            );
        }
        Ok(record.clone())
    }
}
