//! Transfer log matcher.
//!
//! Reports the first transfer whose destination is the request's recipient
//! and whose value is exactly the requested amount. Overpayments and
//! underpayments never match, and partial payments are not summed.

use crate::chain::{TransferEvent, TransferSubscription};
use crate::error::Error;
use crate::request::PaymentRequest;
use alloy::primitives::{Address, U256};
use tracing::{debug, info, warn};

/// Single-shot detector for one payment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMatcher {
    recipient: Address,
    amount: U256,
}

impl TransferMatcher {
    /// Match transfers of exactly `amount` to `recipient`.
    #[must_use]
    pub fn new(recipient: Address, amount: U256) -> Self {
        Self { recipient, amount }
    }

    /// Matcher for a stored request.
    #[must_use]
    pub fn for_request(request: &PaymentRequest) -> Self {
        Self::new(request.recipient(), request.amount())
    }

    /// Returns true if `transfer` settles the request.
    #[must_use]
    pub fn matches(&self, transfer: &TransferEvent) -> bool {
        transfer.to == self.recipient && transfer.value == self.amount
    }

    /// Pick the qualifying transfer from one delivered batch.
    ///
    /// When every qualifying entry carries a chain position the earliest
    /// confirmed wins; otherwise delivery order decides.
    #[must_use]
    pub fn first_match<'a>(&self, batch: &'a [TransferEvent]) -> Option<&'a TransferEvent> {
        let candidates: Vec<&TransferEvent> = batch.iter().filter(|t| self.matches(t)).collect();

        if candidates.iter().all(|t| t.position().is_some()) {
            candidates.into_iter().min_by_key(|t| t.position())
        } else {
            candidates.into_iter().next()
        }
    }

    /// Consume batches until a match arrives, then cancel the subscription.
    ///
    /// Log source errors are handed to `on_error` and the watch continues.
    /// Returns `None` if the subscription ends without a match.
    pub async fn run<F>(
        &self,
        subscription: &mut TransferSubscription,
        mut on_error: F,
    ) -> Option<TransferEvent>
    where
        F: FnMut(&Error) + Send,
    {
        while let Some(batch) = subscription.next_batch().await {
            match batch {
                Ok(transfers) => {
                    if let Some(found) = self.first_match(&transfers) {
                        let found = found.clone();
                        subscription.cancel();
                        info!(
                            "Matched transfer {} of {} to {}",
                            found.transaction_hash, found.value, found.to
                        );
                        return Some(found);
                    }
                    debug!(
                        "No match among {} transfer(s) to {}",
                        transfers.len(),
                        self.recipient
                    );
                }
                Err(e) => {
                    warn!("Transfer watch error, still watching: {e}");
                    on_error(&e);
                }
            }
        }
        None
    }
}
