//! Links presented alongside a pay link.

use crate::config::ChainConfig;
use crate::request::{PaymentRequest, RequestId};
use alloy::primitives::{Address, TxHash};

/// EIP-681 URI invoking `transfer(recipient, amount)` on the request's token.
///
/// Wallets scanning this as a QR code prefill the exact transfer.
#[must_use]
pub fn transfer_uri(request: &PaymentRequest) -> String {
    format!(
        "ethereum:{}/transfer?address={}&uint256={}",
        request.token_address(),
        request.recipient(),
        request.amount()
    )
}

/// Explorer page for a token contract.
#[must_use]
pub fn explorer_token_url(chain: &ChainConfig, token: Address) -> String {
    format!("{}/token/{token}", chain.explorer_base.trim_end_matches('/'))
}

/// Explorer page for a transaction.
#[must_use]
pub fn explorer_tx_url(chain: &ChainConfig, tx_hash: TxHash) -> String {
    format!("{}/tx/{tx_hash}", chain.explorer_base.trim_end_matches('/'))
}

/// Shareable pay-link page.
#[must_use]
pub fn pay_link_url(link_base: &str, id: &RequestId) -> String {
    format!("{}/pay/{id}", link_base.trim_end_matches('/'))
}
