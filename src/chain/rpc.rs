//! JSON-RPC chain reader.
//!
//! Polls `eth_getLogs` for the token's `Transfer` events with the recipient
//! as the indexed `to` topic. A watch starts at the first block mined at or
//! after the requested time (bounded by `lookback_blocks`) and catches up in
//! ranges of at most `log_range_blocks` before following the head.

use crate::chain::{
    transfer_subscription, ChainReader, TransferEvent, TransferFeed, TransferReceipt,
    TransferSubscription, FEED_BUFFER,
};
use crate::config::ChainConfig;
use crate::error::{Error, Result};
use alloy::eips::BlockNumberOrTag;
use alloy::network::ReceiptResponse as _;
use alloy::primitives::{Address, TxHash};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

sol! {
    /// Minimal ERC-20 surface used for pay links.
    #[sol(rpc)]
    interface IERC20 {
        /// Emitted when `value` tokens move from `from` to `to`.
        event Transfer(address indexed from, address indexed to, uint256 value);

        /// Move `value` tokens from the caller to `to`.
        function transfer(address to, uint256 value) external returns (bool);
    }
}

/// Parse an RPC endpoint URL.
pub(crate) fn parse_rpc_url(raw: &str) -> Result<Url> {
    raw.parse::<Url>()
        .map_err(|e| Error::Config(format!("invalid RPC URL {raw}: {e}")))
}

/// [`ChainReader`] backed by an HTTP JSON-RPC node.
#[derive(Clone)]
pub struct RpcChainReader {
    provider: DynProvider,
    config: Arc<ChainConfig>,
}

impl RpcChainReader {
    /// Create a reader for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the RPC URL is malformed or a poll
    /// interval or range is zero.
    pub fn new(config: Arc<ChainConfig>) -> Result<Self> {
        config.validate()?;
        let url = parse_rpc_url(&config.rpc_url)?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        info!(
            "Chain reader using {} (chain {})",
            config.rpc_url, config.chain_id
        );
        Ok(Self { provider, config })
    }

    /// Confirm the endpoint serves the configured chain.
    ///
    /// # Errors
    ///
    /// [`Error::LogSource`] if the node is unreachable, [`Error::Config`] on a
    /// chain id mismatch.
    pub async fn verify_chain(&self) -> Result<()> {
        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| Error::LogSource(format!("eth_chainId failed: {e}")))?;
        if chain_id != self.config.chain_id {
            return Err(Error::Config(format!(
                "RPC endpoint serves chain {chain_id}, expected {}",
                self.config.chain_id
            )));
        }
        Ok(())
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(|e| Error::LogSource(format!("eth_getBlockByNumber({number}) failed: {e}")))?
            .ok_or_else(|| Error::LogSource(format!("block {number} not found")))?;
        Ok(block.header.timestamp)
    }
}

/// Lowest block in `low..end` whose timestamp is at least `target`, or `end`
/// if there is none. Block timestamps are non-decreasing.
async fn first_block_at_or_after<F, Fut>(
    target: u64,
    mut low: u64,
    mut end: u64,
    mut timestamp_of: F,
) -> Result<u64>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    while low < end {
        let mid = low + (end - low) / 2;
        if timestamp_of(mid).await? >= target {
            end = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(low)
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn watch_transfers(
        &self,
        token: Address,
        to: Address,
        since: DateTime<Utc>,
    ) -> Result<TransferSubscription> {
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| Error::LogSource(format!("eth_blockNumber failed: {e}")))?;

        let floor = head.saturating_sub(self.config.lookback_blocks);
        let target = u64::try_from(since.timestamp()).unwrap_or(0);
        let start =
            first_block_at_or_after(target, floor, head.saturating_add(1), |n| {
                self.block_timestamp(n)
            })
            .await?;
        if start == floor && floor > 0 {
            warn!("Watch for {to} limited to the last {} blocks", self.config.lookback_blocks);
        }

        let (subscription, feed) = transfer_subscription(FEED_BUFFER);
        let poller = LogPoller {
            provider: self.provider.clone(),
            token,
            recipient: to,
            next_block: start,
            range: self.config.log_range_blocks,
            interval: self.config.log_poll_interval(),
        };
        debug!("Watching Transfer(to={to}) on {token} from block {start} (head {head})");
        tokio::spawn(poller.run(feed));

        Ok(subscription)
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransferReceipt> {
        let mut ticker = tokio::time::interval(self.config.receipt_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let success = receipt.status();
                    info!(
                        "Receipt for {tx_hash}: {} in block {:?}",
                        if success { "success" } else { "reverted" },
                        receipt.block_number
                    );
                    return Ok(TransferReceipt {
                        transaction_hash: receipt.transaction_hash,
                        success,
                        block_number: receipt.block_number,
                    });
                }
                Ok(None) => debug!("Receipt for {tx_hash} not available yet"),
                // A submitted transaction cannot be withdrawn, so keep waiting.
                Err(e) => warn!("Receipt query for {tx_hash} failed: {e}"),
            }
        }
    }
}

/// Background task feeding one subscription.
struct LogPoller {
    provider: DynProvider,
    token: Address,
    recipient: Address,
    next_block: u64,
    range: u64,
    interval: Duration,
}

impl LogPoller {
    async fn run(mut self, feed: TransferFeed) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = feed.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.catch_up(&feed).await {
                break;
            }
        }
        debug!("Transfer watch for {} stopped", self.recipient);
    }

    /// Poll range after range until the head is reached. Returns false once
    /// the subscriber is gone.
    async fn catch_up(&mut self, feed: &TransferFeed) -> bool {
        loop {
            if feed.is_cancelled() {
                return false;
            }
            match self.poll_once().await {
                Ok((batch, behind)) => {
                    if !batch.is_empty() {
                        debug!("Delivering {} transfer(s) to {}", batch.len(), self.recipient);
                        if !feed.deliver(batch).await {
                            return false;
                        }
                    }
                    if !behind {
                        return true;
                    }
                }
                Err(e) => {
                    warn!("Transfer log poll failed: {e}");
                    return feed.report_error(e).await;
                }
            }
        }
    }

    /// Query the next range. The flag is true while the range ended short of
    /// the head.
    async fn poll_once(&mut self) -> Result<(Vec<TransferEvent>, bool)> {
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| Error::LogSource(format!("eth_blockNumber failed: {e}")))?;
        let Some(to_block) = next_range_end(self.next_block, head, self.range) else {
            return Ok((Vec::new(), false));
        };

        let filter = Filter::new()
            .address(self.token)
            .event_signature(IERC20::Transfer::SIGNATURE_HASH)
            .topic2(self.recipient.into_word())
            .from_block(self.next_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| Error::LogSource(format!("eth_getLogs failed: {e}")))?;

        self.next_block = to_block.saturating_add(1);
        Ok((logs.iter().filter_map(decode_transfer).collect(), to_block < head))
    }
}

/// Last block of the range starting at `from`, or `None` when `from` is past
/// the head.
fn next_range_end(from: u64, head: u64, range: u64) -> Option<u64> {
    (from <= head).then(|| head.min(from.saturating_add(range.max(1) - 1)))
}

fn decode_transfer(log: &Log) -> Option<TransferEvent> {
    let Some(transaction_hash) = log.transaction_hash else {
        debug!("Skipping pending log without transaction hash");
        return None;
    };
    match log.log_decode::<IERC20::Transfer>() {
        Ok(decoded) => {
            let transfer = decoded.inner.data;
            Some(TransferEvent {
                from: transfer.from,
                to: transfer.to,
                value: transfer.value,
                transaction_hash,
                block_number: log.block_number,
                log_index: log.log_index,
            })
        }
        Err(e) => {
            debug!("Skipping undecodable Transfer log in {transaction_hash}: {e}");
            None
        }
    }
}
