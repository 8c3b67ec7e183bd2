//! Local-key wallet.
//!
//! Holds an operator's signing key and an RPC connection for the active
//! network. Switching networks reconnects to another configured endpoint;
//! a chain with no configured endpoint cannot be switched to.

use crate::chain::rpc::{parse_rpc_url, IERC20};
use crate::chain::Wallet;
use crate::config::PaylinkConfig;
use crate::error::{Error, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ActiveNetwork {
    chain_id: u64,
    provider: DynProvider,
}

/// [`Wallet`] signing with a locally held private key.
pub struct LocalWallet {
    signer: Option<PrivateKeySigner>,
    config: Arc<PaylinkConfig>,
    active: RwLock<Option<ActiveNetwork>>,
}

impl LocalWallet {
    /// Create a wallet from an optional hex private key.
    ///
    /// Without a key the wallet exists but every operation reports
    /// [`Error::WalletUnavailable`]; watching still works.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key is not a valid secp256k1 key.
    pub fn new(private_key: Option<&str>, config: Arc<PaylinkConfig>) -> Result<Self> {
        let signer = private_key
            .map(|key| {
                key.trim()
                    .parse::<PrivateKeySigner>()
                    .map_err(|e| Error::Config(format!("invalid private key: {e}")))
            })
            .transpose()?;
        Ok(Self {
            signer,
            config,
            active: RwLock::new(None),
        })
    }

    /// Account address, if a key is configured.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        self.signer.as_ref().map(PrivateKeySigner::address)
    }

    fn signer(&self) -> Result<&PrivateKeySigner> {
        self.signer
            .as_ref()
            .ok_or_else(|| Error::WalletUnavailable("no signing key configured".to_string()))
    }

    fn active_provider(&self) -> Result<(u64, DynProvider)> {
        self.active
            .read()
            .as_ref()
            .map(|net| (net.chain_id, net.provider.clone()))
            .ok_or_else(|| Error::WalletUnavailable("wallet not connected".to_string()))
    }

    async fn open(&self, rpc_url: &str) -> Result<ActiveNetwork> {
        let wallet = EthereumWallet::from(self.signer()?.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(parse_rpc_url(rpc_url)?)
            .erased();
        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| Error::ConnectionRejected(format!("{rpc_url} unreachable: {e}")))?;
        Ok(ActiveNetwork { chain_id, provider })
    }
}

#[async_trait]
impl Wallet for LocalWallet {
    async fn connect(&self) -> Result<Address> {
        let address = self.signer()?.address();
        if self.active.read().is_some() {
            return Ok(address);
        }

        let network = self.open(&self.config.chain.rpc_url).await?;
        info!("Wallet {address} connected on chain {}", network.chain_id);
        *self.active.write() = Some(network);
        Ok(address)
    }

    async fn chain_id(&self) -> Result<u64> {
        self.active_provider().map(|(chain_id, _)| chain_id)
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<()> {
        let (current, _) = self.active_provider()?;
        if current == chain_id {
            return Ok(());
        }

        let Some(rpc_url) = self.config.endpoint_for(chain_id) else {
            warn!("No endpoint configured for chain {chain_id}");
            return Err(Error::WrongNetwork {
                expected: chain_id,
                actual: current,
            });
        };

        let network = self.open(rpc_url).await?;
        if network.chain_id != chain_id {
            return Err(Error::WrongNetwork {
                expected: chain_id,
                actual: network.chain_id,
            });
        }
        info!("Wallet switched from chain {current} to {chain_id}");
        *self.active.write() = Some(network);
        Ok(())
    }

    async fn send_token_transfer(
        &self,
        token: Address,
        to: Address,
        amount: U256,
    ) -> Result<TxHash> {
        let (chain_id, provider) = self.active_provider()?;
        debug!("Submitting transfer of {amount} to {to} via {token} on chain {chain_id}");

        let pending = IERC20::new(token, provider)
            .transfer(to, amount)
            .send()
            .await
            .map_err(|e| Error::TransferRejected(e.to_string()))?;
        let tx_hash = *pending.tx_hash();
        info!("Submitted transfer {tx_hash}");
        Ok(tx_hash)
    }
}
