//! Configuration for paylink.
//!
//! The configuration is an immutable value built once at startup and handed
//! to the chain reader, wallet and coordinator. Nothing reads ambient state.

use crate::amount::{MAX_DECIMALS, USDC_DECIMALS};
use crate::error::{Error, Result};
use alloy::primitives::{address, Address};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaylinkConfig {
    /// Public base URL under which pay links are served.
    #[serde(default = "default_link_base")]
    pub link_base: String,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Network and token settings.
    #[serde(default)]
    pub chain: ChainConfig,

    /// Persistence service settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Wallet settings.
    #[serde(default)]
    pub wallet: WalletConfig,
}

/// Network and token configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier (EIP-155).
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// ERC-20 token contract requested by new pay links.
    #[serde(default = "default_token_address")]
    pub token_address: Address,

    /// Token decimal precision.
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,

    /// Token ticker used in display.
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,

    /// Block explorer base URL.
    #[serde(default = "default_explorer_base")]
    pub explorer_base: String,

    /// How often the log source polls for new transfers, in milliseconds.
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,

    /// How often receipts are polled while awaiting confirmation, in milliseconds.
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,

    /// Furthest a watch reaches back for transfers made before it started.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,

    /// Widest block range asked of the node in one `eth_getLogs` call.
    #[serde(default = "default_log_range_blocks")]
    pub log_range_blocks: u64,
}

/// Persistence service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the pay-link collection, e.g. `http://localhost:3000/api/paylinks`.
    #[serde(default = "default_store_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Wallet configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Extra networks the wallet may switch to, besides `chain`.
    #[serde(default)]
    pub networks: Vec<NetworkEndpoint>,
}

/// A network the wallet knows how to reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    /// Chain identifier.
    pub chain_id: u64,
    /// JSON-RPC endpoint.
    pub rpc_url: String,
}

impl Default for PaylinkConfig {
    fn default() -> Self {
        Self {
            link_base: default_link_base(),
            log_level: default_log_level(),
            chain: ChainConfig::default(),
            store: StoreConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            rpc_url: default_rpc_url(),
            token_address: default_token_address(),
            token_decimals: default_token_decimals(),
            token_symbol: default_token_symbol(),
            explorer_base: default_explorer_base(),
            log_poll_interval_ms: default_log_poll_interval_ms(),
            receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
            lookback_blocks: default_lookback_blocks(),
            log_range_blocks: default_log_range_blocks(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

const fn default_chain_id() -> u64 {
    11_155_111 // Sepolia
}

fn default_rpc_url() -> String {
    "https://ethereum-sepolia-rpc.publicnode.com".to_string()
}

fn default_token_address() -> Address {
    // Circle USDC on Sepolia
    address!("1c7d4b196cb0c7b01d743fbc6116a902379c7238")
}

const fn default_token_decimals() -> u8 {
    USDC_DECIMALS
}

fn default_token_symbol() -> String {
    "USDC".to_string()
}

fn default_explorer_base() -> String {
    "https://sepolia.etherscan.io".to_string()
}

const fn default_log_poll_interval_ms() -> u64 {
    4_000
}

const fn default_receipt_poll_interval_ms() -> u64 {
    2_000
}

const fn default_lookback_blocks() -> u64 {
    50_400 // about a week of 12s blocks
}

const fn default_log_range_blocks() -> u64 {
    2_000
}

fn default_store_url() -> String {
    "http://localhost:3000/api/paylinks".to_string()
}

const fn default_request_timeout() -> u64 {
    30
}

fn default_link_base() -> String {
    "http://localhost:3000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ChainConfig {
    /// Interval between log polls.
    #[must_use]
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }

    /// Interval between receipt polls.
    #[must_use]
    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    /// Check the values the chain reader depends on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.token_decimals > MAX_DECIMALS {
            return Err(Error::Config(format!(
                "chain.token_decimals must be at most {MAX_DECIMALS}"
            )));
        }
        if self.log_poll_interval_ms == 0 || self.receipt_poll_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be non-zero".to_string()));
        }
        if self.log_range_blocks == 0 {
            return Err(Error::Config("chain.log_range_blocks must be non-zero".to_string()));
        }
        if self.rpc_url.is_empty() {
            return Err(Error::Config("chain.rpc_url is empty".to_string()));
        }
        Ok(())
    }
}

impl PaylinkConfig {
    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "paylink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("paylink.toml"))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.chain.validate()?;
        if self.store.base_url.is_empty() {
            return Err(Error::Config("store.base_url is empty".to_string()));
        }
        Ok(())
    }

    /// RPC endpoint for a chain, if one is configured.
    #[must_use]
    pub fn endpoint_for(&self, chain_id: u64) -> Option<&str> {
        if chain_id == self.chain.chain_id {
            return Some(&self.chain.rpc_url);
        }
        self.wallet
            .networks
            .iter()
            .find(|n| n.chain_id == chain_id)
            .map(|n| n.rpc_url.as_str())
    }
}
