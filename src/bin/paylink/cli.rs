//! Command-line interface definition.

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use paylink::PaylinkConfig;
use std::path::PathBuf;

/// Create stablecoin pay links and settle them on-chain.
#[derive(Parser, Debug)]
#[command(name = "paylink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, global = true, env = "PAYLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level.
    #[arg(long, default_value = "info", global = true, env = "RUST_LOG")]
    pub log_level: String,

    /// JSON-RPC endpoint of the settlement chain.
    #[arg(long, global = true, env = "PAYLINK_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Base URL of the pay-link persistence service.
    #[arg(long, global = true, env = "PAYLINK_STORE_URL")]
    pub store_url: Option<String>,

    /// Settlement chain id.
    #[arg(long, global = true, env = "PAYLINK_CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// ERC-20 token contract.
    #[arg(long, global = true, env = "PAYLINK_TOKEN")]
    pub token_address: Option<Address>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Pay-link operations.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a pay link.
    Create {
        /// Recipient address.
        #[arg(long)]
        to: String,
        /// Amount as a decimal string, e.g. "10.00".
        #[arg(long)]
        amount: String,
    },

    /// Show a pay link and its status.
    Status {
        /// Request identifier.
        id: String,
    },

    /// Watch the chain until a pay link is settled.
    Watch {
        /// Request identifier.
        id: String,
    },

    /// Pay a pay link from a local key.
    Pay {
        /// Request identifier.
        id: String,
        /// Hex private key of the paying account.
        #[arg(long, env = "PAYLINK_PRIVATE_KEY", hide_env_values = true)]
        private_key: String,
    },
}

impl Cli {
    /// Build the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded,
    /// or the overrides make it invalid.
    pub fn to_config(&self) -> color_eyre::Result<PaylinkConfig> {
        let mut config = match &self.config {
            Some(path) => PaylinkConfig::from_file(path)?,
            None => {
                let path = PaylinkConfig::default_path();
                if path.exists() {
                    PaylinkConfig::from_file(&path)?
                } else {
                    PaylinkConfig::default()
                }
            }
        };

        if let Some(rpc_url) = &self.rpc_url {
            config.chain.rpc_url.clone_from(rpc_url);
        }
        if let Some(store_url) = &self.store_url {
            config.store.base_url.clone_from(store_url);
        }
        if let Some(chain_id) = self.chain_id {
            config.chain.chain_id = chain_id;
        }
        if let Some(token_address) = self.token_address {
            config.chain.token_address = token_address;
        }
        config.log_level.clone_from(&self.log_level);

        config.validate()?;
        Ok(config)
    }
}
