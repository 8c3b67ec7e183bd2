//! # paylink
//!
//! Stablecoin pay links with on-chain settlement detection.
//!
//! A recipient creates a payment request for an exact amount of an ERC-20
//! token. The request is then settled by either of two paths:
//! - **Watch**: a third party transfers the exact amount to the recipient and
//!   the transfer is observed in the token's log
//! - **Send**: the operator pays from their own wallet and the transfer is
//!   confirmed by its receipt
//!
//! Both paths converge on a single first-write-wins `mark_paid` in the
//! request store.
//!
//! ## Architecture
//!
//! - [`amount`]: decimal string to atomic units and back
//! - [`store`]: the persistence service contract and its clients
//! - [`matcher`]: picks the transfer that settles a request
//! - [`coordinator`]: drives one request from pending to paid
//! - [`chain`]: transfer log, receipt and wallet access over JSON-RPC
//!
//! ## Example
//!
//! ```rust,no_run
//! use paylink::chain::{LocalWallet, RpcChainReader};
//! use paylink::store::HttpRequestStore;
//! use paylink::{PaylinkConfig, RequestId, SettlementCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(PaylinkConfig::default());
//!     let chain = Arc::new(config.chain.clone());
//!     let store = Arc::new(HttpRequestStore::new(&config.store)?);
//!     let reader = Arc::new(RpcChainReader::new(Arc::clone(&chain))?);
//!     let wallet = Arc::new(LocalWallet::new(None, Arc::clone(&config))?);
//!
//!     let coordinator = SettlementCoordinator::new(store, reader, wallet, chain);
//!     coordinator.load(&RequestId::new("abc")).await?;
//!     let paid = coordinator.wait_until_paid().await?;
//!     println!("paid by {:?}", paid.settlement_tx_hash());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod amount;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod matcher;
pub mod request;
pub mod store;
pub mod uri;

pub use amount::{to_atomic, to_decimal, to_display, USDC_DECIMALS};
pub use chain::{ChainReader, TransferEvent, TransferReceipt, TransferSubscription, Wallet};
pub use config::{ChainConfig, PaylinkConfig, StoreConfig, WalletConfig};
pub use coordinator::{SettlementCoordinator, SettlementState};
pub use error::{Error, Result};
pub use event::{SettlementEvent, SettlementEventsChannel, SettlementSource};
pub use matcher::TransferMatcher;
pub use request::{NewPaymentRequest, PaymentRequest, RequestId, RequestStatus};
pub use store::{RequestStore, RequestStoreClient};
