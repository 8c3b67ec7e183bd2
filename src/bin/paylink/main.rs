//! paylink CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use paylink::chain::{LocalWallet, RpcChainReader};
use paylink::store::HttpRequestStore;
use paylink::uri::{explorer_token_url, explorer_tx_url, pay_link_url, transfer_uri};
use paylink::{
    to_display, PaylinkConfig, PaymentRequest, RequestId, RequestStoreClient, SettlementCoordinator,
    SettlementEvent,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Coordinator = SettlementCoordinator<HttpRequestStore, RpcChainReader, LocalWallet>;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("paylink v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(cli.to_config()?);
    let store = Arc::new(HttpRequestStore::new(&config.store)?);

    match cli.command {
        Command::Create { to, amount } => {
            let client = RequestStoreClient::new(store, Arc::new(config.chain.clone()));
            let request = client.create(&to, &amount).await?;
            print_request(&config, &request);
        }
        Command::Status { id } => {
            let client = RequestStoreClient::new(store, Arc::new(config.chain.clone()));
            let request = client.get(&RequestId::new(id)).await?;
            print_request(&config, &request);
        }
        Command::Watch { id } => {
            let coordinator = coordinator(&config, store, None)?;
            let request = coordinator.load(&RequestId::new(id)).await?;
            print_request(&config, &request);
            if !request.is_paid() {
                log_events(&coordinator);
                println!("Waiting for payment...");
                tokio::select! {
                    paid = coordinator.wait_until_paid() => print_request(&config, &paid?),
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, stopping watch");
                        coordinator.shutdown();
                    }
                }
            }
        }
        Command::Pay { id, private_key } => {
            let coordinator = coordinator(&config, store, Some(&private_key))?;
            let request = coordinator.load(&RequestId::new(id)).await?;
            if request.is_paid() {
                print_request(&config, &request);
            } else {
                log_events(&coordinator);
                let paid = coordinator.pay().await?;
                print_request(&config, &paid);
            }
        }
    }

    Ok(())
}

fn coordinator(
    config: &Arc<PaylinkConfig>,
    store: Arc<HttpRequestStore>,
    private_key: Option<&str>,
) -> color_eyre::Result<Coordinator> {
    let chain = Arc::new(config.chain.clone());
    let reader = Arc::new(RpcChainReader::new(Arc::clone(&chain))?);
    let wallet = Arc::new(LocalWallet::new(private_key, Arc::clone(config))?);
    Ok(SettlementCoordinator::new(store, reader, wallet, chain))
}

fn log_events(coordinator: &Coordinator) {
    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SettlementEvent::WatchStarted { id } => info!("Watching for payment of {id}"),
                SettlementEvent::WatchError { message, .. } => {
                    warn!("Watch error (still watching): {message}");
                }
                SettlementEvent::TransferSubmitted { tx_hash, .. } => {
                    info!("Submitted {tx_hash}, waiting for receipt");
                }
                SettlementEvent::SettlementFailed { message, .. } => {
                    warn!("Settlement failed: {message}");
                }
                _ => {}
            }
        }
    });
}

fn print_request(config: &PaylinkConfig, request: &PaymentRequest) {
    let chain = &config.chain;
    println!("Pay link:  {}", pay_link_url(&config.link_base, request.id()));
    println!(
        "Amount:    {} {}",
        to_display(request.amount(), chain.token_decimals),
        chain.token_symbol
    );
    println!("Recipient: {}", request.recipient());
    println!(
        "Token:     {}",
        explorer_token_url(chain, request.token_address())
    );
    println!("Status:    {}", request.status());
    match request.settlement_tx_hash() {
        Some(tx_hash) => println!("Tx:        {}", explorer_tx_url(chain, tx_hash)),
        None => println!("Pay with:  {}", transfer_uri(request)),
    }
}
