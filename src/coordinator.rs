//! Settlement coordinator.
//!
//! Drives one payment request from `Pending` to `Paid`. Two detection paths
//! converge on the store's single `mark_paid` transition:
//!
//! ```text
//!                load(id)
//!                   │
//!         ┌─────────┴─────────┐
//!      PENDING               PAID ──────────────────────────┐
//!         │                                                 │
//!         ▼                                                 │
//!     Watching ◀──── recoverable error ────┐                │
//!     │       │                            │                │
//!  passive  active (pay)                   │                │
//!  watch    connect → switch → send        │                │
//!  match    → receipt                      │                │
//!     │       │                            │                │
//!     └───┬───┘                            │                │
//!         ▼                                │                ▼
//!     Settling ── mark_paid ── error ──────┘              Paid
//!         │                                                 ▲
//!         └──────────────────── ok ─────────────────────────┘
//! ```
//!
//! The passive watch runs on its own task and is torn down once the request
//! is paid or the coordinator is shut down or dropped. The active path runs
//! on the caller's task; once a transfer is submitted it cannot be withdrawn.
//!
//! A transfer the watch has matched is remembered until it is recorded, and
//! `pay` settles with it instead of sending a second one. Only one `pay` may
//! be sending at a time.

use crate::chain::{ChainReader, TransferEvent, Wallet};
use crate::config::ChainConfig;
use crate::error::{Error, Result};
use crate::event::{
    create_event_channel, SettlementEvent, SettlementEventsChannel, SettlementEventsSender,
    SettlementSource,
};
use crate::matcher::TransferMatcher;
use crate::request::{PaymentRequest, RequestId};
use crate::store::RequestStore;
use alloy::primitives::{Address, TxHash};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a settlement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    /// No request loaded yet.
    Unloaded,
    /// Request is pending and awaiting a qualifying transfer.
    Watching,
    /// A qualifying transfer was seen; the store update is in flight.
    Settling,
    /// The store recorded the payment.
    Paid,
    /// The request no longer exists.
    Failed,
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Watching => "watching",
            Self::Settling => "settling",
            Self::Paid => "paid",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared between the coordinator and its watch task.
struct Shared<S, R> {
    store: Arc<S>,
    reader: Arc<R>,
    config: Arc<ChainConfig>,
    request: Mutex<Option<PaymentRequest>>,
    state: watch::Sender<SettlementState>,
    /// Set once the watch must end: request paid or session closed.
    stop: watch::Sender<bool>,
    closed: AtomicBool,
    watching: AtomicBool,
    /// Held while `pay` is connecting, sending or awaiting a receipt.
    sending: AtomicBool,
    /// First qualifying transfer the watch matched.
    observed: Mutex<Option<TxHash>>,
    events: SettlementEventsSender,
}

impl<S: RequestStore, R: ChainReader> Shared<S, R> {
    fn emit(&self, event: SettlementEvent) {
        let _ = self.events.send(event);
    }

    fn observe(&self, tx_hash: TxHash) {
        let mut observed = self.observed.lock();
        if observed.is_none() {
            debug!("Observed qualifying transfer {tx_hash}");
            *observed = Some(tx_hash);
        }
    }

    fn observed(&self) -> Option<TxHash> {
        *self.observed.lock()
    }

    /// Move to `next`. `Paid` is terminal.
    fn set_state(&self, next: SettlementState) {
        self.state.send_if_modified(|state| {
            if *state == next || *state == SettlementState::Paid {
                return false;
            }
            debug!("Settlement state {state} -> {next}");
            *state = next;
            true
        });
    }

    async fn settle(
        &self,
        id: &RequestId,
        tx_hash: TxHash,
        source: SettlementSource,
    ) -> Result<PaymentRequest> {
        self.set_state(SettlementState::Settling);

        let result = match self.store.mark_paid(id, tx_hash).await {
            Err(Error::StoreWriteConflict(reason)) => {
                warn!("Write conflict settling {id}: {reason}, reloading");
                match self.store.get(id).await {
                    Ok(record) if record.is_paid() => Ok(record),
                    _ => Err(Error::StoreWriteConflict(reason)),
                }
            }
            other => other,
        };

        match result {
            Ok(record) if record.is_paid() => Ok(self.finish(record, source)),
            Ok(record) => {
                let error = Error::StoreWriteConflict(format!(
                    "{id} is still {} after update",
                    record.status()
                ));
                self.fail_settlement(id, &error);
                Err(error)
            }
            Err(error) => {
                self.fail_settlement(id, &error);
                Err(error)
            }
        }
    }

    fn finish(&self, record: PaymentRequest, source: SettlementSource) -> PaymentRequest {
        *self.request.lock() = Some(record.clone());
        self.set_state(SettlementState::Paid);
        self.stop.send_replace(true);

        if let Some(tx_hash) = record.settlement_tx_hash() {
            info!("Request {} settled by {tx_hash} ({source:?})", record.id());
            self.emit(SettlementEvent::Settled {
                id: record.id().clone(),
                tx_hash,
                source,
            });
        }
        record
    }

    fn fail_settlement(&self, id: &RequestId, error: &Error) {
        warn!("Settlement of {id} failed: {error}");
        if matches!(error, Error::NotFound(_)) {
            self.set_state(SettlementState::Failed);
        } else {
            self.set_state(SettlementState::Watching);
        }
        self.emit(SettlementEvent::SettlementFailed {
            id: id.clone(),
            message: error.to_string(),
        });
    }
}

/// Coordinates passive and active settlement of one payment request.
pub struct SettlementCoordinator<S, R, W> {
    shared: Arc<Shared<S, R>>,
    wallet: Arc<W>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, R, W> SettlementCoordinator<S, R, W>
where
    S: RequestStore + 'static,
    R: ChainReader + 'static,
    W: Wallet + 'static,
{
    /// Create a coordinator for requests on `config`'s chain.
    #[must_use]
    pub fn new(store: Arc<S>, reader: Arc<R>, wallet: Arc<W>, config: Arc<ChainConfig>) -> Self {
        let (state, _) = watch::channel(SettlementState::Unloaded);
        let (stop, _) = watch::channel(false);
        let (events, _) = create_event_channel();

        Self {
            shared: Arc::new(Shared {
                store,
                reader,
                config,
                request: Mutex::new(None),
                state,
                stop,
                closed: AtomicBool::new(false),
                watching: AtomicBool::new(false),
                sending: AtomicBool::new(false),
                observed: Mutex::new(None),
                events,
            }),
            wallet,
            watch_task: Mutex::new(None),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SettlementState {
        *self.shared.state.borrow()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SettlementState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to settlement events.
    #[must_use]
    pub fn subscribe_events(&self) -> SettlementEventsChannel {
        self.shared.events.subscribe()
    }

    /// Read-only mirror of the loaded request.
    #[must_use]
    pub fn request(&self) -> Option<PaymentRequest> {
        self.shared.request.lock().clone()
    }

    /// Returns true while the passive watch is armed.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.shared.watching.load(Ordering::SeqCst)
    }

    /// Chain this coordinator settles on.
    #[must_use]
    pub fn config(&self) -> &ChainConfig {
        &self.shared.config
    }

    /// Fetch the request and start the passive watch if it is pending.
    ///
    /// Calling again refreshes the mirror. A coordinator owns a single
    /// request for its whole life.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] (state becomes `Failed`), [`Error::Config`] if the
    /// request is for another chain or another request is already loaded,
    /// [`Error::Cancelled`] after shutdown, or store transport errors.
    pub async fn load(&self, id: &RequestId) -> Result<PaymentRequest> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if let Some(current) = self.request() {
            if current.id() != id {
                return Err(Error::Config(format!(
                    "session already owns request {}",
                    current.id()
                )));
            }
        }

        let record = match self.shared.store.get(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load request {id}: {e}");
                if matches!(e, Error::NotFound(_)) {
                    self.shared.set_state(SettlementState::Failed);
                }
                return Err(e);
            }
        };

        if record.chain_id() != self.shared.config.chain_id {
            return Err(Error::Config(format!(
                "request {id} is on chain {}, this session watches chain {}",
                record.chain_id(),
                self.shared.config.chain_id
            )));
        }

        *self.shared.request.lock() = Some(record.clone());
        self.shared.emit(SettlementEvent::Loaded {
            id: id.clone(),
            status: record.status(),
        });

        if record.is_paid() {
            info!("Request {id} is already paid");
            self.shared.set_state(SettlementState::Paid);
            self.shared.stop.send_replace(true);
        } else {
            self.shared.set_state(SettlementState::Watching);
            self.start_watch(record.clone());
        }
        Ok(record)
    }

    fn start_watch(&self, request: PaymentRequest) {
        let mut task = self.watch_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if *self.shared.stop.borrow() {
            return;
        }
        self.shared.watching.store(true, Ordering::SeqCst);
        *task = Some(tokio::spawn(run_passive_watch(
            Arc::clone(&self.shared),
            request,
        )));
    }

    /// Send the requested transfer from the operator's wallet and settle on
    /// its receipt.
    ///
    /// Connects the wallet and switches it to the request's chain first; a
    /// send is never submitted on the wrong chain. Returns the record
    /// unchanged if it is already paid, and records the watched transfer
    /// instead of sending if one was already observed.
    ///
    /// # Errors
    ///
    /// [`Error::SettlementInProgress`] while another `pay` is sending, plus
    /// wallet, network, transfer and store errors. All are recoverable: the
    /// passive watch keeps running and the operator may retry.
    pub async fn pay(&self) -> Result<PaymentRequest> {
        let request = self
            .request()
            .ok_or_else(|| Error::NotFound("no payment request loaded".to_string()))?;
        if request.is_paid() {
            return Ok(request);
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if let Some(tx_hash) = self.shared.observed() {
            info!(
                "Transfer {tx_hash} already pays {}, recording it instead of sending",
                request.id()
            );
            return self
                .shared
                .settle(request.id(), tx_hash, SettlementSource::Watch)
                .await;
        }
        let Some(_sending) = SendGuard::acquire(&self.shared.sending) else {
            return Err(Error::SettlementInProgress(format!(
                "a transfer for {} is already being sent",
                request.id()
            )));
        };

        match self.send_and_confirm(&request).await {
            Ok((tx_hash, source)) => self.shared.settle(request.id(), tx_hash, source).await,
            Err(e) => {
                warn!("Payment of {} failed: {e}", request.id());
                self.shared.emit(SettlementEvent::SettlementFailed {
                    id: request.id().clone(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn send_and_confirm(
        &self,
        request: &PaymentRequest,
    ) -> Result<(TxHash, SettlementSource)> {
        let account = self.ensure_wallet_ready(request.chain_id()).await?;
        if let Some(tx_hash) = self.shared.observed() {
            info!("Transfer {tx_hash} arrived while preparing the wallet, not sending");
            return Ok((tx_hash, SettlementSource::Watch));
        }
        info!(
            "Sending {} to {} from {account}",
            request.amount(),
            request.recipient()
        );

        let tx_hash = self
            .wallet
            .send_token_transfer(
                request.token_address(),
                request.recipient(),
                request.amount(),
            )
            .await?;
        self.shared.emit(SettlementEvent::TransferSubmitted {
            id: request.id().clone(),
            tx_hash,
        });

        let receipt = self.shared.reader.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(Error::TransferRejected(format!(
                "transaction {tx_hash} reverted"
            )));
        }
        Ok((receipt.transaction_hash, SettlementSource::Send))
    }

    async fn ensure_wallet_ready(&self, chain_id: u64) -> Result<Address> {
        let account = self.wallet.connect().await?;
        let active = self.wallet.chain_id().await?;
        if active == chain_id {
            return Ok(account);
        }

        info!("Wallet is on chain {active}, switching to {chain_id}");
        match self.wallet.switch_chain(chain_id).await {
            Ok(()) => {}
            Err(Error::ConnectionRejected(reason)) => {
                warn!("Network switch declined: {reason}");
                return Err(Error::WrongNetwork {
                    expected: chain_id,
                    actual: active,
                });
            }
            Err(e) => return Err(e),
        }

        let switched = self.wallet.chain_id().await?;
        if switched != chain_id {
            return Err(Error::WrongNetwork {
                expected: chain_id,
                actual: switched,
            });
        }
        Ok(account)
    }

    /// Wait until the request is paid.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the request disappears, [`Error::Cancelled`]
    /// if the session is shut down first.
    pub async fn wait_until_paid(&self) -> Result<PaymentRequest> {
        let mut state = self.shared.state.subscribe();
        let mut stop = self.shared.stop.subscribe();

        loop {
            let current = *state.borrow_and_update();
            match current {
                SettlementState::Paid => return self.request().ok_or(Error::Cancelled),
                SettlementState::Failed => {
                    return Err(Error::NotFound(
                        "payment request no longer exists".to_string(),
                    ))
                }
                _ => {}
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                () = stopped(&mut stop) => {}
            }
        }
    }

    /// Tear down the passive watch and refuse further work.
    pub fn shutdown(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("Settlement session shutting down");
        }
        self.shared.stop.send_replace(true);
    }
}

impl<S, R, W> Drop for SettlementCoordinator<S, R, W> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stop.send_replace(true);
    }
}

/// Marks a `pay` as sending until dropped.
struct SendGuard<'a>(&'a AtomicBool);

impl<'a> SendGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::SeqCst)).then_some(Self(flag))
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn run_passive_watch<S, R>(shared: Arc<Shared<S, R>>, request: PaymentRequest)
where
    S: RequestStore,
    R: ChainReader,
{
    let id = request.id().clone();
    let mut stop = shared.stop.subscribe();
    shared.emit(SettlementEvent::WatchStarted { id: id.clone() });
    info!(
        "Watching {} for {} to {}",
        request.token_address(),
        request.amount(),
        request.recipient()
    );

    tokio::select! {
        () = stopped(&mut stop) => debug!("Watch for {id} stopped"),
        () = watch_until_settled(&shared, &request) => {}
    }

    shared.watching.store(false, Ordering::SeqCst);
    shared.emit(SettlementEvent::WatchStopped { id });
}

async fn watch_until_settled<S, R>(shared: &Shared<S, R>, request: &PaymentRequest)
where
    S: RequestStore,
    R: ChainReader,
{
    let matcher = TransferMatcher::for_request(request);
    let retry_delay = shared.config.log_poll_interval();
    let id = request.id();
    let mut unsettled: Option<TransferEvent> = None;

    loop {
        let transfer = if let Some(transfer) = unsettled.take() {
            transfer
        } else {
            let mut subscription = match shared
                .reader
                .watch_transfers(
                    request.token_address(),
                    request.recipient(),
                    request.created_at(),
                )
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!("Could not watch transfers for {id}: {e}");
                    shared.emit(SettlementEvent::WatchError {
                        id: id.clone(),
                        message: e.to_string(),
                    });
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
            };

            let matched = matcher
                .run(&mut subscription, |e| {
                    shared.emit(SettlementEvent::WatchError {
                        id: id.clone(),
                        message: e.to_string(),
                    });
                })
                .await;
            match matched {
                Some(transfer) => {
                    shared.observe(transfer.transaction_hash);
                    transfer
                }
                None => {
                    warn!("Transfer feed for {id} ended, resubscribing");
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
            }
        };

        match shared
            .settle(id, transfer.transaction_hash, SettlementSource::Watch)
            .await
        {
            Ok(_) => return,
            Err(e) if !e.is_recoverable() => return,
            Err(_) => {
                unsettled = Some(transfer);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
