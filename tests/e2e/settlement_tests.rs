//! Settlement scenarios: passive watch, active send, and their races.

use super::chain::transfer;
use super::harness::{recipient, token, tx, wait_for_event, within, TestHarness, CHAIN_ID};
use alloy::primitives::U256;
use paylink::{
    Error, RequestId, RequestStatus, RequestStore, SettlementEvent, SettlementSource,
    SettlementState,
};
use std::time::Duration;

const TEN_USDC: u64 = 10_000_000;

#[tokio::test]
async fn test_create_converts_to_atomic_units() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;

    assert_eq!(request.amount(), U256::from(TEN_USDC));
    assert_eq!(request.status(), RequestStatus::Pending);
    assert_eq!(request.recipient(), recipient());
    assert_eq!(request.token_address(), token());
    assert_eq!(request.chain_id(), CHAIN_ID);
    assert!(request.settlement_tx_hash().is_none());
}

#[tokio::test]
async fn test_passive_watch_settles_exact_transfer() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let mut events = coordinator.subscribe_events();

    coordinator.load(request.id()).await.unwrap();
    assert_eq!(coordinator.state(), SettlementState::Watching);
    assert!(coordinator.is_watching());
    harness.chain.wait_for_subscribers(1).await;

    let hash = tx(&[0x0a, 0xbc]);
    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, hash)])
        .await;

    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert_eq!(coordinator.state(), SettlementState::Paid);

    let stored = harness.stored(request.id()).await;
    assert_eq!(stored.status(), RequestStatus::Paid);
    assert_eq!(stored.settlement_tx_hash(), Some(hash));

    let settled = wait_for_event(&mut events, |e| matches!(e, SettlementEvent::Settled { .. })).await;
    assert!(matches!(
        settled,
        SettlementEvent::Settled { source: SettlementSource::Watch, tx_hash, .. } if tx_hash == hash
    ));

    // Watch is torn down once paid.
    wait_for_event(&mut events, |e| matches!(e, SettlementEvent::WatchStopped { .. })).await;
    harness.chain.wait_for_subscribers(0).await;
    assert!(!coordinator.is_watching());
}

#[tokio::test]
async fn test_underpayment_is_ignored() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    harness
        .chain
        .deliver(vec![
            transfer(recipient(), 9_990_000, tx(&[0x01])),
            transfer(recipient(), TEN_USDC + 1, tx(&[0x02])),
            transfer(token(), TEN_USDC, tx(&[0x03])),
        ])
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(coordinator.state(), SettlementState::Watching);
    assert_eq!(harness.stored(request.id()).await.status(), RequestStatus::Pending);
    assert_eq!(harness.store.mark_paid_calls(), 0);
    assert_eq!(harness.chain.active_subscribers(), 1);

    // A later exact transfer still settles.
    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, tx(&[0x04]))])
        .await;
    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(tx(&[0x04])));
}

#[tokio::test]
async fn test_active_pay_settles_on_receipt() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let mut events = coordinator.subscribe_events();
    let hash = tx(&[0x0d, 0xef]);
    harness.chain.script(|s| s.next_tx_hash = hash);

    coordinator.load(request.id()).await.unwrap();
    let paid = coordinator.pay().await.unwrap();

    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert_eq!(coordinator.state(), SettlementState::Paid);
    assert_eq!(
        harness.stored(request.id()).await.settlement_tx_hash(),
        Some(hash)
    );

    let sent = harness.chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].token, token());
    assert_eq!(sent[0].to, recipient());
    assert_eq!(sent[0].amount, U256::from(TEN_USDC));
    assert_eq!(sent[0].tx_hash, hash);

    wait_for_event(&mut events, |e| matches!(e, SettlementEvent::TransferSubmitted { .. })).await;
    let settled = wait_for_event(&mut events, |e| matches!(e, SettlementEvent::Settled { .. })).await;
    assert!(matches!(
        settled,
        SettlementEvent::Settled { source: SettlementSource::Send, .. }
    ));
}

#[tokio::test]
async fn test_pay_on_paid_request_sends_nothing() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();

    coordinator.load(request.id()).await.unwrap();
    coordinator.pay().await.unwrap();
    let again = coordinator.pay().await.unwrap();

    assert!(again.is_paid());
    assert_eq!(harness.chain.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_watch_and_send_settle_once() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let hash = tx(&[0x0d, 0xef]);
    harness.chain.script(|s| {
        s.next_tx_hash = hash;
        s.echo_sends = true;
    });

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    // The operator's own transfer also shows up in the log the watch reads.
    let paid = coordinator.pay().await.unwrap();
    let waited = within(coordinator.wait_until_paid()).await.unwrap();

    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert_eq!(waited.settlement_tx_hash(), Some(hash));
    assert_eq!(harness.chain.sent().len(), 1);
    assert_eq!(
        harness.stored(request.id()).await.settlement_tx_hash(),
        Some(hash)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_transfers_record_first_write() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let sent_hash = tx(&[0x0d, 0xef]);
    let observed_hash = tx(&[0x0a, 0xbc]);
    harness.chain.script(|s| s.next_tx_hash = sent_hash);

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    let (paid, _) = tokio::join!(
        coordinator.pay(),
        harness
            .chain
            .deliver(vec![transfer(recipient(), TEN_USDC, observed_hash)])
    );
    let paid = paid.unwrap();
    let stored = harness.stored(request.id()).await;

    // Whichever wrote first is final, and both paths agree on it.
    let winner = stored.settlement_tx_hash().unwrap();
    assert!(winner == sent_hash || winner == observed_hash);
    assert_eq!(paid.settlement_tx_hash(), Some(winner));
    let waited = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(waited.settlement_tx_hash(), Some(winner));
}

#[tokio::test]
async fn test_already_paid_skips_watch() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let hash = tx(&[0x0a, 0xbc]);
    harness
        .store
        .memory()
        .mark_paid(request.id(), hash)
        .await
        .unwrap();

    let coordinator = harness.coordinator();
    let loaded = coordinator.load(request.id()).await.unwrap();

    assert!(loaded.is_paid());
    assert_eq!(coordinator.state(), SettlementState::Paid);
    assert!(!coordinator.is_watching());
    assert_eq!(harness.chain.active_subscribers(), 0);

    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert!(coordinator.pay().await.unwrap().is_paid());
    assert!(harness.chain.sent().is_empty());
}

#[tokio::test]
async fn test_declined_network_switch_blocks_only_send() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness.chain.script(|s| {
        s.chain_id = 1;
        s.allow_switch = false;
    });

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    let result = coordinator.pay().await;
    assert!(matches!(
        result,
        Err(Error::WrongNetwork { expected: CHAIN_ID, actual: 1 })
    ));
    assert!(harness.chain.sent().is_empty());
    assert_eq!(coordinator.state(), SettlementState::Watching);

    // The passive path is unaffected.
    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, tx(&[0x0a, 0xbc]))])
        .await;
    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(tx(&[0x0a, 0xbc])));
}

#[tokio::test]
async fn test_network_switch_before_send() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness.chain.script(|s| s.chain_id = 1);

    coordinator.load(request.id()).await.unwrap();
    coordinator.pay().await.unwrap();

    assert_eq!(harness.chain.sent().len(), 1);
    assert_eq!(coordinator.state(), SettlementState::Paid);
}

#[tokio::test]
async fn test_rejected_connection_is_recoverable() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness.chain.script(|s| s.reject_connect = true);

    coordinator.load(request.id()).await.unwrap();
    let result = coordinator.pay().await;
    assert!(matches!(result, Err(Error::ConnectionRejected(_))));
    assert!(result.unwrap_err().is_recoverable());

    harness.chain.script(|s| s.reject_connect = false);
    assert!(coordinator.pay().await.unwrap().is_paid());
}

#[tokio::test]
async fn test_rejected_send_can_be_retried() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness.chain.script(|s| s.reject_send = true);

    coordinator.load(request.id()).await.unwrap();
    let result = coordinator.pay().await;
    assert!(matches!(result, Err(Error::TransferRejected(_))));
    assert_eq!(coordinator.state(), SettlementState::Watching);
    assert!(coordinator.is_watching());
    assert_eq!(harness.stored(request.id()).await.status(), RequestStatus::Pending);

    harness.chain.script(|s| s.reject_send = false);
    let paid = coordinator.pay().await.unwrap();
    assert!(paid.is_paid());
}

#[tokio::test]
async fn test_reverted_transfer_does_not_settle() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness.chain.script(|s| s.revert = true);

    coordinator.load(request.id()).await.unwrap();
    let result = coordinator.pay().await;

    assert!(matches!(result, Err(Error::TransferRejected(_))));
    assert_eq!(harness.chain.sent().len(), 1);
    assert_eq!(harness.store.mark_paid_calls(), 0);
    assert_eq!(harness.stored(request.id()).await.status(), RequestStatus::Pending);
    assert_eq!(coordinator.state(), SettlementState::Watching);
}

#[tokio::test]
async fn test_log_error_keeps_watching() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let mut events = coordinator.subscribe_events();

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    harness.chain.push_error("connection reset").await;
    let error = wait_for_event(&mut events, |e| matches!(e, SettlementEvent::WatchError { .. })).await;
    assert!(matches!(
        error,
        SettlementEvent::WatchError { message, .. } if message.contains("connection reset")
    ));
    assert_eq!(coordinator.state(), SettlementState::Watching);

    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, tx(&[0x0a, 0xbc]))])
        .await;
    assert!(within(coordinator.wait_until_paid()).await.unwrap().is_paid());
}

#[tokio::test]
async fn test_drop_tears_down_watch() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    drop(coordinator);
    harness.chain.wait_for_subscribers(0).await;

    // Nothing is listening any more.
    let delivered = harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, tx(&[0x0a, 0xbc]))])
        .await;
    assert_eq!(delivered, 0);
    assert_eq!(harness.stored(request.id()).await.status(), RequestStatus::Pending);
}

#[tokio::test]
async fn test_shutdown_cancels_waiters() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    let (waited, ()) = tokio::join!(coordinator.wait_until_paid(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.shutdown();
    });
    assert!(matches!(waited, Err(Error::Cancelled)));
    harness.chain.wait_for_subscribers(0).await;
    assert!(matches!(coordinator.pay().await, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_missing_request_fails_load() {
    let harness = TestHarness::new();
    let coordinator = harness.coordinator();

    let result = coordinator.load(&RequestId::new("missing")).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(coordinator.state(), SettlementState::Failed);
    assert_eq!(harness.chain.active_subscribers(), 0);
}

#[tokio::test]
async fn test_deleted_request_fails_settlement() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;
    harness.store.memory().remove(request.id());

    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, tx(&[0x0a, 0xbc]))])
        .await;

    let result = within(coordinator.wait_until_paid()).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(coordinator.state(), SettlementState::Failed);
}

#[tokio::test]
async fn test_failed_mark_paid_leaves_request_pending() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness.store.fail_mark_paid(1);

    coordinator.load(request.id()).await.unwrap();
    let result = coordinator.pay().await;

    assert!(matches!(result, Err(Error::Store(_))));
    assert_eq!(harness.stored(request.id()).await.status(), RequestStatus::Pending);
    assert_eq!(coordinator.state(), SettlementState::Watching);
    assert!(!coordinator.request().unwrap().is_paid());
}

#[tokio::test]
async fn test_watch_retries_failed_mark_paid() {
    let harness = TestHarness::with_retry_interval(Duration::from_millis(100));
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let mut events = coordinator.subscribe_events();
    harness.store.fail_mark_paid(1);

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    let hash = tx(&[0x0a, 0xbc]);
    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, hash)])
        .await;

    wait_for_event(&mut events, |e| matches!(e, SettlementEvent::SettlementFailed { .. })).await;
    assert_eq!(harness.stored(request.id()).await.status(), RequestStatus::Pending);

    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert_eq!(harness.store.mark_paid_calls(), 2);
}

#[tokio::test]
async fn test_coordinator_owns_single_request() {
    let harness = TestHarness::new();
    let first = harness.create("10.00").await;
    let second = harness.create("5").await;
    let coordinator = harness.coordinator();

    coordinator.load(first.id()).await.unwrap();
    let result = coordinator.load(second.id()).await;
    assert!(matches!(result, Err(Error::Config(_))));

    // Reloading the same request refreshes without a second watch.
    coordinator.load(first.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;
}

#[tokio::test]
async fn test_pay_records_observed_transfer_instead_of_sending() {
    // Long retry so only `pay` can complete the settlement.
    let harness = TestHarness::with_retry_interval(Duration::from_secs(2));
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    let mut events = coordinator.subscribe_events();
    harness.store.fail_mark_paid(1);

    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;

    let hash = tx(&[0x0a, 0xbc]);
    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, hash)])
        .await;
    wait_for_event(&mut events, |e| matches!(e, SettlementEvent::SettlementFailed { .. })).await;
    assert_eq!(coordinator.state(), SettlementState::Watching);

    let paid = within(coordinator.pay()).await.unwrap();

    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert!(harness.chain.sent().is_empty());
    assert_eq!(harness.store.mark_paid_calls(), 2);
    assert_eq!(
        harness.stored(request.id()).await.settlement_tx_hash(),
        Some(hash)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_pay_while_sending_is_refused() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let coordinator = harness.coordinator();
    harness
        .chain
        .script(|s| s.receipt_delay = Duration::from_millis(200));

    coordinator.load(request.id()).await.unwrap();

    let (first, second) = within(async {
        tokio::join!(coordinator.pay(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coordinator.pay().await
        })
    })
    .await;

    assert!(first.unwrap().is_paid());
    assert!(matches!(second, Err(Error::SettlementInProgress(_))));
    assert!(second.unwrap_err().is_recoverable());
    assert_eq!(harness.chain.sent().len(), 1);

    // Once the first send is done, pay simply reports the paid record.
    assert!(coordinator.pay().await.unwrap().is_paid());
    assert_eq!(harness.chain.sent().len(), 1);
}

#[tokio::test]
async fn test_transfer_before_watch_started_is_detected() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    let hash = tx(&[0x0b, 0x01]);

    // Paid while no session was open.
    harness.chain.push_history(
        request.created_at() + chrono::Duration::seconds(30),
        transfer(recipient(), TEN_USDC, hash),
    );

    let coordinator = harness.coordinator();
    coordinator.load(request.id()).await.unwrap();

    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(hash));
    assert!(harness.chain.sent().is_empty());
}

#[tokio::test]
async fn test_transfer_before_request_created_is_ignored() {
    let harness = TestHarness::new();
    let request = harness.create("10.00").await;
    harness.chain.push_history(
        request.created_at() - chrono::Duration::minutes(5),
        transfer(recipient(), TEN_USDC, tx(&[0x0b, 0x02])),
    );

    let coordinator = harness.coordinator();
    coordinator.load(request.id()).await.unwrap();
    harness.chain.wait_for_subscribers(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.state(), SettlementState::Watching);

    let hash = tx(&[0x0b, 0x03]);
    harness
        .chain
        .deliver(vec![transfer(recipient(), TEN_USDC, hash)])
        .await;
    let paid = within(coordinator.wait_until_paid()).await.unwrap();
    assert_eq!(paid.settlement_tx_hash(), Some(hash));
}
