//! End-to-end behavior tests for the swap state machine, dispatcher, sweeper, and
//! event pump, driven over mock chains with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{B256, U256};

use swap_oracle::chain::ChainRole;
use swap_oracle::contracts::{OracleCall, TradeState};
use swap_oracle::error::ChainError;
use swap_oracle::pump::EventPump;
use swap_oracle::testing::{
    payment_view, time_request, trade_view, SentCall, TestOracle,
};

const T0: u64 = 1_700_000_000;
const TRADE: u64 = 42;

fn stamp(call: &SentCall) -> u64 {
    match call.call {
        OracleCall::FulfillTime { timestamp, .. } => timestamp,
        _ => panic!("expected fulfillTime, got {:?}", call.call),
    }
}

fn request_id(call: &SentCall) -> B256 {
    match call.call {
        OracleCall::FulfillTime { request_id, .. } => request_id,
        _ => panic!("expected fulfillTime, got {:?}", call.call),
    }
}

/// Full two-phase happy path. Four fulfillTime calls, two per
/// chain, creation stamps synchronized to the asset leg's inception, and
/// no cancellation callback ever sent.
#[tokio::test]
async fn happy_path_two_phase_swap() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 3600))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xA2, 3600))
        .await;

    oracle.clock.advance(120);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xB1, 3600))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xB2, 3600))
        .await;

    let asset = oracle.asset_client.fulfillments();
    let payment = oracle.payment_client.fulfillments();
    assert_eq!(asset.len(), 2, "two stamps on the asset chain");
    assert_eq!(payment.len(), 2, "two stamps on the payment chain");

    assert_eq!(stamp(&asset[0]), T0);
    assert_eq!(stamp(&payment[0]), T0, "payment inception synced to asset");
    assert_eq!(stamp(&asset[1]), T0 + 120);
    assert_eq!(stamp(&payment[1]), T0 + 120);

    for client in [&oracle.asset_client, &oracle.payment_client] {
        assert!(client.failed_confirmations().is_empty());
        assert!(client.execution_timeouts().is_empty());
    }

    // both legs confirmed and paired
    let record = oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .unwrap();
    assert!(record.is_confirmation_phase);
    assert_eq!(record.confirmation_time, Some(T0 + 120));
    assert!(oracle.coordinator.pairs().get(U256::from(TRADE)).is_some());

    // a sweep inside the window takes no action
    oracle.sweeper.sweep_once().await;
    assert!(oracle.asset_client.failed_confirmations().is_empty());
    assert!(oracle.payment_client.execution_timeouts().is_empty());
}

/// Neither leg confirms within `duration`; the sweeper fires
/// exactly one handleFailedConfirmation per chain and removes both local
/// records.
#[tokio::test]
async fn creation_phase_timeout_cancels_both_legs() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 90))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xA2, 90))
        .await;

    oracle
        .asset_client
        .set_trade(trade_view(TRADE, TradeState::AwaitingConfirmation));
    oracle
        .payment_client
        .set_payment(payment_view(TRADE, TradeState::AwaitingConfirmation));

    oracle.clock.set(T0 + 135);
    oracle.sweeper.sweep_once().await;

    assert_eq!(oracle.asset_client.failed_confirmations().len(), 1);
    assert_eq!(oracle.payment_client.failed_confirmations().len(), 1);
    assert!(oracle.asset_client.execution_timeouts().is_empty());

    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_none());
    assert!(oracle
        .coordinator
        .store(ChainRole::Payment)
        .get(U256::from(TRADE))
        .is_none());
    assert!(oracle.coordinator.pairs().get(U256::from(TRADE)).is_none());

    // a second sweep sends nothing further
    oracle.sweeper.sweep_once().await;
    assert_eq!(oracle.asset_client.failed_confirmations().len(), 1);
}

/// Both legs confirm early, then the key reveal never happens;
/// at confirmation_time + duration the sweeper fires one
/// handleExecutionTimeout per chain, propagated through the pair.
#[tokio::test]
async fn execution_phase_timeout_propagates_to_peer() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 150))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xA2, 150))
        .await;

    oracle.clock.set(T0 + 15);
    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xB1, 150))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xB2, 150))
        .await;

    oracle
        .asset_client
        .set_trade(trade_view(TRADE, TradeState::Confirmed));
    oracle
        .payment_client
        .set_payment(payment_view(TRADE, TradeState::Confirmed));

    // inside the execution window nothing fires
    oracle.clock.set(T0 + 150);
    oracle.sweeper.sweep_once().await;
    assert!(oracle.asset_client.execution_timeouts().is_empty());

    oracle.clock.set(T0 + 180);
    oracle.sweeper.sweep_once().await;

    assert_eq!(oracle.asset_client.execution_timeouts().len(), 1);
    assert_eq!(oracle.payment_client.execution_timeouts().len(), 1);
    assert!(oracle.asset_client.failed_confirmations().is_empty());
    assert!(oracle.payment_client.failed_confirmations().is_empty());

    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_none());
    assert!(oracle.coordinator.pairs().get(U256::from(TRADE)).is_none());
}

/// Timeout inversion. The payment leg arrives with a longer
/// window than the asset leg; both legs are failed immediately and the
/// payment leg is never stamped.
#[tokio::test]
async fn timeout_inversion_fails_both_legs_without_stamping() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 300))
        .await;
    assert_eq!(oracle.asset_client.fulfillments().len(), 1);

    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xA2, 600))
        .await;

    assert!(
        oracle.payment_client.fulfillments().is_empty(),
        "inverted payment leg must never be stamped"
    );
    assert_eq!(oracle.asset_client.failed_confirmations().len(), 1);
    assert_eq!(oracle.payment_client.failed_confirmations().len(), 1);

    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_none());
    assert!(oracle
        .coordinator
        .store(ChainRole::Payment)
        .get(U256::from(TRADE))
        .is_none());
    assert!(oracle.coordinator.pairs().get(U256::from(TRADE)).is_none());

    assert_eq!(oracle.stats.read().await.double_spend_rejections, 1);
}

/// The symmetric inversion: equal durations are allowed.
#[tokio::test]
async fn equal_durations_pass_the_inversion_guard() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 300))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xA2, 300))
        .await;

    assert_eq!(oracle.payment_client.fulfillments().len(), 1);
    assert!(oracle.payment_client.failed_confirmations().is_empty());
}

/// Redelivering the same request id never produces a second on-chain
/// callback.
#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let oracle = TestOracle::new(T0);

    let event = time_request(TRADE, 0xA1, 3600);
    oracle.deliver(ChainRole::Asset, event.clone()).await;
    oracle.deliver(ChainRole::Asset, event).await;

    assert_eq!(oracle.asset_client.fulfillments().len(), 1);
}

/// A confirmation request arriving past the window is never stamped;
/// the pair is failed instead.
#[tokio::test]
async fn late_confirmation_is_not_stamped() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 90))
        .await;
    oracle
        .deliver(ChainRole::Payment, time_request(TRADE, 0xA2, 90))
        .await;

    oracle.clock.set(T0 + 200);
    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xB1, 90))
        .await;

    // only the two creation stamps exist
    assert_eq!(oracle.asset_client.fulfillments().len(), 1);
    assert_eq!(oracle.payment_client.fulfillments().len(), 1);
    assert_eq!(oracle.asset_client.failed_confirmations().len(), 1);
    assert_eq!(oracle.payment_client.failed_confirmations().len(), 1);
    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_none());
}

/// Two events for the same trade delivered back-to-back are processed
/// strictly in order, the second deferred until the first handler
/// finishes.
#[tokio::test]
async fn per_trade_events_are_serialized_fifo() {
    let oracle = TestOracle::new(T0);
    oracle
        .asset_client
        .set_send_delay(Duration::from_millis(50));

    oracle
        .dispatcher
        .dispatch(ChainRole::Asset, time_request(TRADE, 0xA1, 3600));
    oracle
        .dispatcher
        .dispatch(ChainRole::Asset, time_request(TRADE, 0xB1, 3600));

    // the second event must be queued while the first handler holds the slot
    assert_eq!(
        oracle
            .coordinator
            .store(ChainRole::Asset)
            .pending_event_count(),
        1
    );

    oracle.settle().await;

    let sent = oracle.asset_client.fulfillments();
    assert_eq!(sent.len(), 2);
    assert_eq!(request_id(&sent[0]), B256::repeat_byte(0xA1));
    assert_eq!(request_id(&sent[1]), B256::repeat_byte(0xB1));
}

/// Events for distinct trades are handled independently.
#[tokio::test]
async fn distinct_trades_interleave() {
    let oracle = TestOracle::new(T0);

    oracle
        .dispatcher
        .dispatch(ChainRole::Asset, time_request(1, 0x01, 3600));
    oracle
        .dispatcher
        .dispatch(ChainRole::Asset, time_request(2, 0x02, 3600));
    oracle.settle().await;

    assert_eq!(oracle.asset_client.fulfillments().len(), 2);
    assert_eq!(
        oracle.coordinator.store(ChainRole::Asset).trade_count(),
        2
    );
}

/// A terminal submit failure drops the local record instead of retrying
/// forever; the next event for the trade is treated as a fresh creation.
#[tokio::test]
async fn terminal_submit_error_drops_the_record() {
    let oracle = TestOracle::new(T0);
    oracle
        .asset_client
        .push_send_error(ChainError::Reverted("bad request id".into()));

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 3600))
        .await;

    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_none());
    assert_eq!(oracle.stats.read().await.asset.terminal_submit_errors, 1);

    // the next request starts over cleanly
    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA3, 3600))
        .await;
    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_some());
}

/// A sweeper that finds the leg already terminal on-chain drops the local
/// record without sending a redundant callback.
#[tokio::test]
async fn sweeper_skips_legs_already_terminal_onchain() {
    let oracle = TestOracle::new(T0);

    oracle
        .deliver(ChainRole::Asset, time_request(TRADE, 0xA1, 90))
        .await;
    oracle
        .asset_client
        .set_trade(trade_view(TRADE, TradeState::Failed));

    oracle.clock.set(T0 + 200);
    oracle.sweeper.sweep_once().await;

    assert!(oracle.asset_client.failed_confirmations().is_empty());
    assert!(oracle
        .coordinator
        .store(ChainRole::Asset)
        .get(U256::from(TRADE))
        .is_none());
}

/// After a restart the oracle resumes from the current head.
/// History is not rescanned, nothing is re-stamped, and an empty trade
/// table sweeps to a no-op; the contracts' own timeouts protect trades
/// confirmed before the restart.
#[tokio::test]
async fn restart_resumes_from_current_head() {
    let oracle = TestOracle::new(T0 + 500);

    // pre-restart history sits below the current head
    oracle
        .asset_client
        .push_event(time_request(TRADE, 0xA1, 3600));
    oracle.asset_client.set_block_number(100);
    oracle
        .asset_client
        .set_trade(trade_view(TRADE, TradeState::Confirmed));

    let mut pump = EventPump::new(
        ChainRole::Asset,
        oracle.asset_client.clone() as Arc<dyn swap_oracle::chain::ChainClient>,
        Arc::clone(&oracle.dispatcher),
        Duration::from_secs(15),
        100, // startup records the current head
        Arc::clone(&oracle.stats),
        Arc::clone(&oracle.metrics),
    );

    pump.poll_once().await.unwrap();
    oracle.settle().await;
    oracle.sweeper.sweep_once().await;

    assert!(oracle.asset_client.fulfillments().is_empty());
    assert!(oracle.asset_client.failed_confirmations().is_empty());
    assert!(oracle.asset_client.execution_timeouts().is_empty());
}

// ─── Event pump ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn pump_delivers_new_blocks_and_advances_cursor() {
    let oracle = TestOracle::new(T0);
    let client = oracle.asset_client.clone();

    let mut event = time_request(TRADE, 0xA1, 3600);
    event.block_number = 102;
    client.push_event(event);
    client.set_block_number(105);

    let mut pump = EventPump::new(
        ChainRole::Asset,
        client.clone() as Arc<dyn swap_oracle::chain::ChainClient>,
        Arc::clone(&oracle.dispatcher),
        Duration::from_secs(15),
        100,
        Arc::clone(&oracle.stats),
        Arc::clone(&oracle.metrics),
    );

    pump.poll_once().await.unwrap();
    oracle.settle().await;

    assert_eq!(pump.last_processed_block(), 105);
    assert_eq!(oracle.asset_client.fulfillments().len(), 1);
    assert_eq!(oracle.stats.read().await.asset.last_processed_block, 105);
    assert_eq!(oracle.stats.read().await.asset.events_seen, 1);
}

#[tokio::test]
async fn pump_retries_same_range_after_rpc_failure() {
    let oracle = TestOracle::new(T0);
    let client = oracle.asset_client.clone();

    let mut event = time_request(TRADE, 0xA1, 3600);
    event.block_number = 101;
    client.push_event(event);
    client.set_block_number(101);
    client.push_logs_error(ChainError::RpcUnavailable("flaky".into()));

    let mut pump = EventPump::new(
        ChainRole::Asset,
        client.clone() as Arc<dyn swap_oracle::chain::ChainClient>,
        Arc::clone(&oracle.dispatcher),
        Duration::from_secs(15),
        100,
        Arc::clone(&oracle.stats),
        Arc::clone(&oracle.metrics),
    );

    assert!(pump.poll_once().await.is_err());
    assert_eq!(pump.last_processed_block(), 100, "cursor must not advance");

    pump.poll_once().await.unwrap();
    oracle.settle().await;
    assert_eq!(pump.last_processed_block(), 101);
    assert_eq!(oracle.asset_client.fulfillments().len(), 1);
}

#[tokio::test]
async fn pump_tolerates_head_query_failure() {
    let oracle = TestOracle::new(T0);
    let client = oracle.asset_client.clone();
    client.set_block_number(110);
    client.push_block_number_error(ChainError::RpcUnavailable("head query failed".into()));

    let mut pump = EventPump::new(
        ChainRole::Asset,
        client.clone() as Arc<dyn swap_oracle::chain::ChainClient>,
        Arc::clone(&oracle.dispatcher),
        Duration::from_secs(15),
        100,
        Arc::clone(&oracle.stats),
        Arc::clone(&oracle.metrics),
    );

    assert!(pump.poll_once().await.is_err());
    assert_eq!(pump.last_processed_block(), 100);

    pump.poll_once().await.unwrap();
    assert_eq!(pump.last_processed_block(), 110);
}

#[tokio::test]
async fn pump_handles_devnet_chain_reset() {
    let oracle = TestOracle::new(T0);
    let client = oracle.asset_client.clone();
    client.set_block_number(40);

    let mut pump = EventPump::new(
        ChainRole::Asset,
        client.clone() as Arc<dyn swap_oracle::chain::ChainClient>,
        Arc::clone(&oracle.dispatcher),
        Duration::from_secs(15),
        100,
        Arc::clone(&oracle.stats),
        Arc::clone(&oracle.metrics),
    );

    pump.poll_once().await.unwrap();
    assert_eq!(pump.last_processed_block(), 40);
}
