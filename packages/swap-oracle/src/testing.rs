//! Test support: a scriptable mock chain client and an assembled oracle
//! fixture. Used by the unit tests here and the behavior tests under
//! `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::chain::{
    BlockInfo, ChainClient, ChainRole, ProofStatus, TimeRequestEvent, TxReceipt,
};
use crate::clock::ManualClock;
use crate::contracts::{OracleCall, PaymentView, TradeState, TradeView};
use crate::coordinator::{ChainSide, SwapCoordinator};
use crate::dispatcher::TradeDispatcher;
use crate::error::ChainError;
use crate::nonce::NonceManager;
use crate::server::{Metrics, OracleStats, SharedMetrics, SharedStats};
use crate::submitter::Submitter;
use crate::sweeper::TimeoutSweeper;

/// One recorded `send` invocation.
#[derive(Debug, Clone)]
pub struct SentCall {
    pub call: OracleCall,
    pub nonce: u64,
    pub gas_limit: u64,
}

/// Mock chain client. All knobs are interior-mutable so tests can share a
/// clone with the component under test.
#[derive(Clone)]
pub struct MockChainClient {
    signer: Address,
    contract: Address,
    block_number: Arc<AtomicU64>,
    transaction_count: Arc<AtomicU64>,
    events: Arc<Mutex<Vec<TimeRequestEvent>>>,
    /// Sequential receipt responses per tx hash; the last entry repeats.
    receipts: Arc<Mutex<HashMap<B256, VecDeque<TxReceipt>>>>,
    blocks: Arc<Mutex<HashMap<u64, BlockInfo>>>,
    sent: Arc<Mutex<Vec<SentCall>>>,
    send_errors: Arc<Mutex<VecDeque<ChainError>>>,
    block_number_errors: Arc<Mutex<VecDeque<ChainError>>>,
    logs_errors: Arc<Mutex<VecDeque<ChainError>>>,
    proof: Arc<Mutex<Result<ProofStatus, ChainError>>>,
    trades: Arc<Mutex<HashMap<U256, TradeView>>>,
    payments: Arc<Mutex<HashMap<U256, PaymentView>>>,
    send_delay: Arc<Mutex<Duration>>,
    tx_counter: Arc<AtomicU64>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            signer: Address::repeat_byte(0x11),
            contract: Address::repeat_byte(0x22),
            block_number: Arc::new(AtomicU64::new(100)),
            transaction_count: Arc::new(AtomicU64::new(0)),
            events: Default::default(),
            receipts: Default::default(),
            blocks: Default::default(),
            sent: Default::default(),
            send_errors: Default::default(),
            block_number_errors: Default::default(),
            logs_errors: Default::default(),
            proof: Arc::new(Mutex::new(Ok(ProofStatus::Validated))),
            trades: Default::default(),
            payments: Default::default(),
            send_delay: Arc::new(Mutex::new(Duration::ZERO)),
            tx_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn set_block_number(&self, n: u64) {
        self.block_number.store(n, Ordering::SeqCst);
    }

    pub fn set_transaction_count(&self, n: u64) {
        self.transaction_count.store(n, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: TimeRequestEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn push_send_error(&self, error: ChainError) {
        self.send_errors.lock().unwrap().push_back(error);
    }

    pub fn push_block_number_error(&self, error: ChainError) {
        self.block_number_errors.lock().unwrap().push_back(error);
    }

    pub fn push_logs_error(&self, error: ChainError) {
        self.logs_errors.lock().unwrap().push_back(error);
    }

    pub fn push_receipt(&self, receipt: TxReceipt) {
        self.receipts
            .lock()
            .unwrap()
            .entry(receipt.tx_hash)
            .or_default()
            .push_back(receipt);
    }

    pub fn insert_block(&self, block: BlockInfo) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    pub fn set_proof(&self, proof: Result<ProofStatus, ChainError>) {
        *self.proof.lock().unwrap() = proof;
    }

    pub fn set_trade(&self, view: TradeView) {
        self.trades.lock().unwrap().insert(view.id, view);
    }

    pub fn set_payment(&self, view: PaymentView) {
        self.payments.lock().unwrap().insert(view.id, view);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn sent_calls(&self) -> Vec<SentCall> {
        self.sent.lock().unwrap().clone()
    }

    /// Recorded fulfillTime calls, in send order.
    pub fn fulfillments(&self) -> Vec<SentCall> {
        self.sent_calls()
            .into_iter()
            .filter(|s| matches!(s.call, OracleCall::FulfillTime { .. }))
            .collect()
    }

    pub fn failed_confirmations(&self) -> Vec<SentCall> {
        self.sent_calls()
            .into_iter()
            .filter(|s| matches!(s.call, OracleCall::HandleFailedConfirmation { .. }))
            .collect()
    }

    pub fn execution_timeouts(&self) -> Vec<SentCall> {
        self.sent_calls()
            .into_iter()
            .filter(|s| matches!(s.call, OracleCall::HandleExecutionTimeout { .. }))
            .collect()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        if let Some(error) = self.block_number_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn time_request_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TimeRequestEvent>, ChainError> {
        if let Some(error) = self.logs_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut events: Vec<TimeRequestEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.block_number);
        Ok(events)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let mut receipts = self.receipts.lock().unwrap();
        match receipts.get_mut(&tx_hash) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front()),
            Some(queue) => Ok(queue.front().cloned()),
            None => Ok(None),
        }
    }

    async fn block(&self, number: u64) -> Result<Option<BlockInfo>, ChainError> {
        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn send(
        &self,
        call: &OracleCall,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<B256, ChainError> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.sent.lock().unwrap().push(SentCall {
            call: call.clone(),
            nonce,
            gas_limit,
        });

        if let Some(error) = self.send_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let seq = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        Ok(B256::from(U256::from(seq)))
    }

    async fn get_proof(
        &self,
        _address: Address,
        _block_number: u64,
    ) -> Result<ProofStatus, ChainError> {
        self.proof.lock().unwrap().clone()
    }

    async fn balance(&self, _address: Address) -> Result<U256, ChainError> {
        Ok(U256::from(1_000_000_000_000_000_000u128))
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, ChainError> {
        Ok(self.transaction_count.load(Ordering::SeqCst))
    }

    async fn get_trade(&self, trade_id: U256) -> Result<Option<TradeView>, ChainError> {
        Ok(self.trades.lock().unwrap().get(&trade_id).cloned())
    }

    async fn get_payment(&self, payment_id: U256) -> Result<Option<PaymentView>, ChainError> {
        Ok(self.payments.lock().unwrap().get(&payment_id).cloned())
    }

    fn signer_address(&self) -> Address {
        self.signer
    }

    fn contract_address(&self) -> Address {
        self.contract
    }
}

/// Build a `TradeView` for sweeper pre-check scripting.
pub fn trade_view(id: u64, state: TradeState) -> TradeView {
    TradeView {
        id: U256::from(id),
        amount: U256::from(5_000_000_000_000_000u64),
        buyer: Address::repeat_byte(0x33),
        seller: Address::repeat_byte(0x44),
        state,
        inception_time: 0,
        confirmation_time: 0,
        duration: 0,
    }
}

/// Build a `PaymentView` for sweeper pre-check scripting.
pub fn payment_view(id: u64, state: TradeState) -> PaymentView {
    PaymentView {
        id: U256::from(id),
        amount: U256::from(5_000_000_000_000_000u64),
        buyer: Address::repeat_byte(0x33),
        seller: Address::repeat_byte(0x44),
        state,
        inception_time: 0,
        confirmation_time: 0,
        duration: 0,
        asset_trade_id: U256::from(id),
    }
}

/// A fully wired oracle over two mock chains and a manual clock.
pub struct TestOracle {
    pub asset_client: Arc<MockChainClient>,
    pub payment_client: Arc<MockChainClient>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Arc<SwapCoordinator>,
    pub dispatcher: Arc<TradeDispatcher>,
    pub sweeper: TimeoutSweeper,
    pub stats: SharedStats,
    pub metrics: SharedMetrics,
}

impl TestOracle {
    pub fn new(start_time: u64) -> Self {
        let asset_client = Arc::new(MockChainClient::new());
        let payment_client = Arc::new(MockChainClient::new());
        let clock = Arc::new(ManualClock::new(start_time));
        let stats: SharedStats = Arc::new(RwLock::new(OracleStats::default()));
        let metrics: SharedMetrics = Arc::new(Metrics::new());

        let side = |role: ChainRole, client: &Arc<MockChainClient>| {
            let client: Arc<dyn ChainClient> = Arc::clone(client) as Arc<dyn ChainClient>;
            let nonces = Arc::new(NonceManager::new(client.signer_address()));
            ChainSide::new(
                role,
                Submitter::new(role, client, nonces, 200_000, 3)
                    .with_initial_backoff(Duration::ZERO),
            )
        };

        let coordinator = Arc::new(SwapCoordinator::new(
            side(ChainRole::Asset, &asset_client),
            side(ChainRole::Payment, &payment_client),
            clock.clone(),
            stats.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(TradeDispatcher::new(coordinator.clone()));
        let sweeper = TimeoutSweeper::new(coordinator.clone(), Duration::from_secs(30));

        Self {
            asset_client,
            payment_client,
            clock,
            coordinator,
            dispatcher,
            sweeper,
            stats,
            metrics,
        }
    }

    pub fn client(&self, role: ChainRole) -> &Arc<MockChainClient> {
        match role {
            ChainRole::Asset => &self.asset_client,
            ChainRole::Payment => &self.payment_client,
        }
    }

    /// Deliver one event through the serialization layer and process it
    /// (and anything deferred behind it) to completion on this task.
    pub async fn deliver(&self, role: ChainRole, event: TimeRequestEvent) {
        let trade_id = event.trade_id;
        if self.coordinator.store(role).begin_or_defer(event.clone()) {
            let mut current = event;
            loop {
                self.coordinator.handle_event(role, &current).await;
                match self.coordinator.store(role).finish(trade_id) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
    }

    /// Wait until no handler tasks hold slots and no events are queued.
    pub async fn settle(&self) {
        for _ in 0..200 {
            let busy = [ChainRole::Asset, ChainRole::Payment].iter().any(|role| {
                let store = self.coordinator.store(*role);
                store.processing_count() > 0 || store.pending_event_count() > 0
            });
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("oracle did not settle");
    }
}

/// Build a `TimeRequestEvent` with a distinct request id.
pub fn time_request(trade_id: u64, request_tag: u8, duration: u64) -> TimeRequestEvent {
    TimeRequestEvent {
        request_id: B256::repeat_byte(request_tag),
        trade_id: U256::from(trade_id),
        duration,
        block_number: 1,
        block_timestamp: 0,
    }
}
