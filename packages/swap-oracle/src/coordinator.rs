//! Swap state machine core.
//!
//! Handles one event at a time per trade id (the dispatcher enforces the
//! serialization), decides creation vs confirmation, runs the immediate
//! double-spend check, and drives paired failure. Timestamps come from the
//! injected [`Clock`], never from chain-supplied block timestamps.
//!
//! No error escapes a handler: every failure is classified, logged, and
//! either retried by the submitter or absorbed by dropping the local
//! record and leaving cleanup to the sweeper and the contracts' own
//! timeouts.

use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::U256;
use tracing::{debug, error, info, warn};

use crate::cache::BoundedHashCache;
use crate::chain::{ChainClient, ChainRole, TimeRequestEvent};
use crate::clock::Clock;
use crate::contracts::OracleCall;
use crate::error::ChainError;
use crate::server::{SharedMetrics, SharedStats};
use crate::state::{ChainStore, PairTable, TradeRecord};
use crate::submitter::Submitter;

/// Size bound for the fulfilled-request dedupe cache.
const FULFILLED_CACHE_SIZE: usize = 100_000;
/// TTL for dedupe entries; redelivery after a day means the trade is long
/// past its window and the contract will reject the callback anyway.
const FULFILLED_CACHE_TTL_SECS: u64 = 86_400;

/// Which cancellation callback a failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    FailedConfirmation,
    ExecutionTimeout,
}

impl CancelKind {
    pub fn call(&self, id: U256) -> OracleCall {
        match self {
            CancelKind::FailedConfirmation => OracleCall::HandleFailedConfirmation { id },
            CancelKind::ExecutionTimeout => OracleCall::HandleExecutionTimeout { id },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CancelKind::FailedConfirmation => "failed_confirmation",
            CancelKind::ExecutionTimeout => "execution_timeout",
        }
    }
}

/// One chain's store and submitter.
pub struct ChainSide {
    pub role: ChainRole,
    pub store: ChainStore,
    pub submitter: Submitter,
}

impl ChainSide {
    pub fn new(role: ChainRole, submitter: Submitter) -> Self {
        Self {
            role,
            store: ChainStore::new(role),
            submitter,
        }
    }
}

pub struct SwapCoordinator {
    asset: ChainSide,
    payment: ChainSide,
    pairs: PairTable,
    /// Request ids already answered with fulfillTime; absorbs redelivery.
    fulfilled: Mutex<BoundedHashCache>,
    clock: Arc<dyn Clock>,
    stats: SharedStats,
    metrics: SharedMetrics,
}

impl SwapCoordinator {
    pub fn new(
        asset: ChainSide,
        payment: ChainSide,
        clock: Arc<dyn Clock>,
        stats: SharedStats,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            asset,
            payment,
            pairs: PairTable::new(),
            fulfilled: Mutex::new(BoundedHashCache::new(
                FULFILLED_CACHE_SIZE,
                FULFILLED_CACHE_TTL_SECS,
            )),
            clock,
            stats,
            metrics,
        }
    }

    pub fn side(&self, role: ChainRole) -> &ChainSide {
        match role {
            ChainRole::Asset => &self.asset,
            ChainRole::Payment => &self.payment,
        }
    }

    pub fn store(&self, role: ChainRole) -> &ChainStore {
        &self.side(role).store
    }

    pub fn pairs(&self) -> &PairTable {
        &self.pairs
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn client(&self, role: ChainRole) -> &Arc<dyn ChainClient> {
        self.side(role).submitter.client()
    }

    fn already_fulfilled(&self, event: &TimeRequestEvent) -> bool {
        self.fulfilled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&event.request_id.0)
    }

    fn mark_fulfilled(&self, event: &TimeRequestEvent) {
        self.fulfilled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.request_id.0);
    }

    /// Handle one `TimeRequestSent` event. The caller must own the
    /// processing slot for `(role, event.trade_id)`.
    pub async fn handle_event(&self, role: ChainRole, event: &TimeRequestEvent) {
        if self.already_fulfilled(event) {
            debug!(
                chain = role.label(),
                trade_id = %event.trade_id,
                request_id = %event.request_id,
                "Request already answered, skipping redelivery"
            );
            return;
        }

        match self.store(role).get(event.trade_id) {
            None => self.handle_creation(role, event).await,
            Some(record) => self.handle_confirmation(role, event, record).await,
        }
    }

    /// First request for this trade id on this chain.
    async fn handle_creation(&self, role: ChainRole, event: &TimeRequestEvent) {
        let peer_record = self.store(role.other()).get(event.trade_id);

        if let Some(peer) = &peer_record {
            let (asset_duration, payment_duration) = match role {
                ChainRole::Payment => (peer.duration, event.duration),
                ChainRole::Asset => (event.duration, peer.duration),
            };

            // Timeout-inversion guard: a payment window outlasting the
            // asset window lets the buyer release payment after the asset
            // leg has already refunded. Neither leg may proceed.
            if asset_duration < payment_duration {
                error!(
                    chain = role.label(),
                    trade_id = %event.trade_id,
                    asset_duration,
                    payment_duration,
                    "Timeout inversion detected, driving both legs to failure"
                );
                {
                    let mut stats = self.stats.write().await;
                    stats.double_spend_rejections += 1;
                }
                self.metrics.double_spend_rejections_total.inc();
                self.fail_pair(role, event.trade_id, CancelKind::FailedConfirmation, false)
                    .await;
                return;
            }
        }

        // The second leg adopts the first leg's inception so both windows
        // are measured from the same origin.
        let now = self.clock.now();
        let inception = peer_record
            .as_ref()
            .map(|p| p.inception_time)
            .unwrap_or(now);

        let call = OracleCall::FulfillTime {
            request_id: event.request_id,
            timestamp: inception,
        };

        match self.side(role).submitter.submit(&call).await {
            Ok(_) => {
                self.store(role).insert(TradeRecord {
                    trade_id: event.trade_id,
                    inception_time: inception,
                    duration: event.duration,
                    last_request_id: event.request_id,
                    last_request_time: inception,
                    confirmation_time: None,
                    is_confirmation_phase: false,
                });
                if peer_record.is_some() {
                    // The trade id is shared across both chains, so the pair
                    // binds the same id on each side.
                    self.pairs.bind(event.trade_id, event.trade_id);
                }
                self.mark_fulfilled(event);
                self.record_fulfillment(role).await;

                info!(
                    chain = role.label(),
                    trade_id = %event.trade_id,
                    inception,
                    duration = event.duration,
                    paired = peer_record.is_some(),
                    "Leg created and time stamped"
                );
            }
            Err(e) => self.absorb_submit_error(role, event.trade_id, "creation", e).await,
        }
    }

    /// Subsequent request: the leg is asking for its confirmation stamp.
    async fn handle_confirmation(
        &self,
        role: ChainRole,
        event: &TimeRequestEvent,
        record: TradeRecord,
    ) {
        let now = self.clock.now();
        let peer_record = self.store(role.other()).get(event.trade_id);

        // Never stamp earlier than the peer leg's latest stamp; the
        // confirmation windows of both legs must close together.
        let confirmation_time = match &peer_record {
            Some(peer) => {
                let peer_base = if peer.last_request_time > 0 {
                    peer.last_request_time
                } else {
                    peer.inception_time
                };
                now.max(peer_base)
            }
            None => now,
        };

        if confirmation_time.saturating_sub(record.inception_time) > record.duration {
            warn!(
                chain = role.label(),
                trade_id = %event.trade_id,
                confirmation_time,
                inception = record.inception_time,
                duration = record.duration,
                "Confirmation window exceeded, failing both legs"
            );
            self.fail_pair(role, event.trade_id, CancelKind::FailedConfirmation, false)
                .await;
            return;
        }

        self.store(role).update(event.trade_id, |r| {
            r.last_request_id = event.request_id;
            r.last_request_time = confirmation_time;
            r.confirmation_time = Some(confirmation_time);
            r.is_confirmation_phase = true;
        });

        let call = OracleCall::FulfillTime {
            request_id: event.request_id,
            timestamp: confirmation_time,
        };

        match self.side(role).submitter.submit(&call).await {
            Ok(_) => {
                self.mark_fulfilled(event);
                self.record_fulfillment(role).await;
                info!(
                    chain = role.label(),
                    trade_id = %event.trade_id,
                    confirmation_time,
                    "Leg confirmed and time stamped"
                );
            }
            Err(e) => {
                self.store(role).remove(event.trade_id);
                self.absorb_submit_error(role, event.trade_id, "confirmation", e)
                    .await;
            }
        }
    }

    /// Drive this leg and, when reachable, its paired peer to failure.
    ///
    /// The caller must own the processing slot for `(role, trade_id)`.
    /// The peer's slot is acquired non-blocking; a busy peer is left to
    /// the next sweep cycle, which keeps cancellation deadlock-free.
    pub async fn fail_pair(
        &self,
        role: ChainRole,
        trade_id: U256,
        kind: CancelKind,
        precheck_peer: bool,
    ) {
        self.cancel_leg(role, trade_id, kind).await;

        let peer_role = role.other();
        let peer_id = self
            .pairs
            .get(trade_id)
            .map(|p| p.leg(peer_role))
            .unwrap_or(trade_id);

        if self.store(peer_role).get(peer_id).is_some() {
            if self.store(peer_role).try_begin(peer_id) {
                let mut already_terminal = false;
                if precheck_peer {
                    match self.leg_is_terminal_onchain(peer_role, peer_id).await {
                        Ok(true) => already_terminal = true,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(
                                chain = peer_role.label(),
                                trade_id = %peer_id,
                                error = %e,
                                "Peer state read failed, sending cancellation anyway"
                            );
                        }
                    }
                }
                if already_terminal {
                    debug!(
                        chain = peer_role.label(),
                        trade_id = %peer_id,
                        "Peer leg already terminal on-chain, dropping local record"
                    );
                    self.store(peer_role).remove(peer_id);
                    self.store(peer_role).purge_deferred(peer_id);
                } else {
                    self.cancel_leg(peer_role, peer_id, kind).await;
                }
                self.drain_and_release(peer_role, peer_id);
            } else {
                debug!(
                    chain = peer_role.label(),
                    trade_id = %peer_id,
                    "Peer leg busy, paired cancellation deferred to next sweep"
                );
            }
        }

        self.pairs.clear(trade_id);
    }

    /// Cancel a single leg: submit the callback, drop the local record,
    /// and discard any queued events for the now-dead trade.
    pub(crate) async fn cancel_leg(&self, role: ChainRole, trade_id: U256, kind: CancelKind) {
        let call = kind.call(trade_id);
        match self.side(role).submitter.submit(&call).await {
            Ok(_) => {
                info!(
                    chain = role.label(),
                    trade_id = %trade_id,
                    kind = kind.label(),
                    "Cancellation callback submitted"
                );
                let mut stats = self.stats.write().await;
                match kind {
                    CancelKind::FailedConfirmation => {
                        stats.chain_mut(role).failed_confirmations += 1;
                        self.metrics
                            .failed_confirmations_total
                            .with_label_values(&[role.label()])
                            .inc();
                    }
                    CancelKind::ExecutionTimeout => {
                        stats.chain_mut(role).execution_timeouts += 1;
                        self.metrics
                            .execution_timeouts_total
                            .with_label_values(&[role.label()])
                            .inc();
                    }
                }
            }
            Err(ChainError::Reverted(msg)) => {
                // The record is still dropped below to prevent retry loops,
                // but a reverting cancellation can mask a contract bug, so
                // it is counted where operators will see it.
                error!(
                    chain = role.label(),
                    trade_id = %trade_id,
                    kind = kind.label(),
                    error = %msg,
                    "Cancellation callback reverted"
                );
                self.stats.write().await.cancel_reverts += 1;
                self.metrics.cancel_revert_total.inc();
            }
            Err(e) => {
                error!(
                    chain = role.label(),
                    trade_id = %trade_id,
                    kind = kind.label(),
                    error = %e,
                    "Cancellation callback failed, contract timeout is the fallback"
                );
                let mut stats = self.stats.write().await;
                stats.chain_mut(role).terminal_submit_errors += 1;
                self.metrics
                    .terminal_submit_errors_total
                    .with_label_values(&[role.label()])
                    .inc();
            }
        }

        self.store(role).remove(trade_id);
        self.store(role).purge_deferred(trade_id);
    }

    /// Read the leg's on-chain state; a missing record counts as terminal.
    pub async fn leg_is_terminal_onchain(
        &self,
        role: ChainRole,
        trade_id: U256,
    ) -> Result<bool, ChainError> {
        let client = self.client(role);
        match role {
            ChainRole::Asset => Ok(client
                .get_trade(trade_id)
                .await?
                .map(|t| t.state.is_terminal())
                .unwrap_or(true)),
            ChainRole::Payment => Ok(client
                .get_payment(trade_id)
                .await?
                .map(|p| p.state.is_terminal())
                .unwrap_or(true)),
        }
    }

    /// Release a slot for a trade that just went terminal, discarding any
    /// events that raced in while it was held.
    pub(crate) fn drain_and_release(&self, role: ChainRole, trade_id: U256) {
        while let Some(event) = self.store(role).finish(trade_id) {
            debug!(
                chain = role.label(),
                trade_id = %trade_id,
                request_id = %event.request_id,
                "Dropping deferred event for terminated trade"
            );
        }
    }

    async fn record_fulfillment(&self, role: ChainRole) {
        let mut stats = self.stats.write().await;
        stats.chain_mut(role).fulfillments += 1;
        self.metrics
            .fulfillments_total
            .with_label_values(&[role.label()])
            .inc();
    }

    /// Terminal submit failure: the local record is gone (or never
    /// created); the sweeper and the contract timeouts finish the job.
    async fn absorb_submit_error(
        &self,
        role: ChainRole,
        trade_id: U256,
        phase: &str,
        error: ChainError,
    ) {
        error!(
            chain = role.label(),
            trade_id = %trade_id,
            phase,
            error = %error,
            "fulfillTime submission failed, dropping local record"
        );
        let mut stats = self.stats.write().await;
        stats.chain_mut(role).terminal_submit_errors += 1;
        self.metrics
            .terminal_submit_errors_total
            .with_label_values(&[role.label()])
            .inc();
    }
}
