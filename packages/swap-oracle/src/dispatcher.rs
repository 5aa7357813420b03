//! Per-trade serialization layer.
//!
//! Events for an idle trade id start a handler task immediately; events
//! for a trade already being handled are appended to that trade's queue
//! and drained FIFO by the running handler before it releases the slot.
//! Events from different trade ids or different chains interleave freely.

use std::sync::Arc;

use alloy::primitives::U256;
use tracing::debug;

use crate::chain::{ChainRole, TimeRequestEvent};
use crate::coordinator::SwapCoordinator;

/// Entry point from the event pumps into the coordinator.
pub struct TradeDispatcher {
    coordinator: Arc<SwapCoordinator>,
}

impl TradeDispatcher {
    pub fn new(coordinator: Arc<SwapCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<SwapCoordinator> {
        &self.coordinator
    }

    /// Accept an event. Always succeeds: the event either claims the
    /// trade's processing slot and spawns a handler, or is queued behind
    /// the handler that owns it.
    pub fn dispatch(&self, role: ChainRole, event: TimeRequestEvent) {
        let trade_id = event.trade_id;
        if self.coordinator.store(role).begin_or_defer(event.clone()) {
            tokio::spawn(run_trade_loop(Arc::clone(&self.coordinator), role, event));
        } else {
            debug!(
                chain = role.label(),
                trade_id = %trade_id,
                request_id = %event.request_id,
                "Trade busy, event deferred"
            );
        }
    }
}

/// Process one event, then drain the trade's deferred queue FIFO until the
/// slot can be released.
async fn run_trade_loop(
    coordinator: Arc<SwapCoordinator>,
    role: ChainRole,
    mut event: TimeRequestEvent,
) {
    let trade_id = event.trade_id;
    loop {
        coordinator.handle_event(role, &event).await;
        match coordinator.store(role).finish(trade_id) {
            Some(next) => event = next,
            None => break,
        }
    }
}

/// Release a slot claimed with `try_begin` outside the dispatcher (the
/// sweeper's healthy-skip path). Any event that raced in while the slot
/// was held is handed to a fresh handler task rather than dropped.
pub fn release_slot(coordinator: &Arc<SwapCoordinator>, role: ChainRole, trade_id: U256) {
    if let Some(event) = coordinator.store(role).finish(trade_id) {
        tokio::spawn(run_trade_loop(Arc::clone(coordinator), role, event));
    }
}
