//! Timeout sweeper.
//!
//! Periodically snapshots both trade tables and classifies every in-flight
//! leg as healthy, confirmation-phase expired, or execution-phase expired.
//! Expired legs are cancelled with the matching callback and the failure is
//! propagated to the paired leg. Before any send, the contract's current
//! state is read; a leg that already went terminal on-chain only has its
//! local record dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain::ChainRole;
use crate::coordinator::{CancelKind, SwapCoordinator};
use crate::dispatcher;
use crate::state::TradeRecord;

pub struct TimeoutSweeper {
    coordinator: Arc<SwapCoordinator>,
    interval: Duration,
}

/// Classify one leg against the oracle clock.
///
/// A Confirmed leg is healthy until `confirmation_time + duration` even if
/// its creation window has lapsed; only a leg that never confirmed times
/// out of the confirmation phase. A Confirmed leg found outside the
/// execution window entirely (`now - inception > 2 × duration`) falls back
/// to the confirmation-failure callback as a stale catch-all.
fn classify(record: &TradeRecord, now: u64) -> Option<CancelKind> {
    if let Some(confirmation_time) = record.confirmation_time {
        if now.saturating_sub(confirmation_time) > record.duration {
            if now.saturating_sub(record.inception_time) <= 2 * record.duration {
                return Some(CancelKind::ExecutionTimeout);
            }
            return Some(CancelKind::FailedConfirmation);
        }
        return None;
    }

    if now.saturating_sub(record.inception_time) > record.duration {
        return Some(CancelKind::FailedConfirmation);
    }

    None
}

impl TimeoutSweeper {
    pub fn new(coordinator: Arc<SwapCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        info!(
            sweep_interval_secs = self.interval.as_secs(),
            "Timeout sweeper starting"
        );

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    if result.is_some() {
                        info!("Shutdown signal received");
                    } else {
                        warn!("Shutdown channel closed unexpectedly");
                    }
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Timeout sweeper exiting");
        Ok(())
    }

    /// One full sweep over both chains. Public so tests can drive it.
    pub async fn sweep_once(&self) {
        let now = self.coordinator.clock().now();

        for role in [ChainRole::Asset, ChainRole::Payment] {
            let store = self.coordinator.store(role);

            for record in store.snapshot() {
                if classify(&record, now).is_none() {
                    continue;
                }

                let trade_id = record.trade_id;
                if !store.try_begin(trade_id) {
                    debug!(
                        chain = role.label(),
                        trade_id = %trade_id,
                        "Trade busy, deferring to next sweep"
                    );
                    continue;
                }

                // Re-read under the slot; the handler we raced with may
                // have confirmed or removed the leg.
                let kind = match store.get(trade_id) {
                    Some(current) => classify(&current, now),
                    None => None,
                };
                let Some(kind) = kind else {
                    dispatcher::release_slot(&self.coordinator, role, trade_id);
                    continue;
                };

                match self
                    .coordinator
                    .leg_is_terminal_onchain(role, trade_id)
                    .await
                {
                    Ok(true) => {
                        debug!(
                            chain = role.label(),
                            trade_id = %trade_id,
                            "Leg already terminal on-chain, dropping local record"
                        );
                        store.remove(trade_id);
                        store.purge_deferred(trade_id);
                        self.clear_pair_if_orphaned(role, trade_id);
                        self.coordinator.drain_and_release(role, trade_id);
                    }
                    Ok(false) => {
                        info!(
                            chain = role.label(),
                            trade_id = %trade_id,
                            kind = kind.label(),
                            inception = record.inception_time,
                            confirmation = record.confirmation_time,
                            duration = record.duration,
                            now,
                            "Swap window expired, cancelling pair"
                        );
                        self.coordinator.fail_pair(role, trade_id, kind, true).await;
                        self.coordinator.drain_and_release(role, trade_id);
                    }
                    Err(e) => {
                        warn!(
                            chain = role.label(),
                            trade_id = %trade_id,
                            error = %e,
                            "On-chain state read failed, retrying next sweep"
                        );
                        dispatcher::release_slot(&self.coordinator, role, trade_id);
                    }
                }
            }
        }
    }

    /// Drop the pair entry once neither leg holds a local record.
    fn clear_pair_if_orphaned(&self, role: ChainRole, trade_id: alloy::primitives::U256) {
        if let Some(pair) = self.coordinator.pairs().get(trade_id) {
            let peer_role = role.other();
            if self
                .coordinator
                .store(peer_role)
                .get(pair.leg(peer_role))
                .is_none()
            {
                self.coordinator.pairs().clear(trade_id);
            }
        }
    }
}
