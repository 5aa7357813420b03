//! Per-chain event pump.
//!
//! Polls the chain head at a fixed cadence and forwards `TimeRequestSent`
//! logs in `(last_processed, latest]` to the dispatcher. The cursor only
//! advances after the whole range has been handed over; an RPC failure
//! leaves it unchanged so the next tick retries the same range. Duplicate
//! delivery after such a retry is absorbed downstream by the coordinator's
//! request dedupe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainRole};
use crate::dispatcher::TradeDispatcher;
use crate::error::ChainError;
use crate::server::{SharedMetrics, SharedStats};

pub struct EventPump {
    role: ChainRole,
    client: Arc<dyn ChainClient>,
    dispatcher: Arc<TradeDispatcher>,
    poll_interval: Duration,
    stats: SharedStats,
    metrics: SharedMetrics,
    last_processed_block: u64,
}

impl EventPump {
    pub fn new(
        role: ChainRole,
        client: Arc<dyn ChainClient>,
        dispatcher: Arc<TradeDispatcher>,
        poll_interval: Duration,
        start_block: u64,
        stats: SharedStats,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            role,
            client,
            dispatcher,
            poll_interval,
            stats,
            metrics,
            last_processed_block: start_block,
        }
    }

    pub fn last_processed_block(&self) -> u64 {
        self.last_processed_block
    }

    /// Main poll loop; exits on shutdown signal.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        info!(
            chain = self.role.label(),
            start_block = self.last_processed_block,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Event pump starting"
        );

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    if result.is_some() {
                        info!(chain = self.role.label(), "Shutdown signal received");
                    } else {
                        warn!(chain = self.role.label(), "Shutdown channel closed unexpectedly");
                    }
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(
                            chain = self.role.label(),
                            error = %e,
                            "Event poll failed, cursor not advanced"
                        );
                    }
                }
            }
        }

        info!(chain = self.role.label(), "Event pump exiting");
        Ok(())
    }

    /// One poll tick. Public so tests can drive the pump deterministically.
    pub async fn poll_once(&mut self) -> Result<(), ChainError> {
        let latest = self.client.block_number().await?;

        // Devnet restart: the chain is behind our cursor. Rescan from the
        // new head rather than waiting for it to catch up.
        if latest < self.last_processed_block {
            warn!(
                chain = self.role.label(),
                latest,
                last_processed = self.last_processed_block,
                "Chain reset detected, moving cursor to current head"
            );
            self.last_processed_block = latest;
            return Ok(());
        }

        if latest == self.last_processed_block {
            debug!(
                chain = self.role.label(),
                latest, "No new blocks to poll"
            );
            return Ok(());
        }

        let from_block = self.last_processed_block + 1;
        let to_block = latest;

        let mut events = self.client.time_request_logs(from_block, to_block).await?;

        if !events.is_empty() {
            info!(
                chain = self.role.label(),
                from_block,
                to_block,
                event_count = events.len(),
                "Found TimeRequestSent events"
            );
        }

        for event in &mut events {
            // Block timestamp rides along for operators; the coordinator
            // never reads it.
            event.block_timestamp = self
                .client
                .block(event.block_number)
                .await
                .ok()
                .flatten()
                .map(|b| b.timestamp)
                .unwrap_or(0);

            debug!(
                chain = self.role.label(),
                trade_id = %event.trade_id,
                request_id = %event.request_id,
                duration = event.duration,
                block = event.block_number,
                block_timestamp = event.block_timestamp,
                "Dispatching time request"
            );

            self.metrics
                .events_seen_total
                .with_label_values(&[self.role.label()])
                .inc();
            self.dispatcher.dispatch(self.role, event.clone());
        }

        let seen = events.len() as u64;
        self.last_processed_block = to_block;
        {
            let mut stats = self.stats.write().await;
            let chain = stats.chain_mut(self.role);
            chain.last_processed_block = to_block;
            chain.events_seen += seen;
        }
        self.metrics
            .last_processed_block
            .with_label_values(&[self.role.label()])
            .set(to_block as i64);

        Ok(())
    }
}
