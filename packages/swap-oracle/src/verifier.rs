//! Cross-chain payment verification.
//!
//! Proves that a payment-release transaction actually executed on the
//! Payment Chain: receipt present and successful, enough confirmations for
//! the transferred value, the transaction really listed in its recorded
//! block, an optional state proof, no reorg across the wait window, and a
//! matching `PaymentCompleted` log. A negative verdict never mutates trade
//! state — the contracts' own timeouts remain authoritative; this is an
//! audit hook, not a safety mechanism.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ProofStatus};
use crate::contracts::SwapEscrow;
use crate::server::{SharedMetrics, SharedStats};

const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Transferred-value tiers mapping to required confirmation depth,
/// descending by threshold.
#[derive(Debug, Clone)]
pub struct ConfirmationTable {
    tiers: Vec<(U256, u64)>,
    fallback: u64,
}

impl Default for ConfirmationTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                (U256::from(10u128 * WEI_PER_ETH), 30),
                (U256::from(WEI_PER_ETH), 20),
                (U256::from(WEI_PER_ETH / 10), 15),
            ],
            fallback: 10,
        }
    }
}

impl ConfirmationTable {
    /// Parse an override of the form `"<wei>:<confs>,<wei>:<confs>"`.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut tiers: Vec<(U256, u64)> = Vec::new();
        for entry in spec.split(',') {
            let (wei, confs) = entry.trim().split_once(':')?;
            tiers.push((wei.trim().parse().ok()?, confs.trim().parse().ok()?));
        }
        if tiers.is_empty() {
            return None;
        }
        tiers.sort_by(|a, b| b.0.cmp(&a.0));
        Some(Self {
            tiers,
            fallback: 10,
        })
    }

    pub fn required_for(&self, value: U256) -> u64 {
        for (threshold, confirmations) in &self.tiers {
            if value >= *threshold {
                return *confirmations;
            }
        }
        self.fallback
    }

    /// Overall deadline for a verification: twice the expected wait at
    /// ~12 s block time, plus a fixed grace period.
    pub fn deadline_for(&self, required_confirmations: u64) -> Duration {
        Duration::from_secs(required_confirmations * 12 * 2 + 60)
    }
}

/// What the caller expects the payment-release to have done.
#[derive(Debug, Clone)]
pub struct ExpectedPayment {
    pub payment_id: U256,
    pub recipient: Option<Address>,
    pub amount: Option<U256>,
}

/// Verification outcome. `proof_validated` is surfaced separately so
/// callers can apply a stricter policy than the default
/// downgrade-on-unsupported behavior.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub verified: bool,
    pub proof_validated: bool,
    pub confirmations: u64,
    pub reason: Option<String>,
}

pub struct PaymentVerifier {
    client: Arc<dyn ChainClient>,
    contract: Address,
    table: ConfirmationTable,
    poll_interval: Duration,
    deadline_override: Option<Duration>,
    stats: Option<SharedStats>,
    metrics: Option<SharedMetrics>,
}

impl PaymentVerifier {
    pub fn new(client: Arc<dyn ChainClient>, contract: Address, table: ConfirmationTable) -> Self {
        Self {
            client,
            contract,
            table,
            poll_interval: Duration::from_secs(3),
            deadline_override: None,
            stats: None,
            metrics: None,
        }
    }

    /// Report verdicts into the shared stats and Prometheus counters.
    pub fn with_observers(mut self, stats: SharedStats, metrics: SharedMetrics) -> Self {
        self.stats = Some(stats);
        self.metrics = Some(metrics);
        self
    }

    /// Shrink the poll cadence; test fixtures use this to avoid real waits.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replace the table-derived deadline; test fixtures use this to make
    /// the wait loops expire quickly.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_override = Some(deadline);
        self
    }

    /// Run the full verification pipeline for one payment-release tx.
    pub async fn verify(&self, tx_hash: B256, value: U256, expected: &ExpectedPayment) -> Verdict {
        let required = self.table.required_for(value);
        let deadline = Instant::now()
            + self
                .deadline_override
                .unwrap_or_else(|| self.table.deadline_for(required));

        info!(
            tx_hash = %tx_hash,
            payment_id = %expected.payment_id,
            value = %value,
            required_confirmations = required,
            "Verifying payment-release transaction"
        );

        // 1. Wait for the receipt.
        let first = loop {
            match self.client.receipt(tx_hash).await {
                Ok(Some(receipt)) => break receipt,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return self.fail("timed out waiting for receipt", 0, false).await;
                    }
                }
                Err(e) => {
                    warn!(tx_hash = %tx_hash, error = %e, "Receipt read failed, retrying");
                    if Instant::now() >= deadline {
                        return self.fail("timed out waiting for receipt", 0, false).await;
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        if !first.status {
            return self.fail("transaction reverted on-chain", 0, false).await;
        }

        // 2. Accumulate confirmations scaled to the transferred value.
        let confirmations = loop {
            match self.client.block_number().await {
                Ok(current) => {
                    let confirmations = current.saturating_sub(first.block_number);
                    if confirmations >= required {
                        break confirmations;
                    }
                    debug!(
                        tx_hash = %tx_hash,
                        confirmations,
                        required,
                        "Waiting for confirmations"
                    );
                }
                Err(e) => {
                    warn!(tx_hash = %tx_hash, error = %e, "Block number read failed, retrying");
                }
            }
            if Instant::now() >= deadline {
                return self
                    .fail("insufficient confirmations before deadline", 0, false)
                    .await;
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        // 3. The receipt alone is not proof of inclusion; the containing
        //    block must actually list the transaction.
        match self.client.block(first.block_number).await {
            Ok(Some(block)) if block.transactions.contains(&tx_hash) => {}
            Ok(_) => {
                return self
                    .fail(
                        "transaction not listed in its recorded block",
                        confirmations,
                        false,
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .fail(&format!("block fetch failed: {e}"), confirmations, false)
                    .await;
            }
        }

        // 4. State proof strengthens the verdict; an unsupported or failing
        //    proof downgrades without failing the whole check.
        let proof_validated = match self.client.get_proof(self.contract, first.block_number).await {
            Ok(ProofStatus::Validated) => true,
            Ok(ProofStatus::Unsupported) => {
                debug!(tx_hash = %tx_hash, "eth_getProof unsupported, basic verification only");
                false
            }
            Err(e) => {
                debug!(tx_hash = %tx_hash, error = %e, "eth_getProof failed, basic verification only");
                false
            }
        };

        // 5. Re-read the receipt; a changed block hash means the chain
        //    reorganized under us during the wait.
        let second = match self.client.receipt(tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                return self
                    .fail(
                        "receipt disappeared during confirmation wait",
                        confirmations,
                        proof_validated,
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .fail(
                        &format!("receipt re-read failed: {e}"),
                        confirmations,
                        proof_validated,
                    )
                    .await;
            }
        };

        if second.block_hash != first.block_hash {
            return self
                .fail(
                    "block hash changed during confirmation wait (reorg)",
                    confirmations,
                    proof_validated,
                )
                .await;
        }

        // 6. The escrow must have logged the expected payment completion.
        let mut decoded_any = false;
        let mut matched = false;
        for log in &second.logs {
            if log.address != self.contract {
                continue;
            }
            if log.topics.first() != Some(&SwapEscrow::PaymentCompleted::SIGNATURE_HASH) {
                continue;
            }
            let event = match SwapEscrow::PaymentCompleted::decode_raw_log(
                log.topics.iter().copied(),
                &log.data,
                true,
            ) {
                Ok(event) => event,
                Err(_) => continue,
            };
            decoded_any = true;

            if event.paymentId != expected.payment_id {
                continue;
            }
            if let Some(recipient) = expected.recipient {
                if event.recipient != recipient {
                    return self
                        .fail("payment recipient mismatch", confirmations, proof_validated)
                        .await;
                }
            }
            if let Some(amount) = expected.amount {
                if event.amount != amount {
                    return self
                        .fail("payment amount mismatch", confirmations, proof_validated)
                        .await;
                }
            }
            matched = true;
            break;
        }

        if !matched {
            let reason = if decoded_any {
                "no PaymentCompleted log with the expected payment id"
            } else {
                "PaymentCompleted log not found in receipt"
            };
            return self.fail(reason, confirmations, proof_validated).await;
        }

        info!(
            tx_hash = %tx_hash,
            payment_id = %expected.payment_id,
            confirmations,
            proof_validated,
            "Payment-release transaction verified"
        );
        self.record(true).await;

        Verdict {
            verified: true,
            proof_validated,
            confirmations,
            reason: None,
        }
    }

    async fn fail(&self, reason: &str, confirmations: u64, proof_validated: bool) -> Verdict {
        warn!(reason, "Payment verification failed");
        self.record(false).await;
        Verdict {
            verified: false,
            proof_validated,
            confirmations,
            reason: Some(reason.to_string()),
        }
    }

    async fn record(&self, verified: bool) {
        if let Some(stats) = &self.stats {
            let mut stats = stats.write().await;
            if verified {
                stats.verifications_passed += 1;
            } else {
                stats.verifications_failed += 1;
            }
        }
        if let Some(metrics) = &self.metrics {
            let verdict = if verified { "verified" } else { "failed" };
            metrics
                .verifications_total
                .with_label_values(&[verdict])
                .inc();
        }
    }
}
