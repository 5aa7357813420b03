//! Oracle callback submission with classified-error retry.
//!
//! Wraps a chain client and a nonce manager. The retry policy is a small
//! decision table over [`ChainError`] classes:
//!
//! | class | action |
//! |---|---|
//! | `NonceTooLow` | resync nonce from chain, retry once |
//! | `AlreadyKnown` | treat as success (it was us) |
//! | `ReplacementUnderpriced` | resync + exponential backoff, bounded |
//! | `RpcUnavailable` | exponential backoff, bounded |
//! | `Reverted`, `InsufficientFunds` | terminal, returned to caller |

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tracing::{debug, warn};

use crate::chain::{ChainClient, ChainRole};
use crate::contracts::OracleCall;
use crate::error::ChainError;
use crate::nonce::NonceManager;

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The callback was accepted by the node under this hash.
    Sent(B256),
    /// The node already held an identical transaction from us.
    AlreadyPending,
}

pub struct Submitter {
    role: ChainRole,
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    gas_limit: u64,
    max_retries: u32,
    initial_backoff: Duration,
}

impl Submitter {
    pub fn new(
        role: ChainRole,
        client: Arc<dyn ChainClient>,
        nonces: Arc<NonceManager>,
        gas_limit: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            role,
            client,
            nonces,
            gas_limit,
            max_retries,
            initial_backoff: Duration::from_millis(500),
        }
    }

    /// Shrink the backoff base; test fixtures use this to avoid real sleeps.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    /// Submit one oracle callback, applying the decision table above.
    pub async fn submit(&self, call: &OracleCall) -> Result<SubmitOutcome, ChainError> {
        let mut reserved = self.nonces.reserve(self.client.as_ref()).await?;
        let mut attempt: u32 = 0;
        let mut nonce_resynced = false;

        loop {
            let nonce = reserved.value();
            match self.client.send(call, nonce, self.gas_limit).await {
                Ok(tx_hash) => {
                    debug!(
                        chain = self.role.label(),
                        call = call.label(),
                        nonce,
                        tx_hash = %tx_hash,
                        "Callback submitted"
                    );
                    reserved.commit();
                    return Ok(SubmitOutcome::Sent(tx_hash));
                }
                Err(ChainError::NonceTooLow) if !nonce_resynced => {
                    warn!(
                        chain = self.role.label(),
                        call = call.label(),
                        nonce,
                        "Nonce too low, resyncing from chain"
                    );
                    nonce_resynced = true;
                    reserved.resync(self.client.as_ref()).await?;
                }
                Err(ChainError::AlreadyKnown) => {
                    debug!(
                        chain = self.role.label(),
                        call = call.label(),
                        nonce,
                        "Transaction already known, treating as submitted"
                    );
                    reserved.commit();
                    return Ok(SubmitOutcome::AlreadyPending);
                }
                Err(ChainError::ReplacementUnderpriced) if attempt < self.max_retries => {
                    warn!(
                        chain = self.role.label(),
                        call = call.label(),
                        nonce,
                        attempt,
                        "Replacement underpriced, resyncing and retrying"
                    );
                    reserved.resync(self.client.as_ref()).await?;
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(ChainError::RpcUnavailable(msg)) if attempt < self.max_retries => {
                    warn!(
                        chain = self.role.label(),
                        call = call.label(),
                        attempt,
                        max = self.max_retries,
                        error = %msg,
                        "RPC unavailable, retrying after backoff"
                    );
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        chain = self.role.label(),
                        call = call.label(),
                        nonce,
                        error = %e,
                        "Callback submission failed terminally"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.initial_backoff * 2u32.saturating_pow(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::OracleCall;
    use crate::testing::MockChainClient;
    use alloy::primitives::{B256, U256};

    fn fulfill_call() -> OracleCall {
        OracleCall::FulfillTime {
            request_id: B256::repeat_byte(0xab),
            timestamp: 1_700_000_000,
        }
    }

    fn submitter(client: Arc<MockChainClient>, max_retries: u32) -> Submitter {
        let nonces = Arc::new(NonceManager::new(client.signer_address()));
        Submitter::new(
            ChainRole::Asset,
            client as Arc<dyn ChainClient>,
            nonces,
            200_000,
            max_retries,
        )
        .with_initial_backoff(Duration::ZERO)
    }

    #[tokio::test]
    async fn sends_with_sequential_nonces() {
        let client = Arc::new(MockChainClient::new());
        client.set_transaction_count(4);
        let submitter = submitter(Arc::clone(&client), 3);

        submitter.submit(&fulfill_call()).await.unwrap();
        submitter.submit(&fulfill_call()).await.unwrap();

        let sent = client.sent_calls();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].nonce, 4);
        assert_eq!(sent[1].nonce, 5);
        assert_eq!(sent[0].gas_limit, 200_000);
    }

    #[tokio::test]
    async fn nonce_too_low_resyncs_and_retries_once() {
        let client = Arc::new(MockChainClient::new());
        client.set_transaction_count(0);
        client.push_send_error(ChainError::NonceTooLow);
        let submitter = submitter(Arc::clone(&client), 3);

        client.set_transaction_count(9);
        let outcome = submitter.submit(&fulfill_call()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Sent(_)));

        let sent = client.sent_calls();
        // first attempt with stale nonce 0 never reached the pool; the
        // recorded send used the resynced nonce
        assert_eq!(sent.last().unwrap().nonce, 9);
    }

    #[tokio::test]
    async fn already_known_is_success() {
        let client = Arc::new(MockChainClient::new());
        client.push_send_error(ChainError::AlreadyKnown);
        let submitter = submitter(Arc::clone(&client), 3);

        let outcome = submitter.submit(&fulfill_call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyPending);
    }

    #[tokio::test]
    async fn transient_errors_retry_up_to_cap() {
        let client = Arc::new(MockChainClient::new());
        client.push_send_error(ChainError::RpcUnavailable("down".into()));
        client.push_send_error(ChainError::RpcUnavailable("down".into()));
        let submitter = submitter(Arc::clone(&client), 3);

        let outcome = submitter.submit(&fulfill_call()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn transient_errors_exhaust_cap() {
        let client = Arc::new(MockChainClient::new());
        for _ in 0..4 {
            client.push_send_error(ChainError::RpcUnavailable("down".into()));
        }
        let submitter = submitter(Arc::clone(&client), 3);

        let err = submitter.submit(&fulfill_call()).await.unwrap_err();
        assert!(matches!(err, ChainError::RpcUnavailable(_)));
    }

    #[tokio::test]
    async fn reverted_is_terminal_and_burns_no_nonce() {
        let client = Arc::new(MockChainClient::new());
        client.set_transaction_count(2);
        client.push_send_error(ChainError::Reverted("trade not found".into()));
        let submitter = submitter(Arc::clone(&client), 3);

        let err = submitter
            .submit(&OracleCall::HandleFailedConfirmation { id: U256::from(42) })
            .await
            .unwrap_err();
        assert!(err.is_terminal());

        // next submission reuses the unburned nonce
        submitter.submit(&fulfill_call()).await.unwrap();
        assert_eq!(client.sent_calls().last().unwrap().nonce, 2);
    }
}
