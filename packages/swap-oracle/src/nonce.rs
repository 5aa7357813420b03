//! Per-signer nonce accounting.
//!
//! The submitter is the only component that advances or resyncs a nonce.
//! Reservation holds the signer's lock for the whole send, so concurrent
//! callbacks on one chain are serialized and commit-on-success leaves no
//! permanent gaps: a failed send releases the reservation without
//! advancing.

use alloy::primitives::Address;
use tokio::sync::{Mutex, MutexGuard};

use crate::chain::ChainClient;
use crate::error::ChainError;

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out; `None` until first chain read.
    next: Option<u64>,
}

/// Monotonic nonce counter for one signing key.
pub struct NonceManager {
    signer: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(signer: Address) -> Self {
        Self {
            signer,
            state: Mutex::new(NonceState::default()),
        }
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    /// Reserve the next nonce, reading it from the chain on first use.
    ///
    /// The returned reservation holds the signer lock until committed or
    /// dropped; dropping without [`ReservedNonce::commit`] leaves the
    /// counter untouched.
    pub async fn reserve<'a>(
        &'a self,
        client: &dyn ChainClient,
    ) -> Result<ReservedNonce<'a>, ChainError> {
        let mut state = self.state.lock().await;
        let value = match state.next {
            Some(n) => n,
            None => {
                let fresh = client.transaction_count(self.signer).await?;
                state.next = Some(fresh);
                fresh
            }
        };
        Ok(ReservedNonce {
            signer: self.signer,
            state,
            value,
        })
    }
}

/// An in-flight nonce reservation.
pub struct ReservedNonce<'a> {
    signer: Address,
    state: MutexGuard<'a, NonceState>,
    value: u64,
}

impl ReservedNonce<'_> {
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Re-read the account nonce from the chain after a desync signal.
    pub async fn resync(&mut self, client: &dyn ChainClient) -> Result<(), ChainError> {
        let fresh = client.transaction_count(self.signer).await?;
        self.state.next = Some(fresh);
        self.value = fresh;
        Ok(())
    }

    /// Record the reserved nonce as used.
    pub fn commit(mut self) {
        self.state.next = Some(self.value + 1);
    }
}
