//! Chain client seam.
//!
//! A narrow, classified-error interface over one EVM JSON-RPC endpoint.
//! The production implementation lives in [`crate::evm`]; tests drive the
//! oracle through the mock in [`crate::testing`]. No method retries
//! internally; retry policy belongs to the submitter.

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::contracts::{OracleCall, PaymentView, TradeView};
use crate::error::ChainError;

/// Which side of the swap a chain serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainRole {
    Asset,
    Payment,
}

impl ChainRole {
    pub fn other(&self) -> ChainRole {
        match self {
            ChainRole::Asset => ChainRole::Payment,
            ChainRole::Payment => ChainRole::Asset,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChainRole::Asset => "asset",
            ChainRole::Payment => "payment",
        }
    }
}

/// A decoded `TimeRequestSent` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRequestEvent {
    pub request_id: B256,
    pub trade_id: U256,
    pub duration: u64,
    pub block_number: u64,
    /// Timestamp of the containing block. Observability only — swap window
    /// math always uses the oracle's own clock.
    pub block_timestamp: u64,
}

/// One raw log from a transaction receipt.
#[derive(Debug, Clone)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// The slice of a transaction receipt the verifier needs.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub status: bool,
    pub block_number: u64,
    pub block_hash: B256,
    pub logs: Vec<ReceiptLog>,
}

/// A block header plus its transaction hashes.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
    pub transactions: Vec<B256>,
}

/// Outcome of an `eth_getProof` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStatus {
    /// The node returned a proof for the account at the requested block.
    Validated,
    /// The node does not serve `eth_getProof`; soft failure.
    Unsupported,
}

/// Blocking-style interface over one EVM JSON-RPC endpoint.
///
/// All failures are surfaced as a classified [`ChainError`]; callers decide
/// the retry policy.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block height.
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// `TimeRequestSent` logs from the escrow contract in
    /// `[from_block, to_block]`, ascending by block and log index.
    async fn time_request_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TimeRequestEvent>, ChainError>;

    /// Receipt for a transaction, `None` while unmined.
    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError>;

    /// Block by number with transaction hashes, `None` if unknown.
    async fn block(&self, number: u64) -> Result<Option<BlockInfo>, ChainError>;

    /// Sign and submit one oracle callback with an explicit nonce and gas
    /// limit. Fee discovery is the node's default (EIP-1559 fee history).
    async fn send(
        &self,
        call: &OracleCall,
        nonce: u64,
        gas_limit: u64,
    ) -> Result<B256, ChainError>;

    /// `eth_getProof` for an account (no storage slots) at a block.
    async fn get_proof(
        &self,
        address: Address,
        block_number: u64,
    ) -> Result<ProofStatus, ChainError>;

    /// Native balance of an account.
    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Pending-inclusive transaction count (the account's next nonce).
    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    /// `getTrade` view; `None` when the contract holds no such trade.
    async fn get_trade(&self, trade_id: U256) -> Result<Option<TradeView>, ChainError>;

    /// `getPayment` view; `None` when the contract holds no such payment.
    async fn get_payment(&self, payment_id: U256) -> Result<Option<PaymentView>, ChainError>;

    /// Address the oracle signs callbacks with on this chain.
    fn signer_address(&self) -> Address;

    /// The escrow contract address on this chain.
    fn contract_address(&self) -> Address;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_flips() {
        assert_eq!(ChainRole::Asset.other(), ChainRole::Payment);
        assert_eq!(ChainRole::Payment.other(), ChainRole::Asset);
        assert_eq!(ChainRole::Asset.label(), "asset");
    }
}
