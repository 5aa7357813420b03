//! Escrow contract interface.
//!
//! The oracle consumes two events and invokes three privileged callbacks on
//! each chain's escrow contract, plus the read-only views the sweeper uses
//! to avoid redundant cancellations.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use serde::Serialize;

sol! {
    /// Escrow contract surface shared by the Asset and Payment chains.
    ///
    /// IMPORTANT: signatures must match the deployed Solidity exactly; the
    /// event topics are derived from these canonical forms.
    #[sol(rpc)]
    contract SwapEscrow {
        /// Emitted whenever the contract needs the oracle to stamp a moment
        /// in time (leg creation and leg confirmation both use it).
        event TimeRequestSent(bytes32 requestId, uint256 tradeId, uint256 duration);

        /// Emitted by the Payment-chain escrow when a payment transfer
        /// executes.
        event PaymentCompleted(uint256 paymentId, address recipient, uint256 amount);

        /// Oracle callback answering a TimeRequestSent.
        function fulfillTime(bytes32 requestId, uint256 timestamp) external;

        /// Oracle callback refunding a leg that never reached Confirmed.
        function handleFailedConfirmation(uint256 id) external;

        /// Oracle callback refunding a Confirmed leg whose key reveal never
        /// happened.
        function handleExecutionTimeout(uint256 id) external;

        /// Asset-chain trade view.
        function getTrade(uint256 tradeId) external view returns (
            uint256 id,
            uint256 amount,
            address buyer,
            address seller,
            uint8 state,
            uint256 inceptionTime,
            uint256 confirmationTime,
            uint256 duration
        );

        /// Payment-chain payment view.
        function getPayment(uint256 paymentId) external view returns (
            uint256 id,
            uint256 amount,
            address buyer,
            address seller,
            uint8 state,
            uint256 inceptionTime,
            uint256 confirmationTime,
            uint256 duration,
            uint256 assetTradeId
        );
    }
}

/// On-chain escrow state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    Initiated,
    AwaitingConfirmation,
    Confirmed,
    Completed,
    Failed,
}

impl TradeState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TradeState::Initiated),
            1 => Some(TradeState::AwaitingConfirmation),
            2 => Some(TradeState::Confirmed),
            3 => Some(TradeState::Completed),
            4 => Some(TradeState::Failed),
            _ => None,
        }
    }

    /// Completed and Failed are final; the oracle never calls back into a
    /// terminal trade.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Completed | TradeState::Failed)
    }
}

/// Decoded `getTrade` view.
#[derive(Debug, Clone, Serialize)]
pub struct TradeView {
    pub id: U256,
    pub amount: U256,
    pub buyer: Address,
    pub seller: Address,
    pub state: TradeState,
    pub inception_time: u64,
    pub confirmation_time: u64,
    pub duration: u64,
}

/// Decoded `getPayment` view.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    pub id: U256,
    pub amount: U256,
    pub buyer: Address,
    pub seller: Address,
    pub state: TradeState,
    pub inception_time: u64,
    pub confirmation_time: u64,
    pub duration: u64,
    pub asset_trade_id: U256,
}

/// One oracle callback, held as data so the submitter can retry it and the
/// mock client can record it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleCall {
    FulfillTime { request_id: B256, timestamp: u64 },
    HandleFailedConfirmation { id: U256 },
    HandleExecutionTimeout { id: U256 },
}

impl OracleCall {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            OracleCall::FulfillTime { .. } => "fulfillTime",
            OracleCall::HandleFailedConfirmation { .. } => "handleFailedConfirmation",
            OracleCall::HandleExecutionTimeout { .. } => "handleExecutionTimeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolEvent;

    #[test]
    fn trade_state_roundtrip() {
        assert_eq!(TradeState::from_u8(0), Some(TradeState::Initiated));
        assert_eq!(TradeState::from_u8(2), Some(TradeState::Confirmed));
        assert_eq!(TradeState::from_u8(4), Some(TradeState::Failed));
        assert_eq!(TradeState::from_u8(9), None);
        assert!(TradeState::Completed.is_terminal());
        assert!(!TradeState::AwaitingConfirmation.is_terminal());
    }

    #[test]
    fn event_signatures_are_canonical() {
        assert_eq!(
            SwapEscrow::TimeRequestSent::SIGNATURE,
            "TimeRequestSent(bytes32,uint256,uint256)"
        );
        assert_eq!(
            SwapEscrow::PaymentCompleted::SIGNATURE,
            "PaymentCompleted(uint256,address,uint256)"
        );
    }
}
