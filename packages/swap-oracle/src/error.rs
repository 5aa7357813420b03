//! Classified chain-boundary errors.
//!
//! Every RPC failure is surfaced as one of these classes; retry policy is
//! decided by the caller (the submitter's decision table), never inside the
//! chain client itself.

use thiserror::Error;

/// Error classes surfaced by the chain client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The submitted nonce is behind the chain's view of the account.
    #[error("nonce too low")]
    NonceTooLow,

    /// The exact transaction is already in the pool; it was us.
    #[error("transaction already known")]
    AlreadyKnown,

    /// A same-nonce transaction with a higher fee is already pending.
    #[error("replacement transaction underpriced")]
    ReplacementUnderpriced,

    /// The signer cannot cover gas for the callback.
    #[error("insufficient funds for gas")]
    InsufficientFunds,

    /// The callback reverted during submission or estimation.
    #[error("execution reverted: {0}")]
    Reverted(String),

    /// Transport-level failure; the request may not have reached the node.
    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),
}

impl ChainError {
    /// Errors worth a backoff-and-retry from the submitter.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::RpcUnavailable(_) | ChainError::ReplacementUnderpriced
        )
    }

    /// Errors that must stop the current submission attempt for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChainError::Reverted(_) | ChainError::InsufficientFunds
        )
    }
}

/// Map raw RPC error text onto a [`ChainError`] class.
///
/// Node error strings are not standardized across geth/reth/anvil, so the
/// matching is substring-based on the lowercased message.
pub fn classify_send_error(error: &str) -> ChainError {
    let error_lower = error.to_lowercase();

    if error_lower.contains("nonce too low")
        || error_lower.contains("nonce is too low")
        || error_lower.contains("invalid nonce")
    {
        return ChainError::NonceTooLow;
    }

    if error_lower.contains("already known")
        || error_lower.contains("already imported")
        || error_lower.contains("duplicate transaction")
    {
        return ChainError::AlreadyKnown;
    }

    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("max fee per gas less than")
    {
        return ChainError::ReplacementUnderpriced;
    }

    if error_lower.contains("insufficient funds") || error_lower.contains("insufficient balance") {
        return ChainError::InsufficientFunds;
    }

    if error_lower.contains("revert") || error_lower.contains("out of gas") {
        return ChainError::Reverted(error.to_string());
    }

    ChainError::RpcUnavailable(error.to_string())
}
