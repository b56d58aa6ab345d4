use thiserror::Error;

use crate::chain::client::ProviderError;
use crate::types::TxHash;

/// Failures of the on-chain operation layer.
///
/// The split between [`ContractCall`](ChainError::ContractCall) and
/// [`Transaction`](ChainError::Transaction) matters for diagnosis: the former
/// never reached the chain (simulation rejected it, network error, provider
/// failure), the latter was mined and reverted. Neither is retried here; retry
/// policy belongs to the caller.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no transaction-signing identity is configured")]
    MissingSigner,
    #[error("invalid parameter for {op}: {reason}")]
    InvalidParameter { op: &'static str, reason: String },
    #[error("contract call for {op} failed before reaching the chain: {source}")]
    ContractCall {
        op: &'static str,
        #[source]
        source: ProviderError,
    },
    #[error("transaction for {op} was mined but failed: {tx_hash}")]
    Transaction { op: &'static str, tx_hash: TxHash },
}

impl ChainError {
    pub fn contract_call(op: &'static str, source: ProviderError) -> Self {
        ChainError::ContractCall { op, source }
    }

    pub fn transaction(op: &'static str, tx_hash: TxHash) -> Self {
        ChainError::Transaction { op, tx_hash }
    }

    pub fn invalid_parameter(op: &'static str, reason: impl Into<String>) -> Self {
        ChainError::InvalidParameter { op, reason: reason.into() }
    }
}
