use thiserror::Error;

use crate::app_logic::AppLogicError;
use crate::chain::error::ChainError;

/// Failures of the per-channel session manager. Invariant violations
/// (`InvalidTransition`, `NoFinalState`) are local bugs or stale state and are
/// never retried.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("the channel has no state yet")]
    NoCurrentState,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("the current state is not final; close requires a final state")]
    NoFinalState,
    #[error("the received state is not signed by the counterparty")]
    MissingCounterpartySignature,
    #[error("application logic error: {0}")]
    AppLogic(#[from] AppLogicError),
    #[error("on-chain operation failed: {0}")]
    Chain(#[from] ChainError),
}

impl SessionError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        SessionError::InvalidParameter(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        SessionError::InvalidTransition(msg.into())
    }
}
