use async_trait::async_trait;
use thiserror::Error;

use crate::amount::TokenAmount;
use crate::chain::data_objects::{AccountInfo, ContractCall, TxReceipt};
use crate::channel::ChannelId;
use crate::types::{Address, TxHash};

/// A failure reported by the underlying blockchain provider (network error,
/// rejected simulation, malformed arguments). The call never reached the chain.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(msg: impl Into<String>) -> Self {
        ProviderError(msg.into())
    }
}

/// The narrow seam to the blockchain RPC client. Implementations own transport,
/// ABI encoding and transaction signing; this crate owns *which* calls are made
/// and how their outcomes are interpreted.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Dry-run the call against current chain state without spending gas.
    async fn simulate(&self, call: &ContractCall) -> Result<(), ProviderError>;

    /// Sign and broadcast the call as a transaction.
    async fn submit(&self, call: &ContractCall) -> Result<TxHash, ProviderError>;

    /// Block until the transaction is included and return its receipt.
    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ProviderError>;

    /// ERC-20 `allowance(owner, spender)` for the given token.
    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<TokenAmount, ProviderError>;

    /// ERC-20 `balanceOf(owner)` for the given token.
    async fn balance_of(&self, token: Address, owner: Address) -> Result<TokenAmount, ProviderError>;

    /// Channels the custody contract tracks for an account.
    async fn get_account_channels(&self, account: Address) -> Result<Vec<ChannelId>, ProviderError>;

    /// Custody balances for an account and token.
    async fn get_account_info(&self, account: Address, token: Address) -> Result<AccountInfo, ProviderError>;
}
