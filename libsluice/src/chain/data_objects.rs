use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::amount::TokenAmount;
use crate::types::{Address, TxHash};

/// The default adjudicator-variant key.
pub const DEFAULT_ADJUDICATOR: &str = "base";

/// Contract addresses and chain identity, supplied by the caller at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// The custody contract holding channel funds.
    pub custody: Address,
    /// Adjudicator contract variants keyed by application type.
    pub adjudicators: HashMap<String, Address>,
}

impl ChainConfig {
    pub fn new(chain_id: u64, custody: Address) -> Self {
        ChainConfig { chain_id, custody, adjudicators: HashMap::new() }
    }

    pub fn with_adjudicator(mut self, kind: impl Into<String>, address: Address) -> Self {
        self.adjudicators.insert(kind.into(), address);
        self
    }

    /// Look up an adjudicator variant, falling back to `"base"` when `kind` is None.
    pub fn adjudicator(&self, kind: Option<&str>) -> Option<Address> {
        self.adjudicators.get(kind.unwrap_or(DEFAULT_ADJUDICATOR)).copied()
    }
}

/// Native value attached to a contract call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallValue(pub TokenAmount);

impl CallValue {
    pub fn none() -> Self {
        CallValue(TokenAmount::zero())
    }
}

/// One prepared contract invocation: target, function name and JSON-encoded
/// arguments. ABI encoding is the [`super::ChainClient`] implementation's job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractCall {
    pub to: Address,
    pub function: String,
    pub params: Value,
    pub value: CallValue,
}

impl ContractCall {
    pub fn new(to: Address, function: impl Into<String>, params: Value) -> Self {
        ContractCall { to, function: function.into(), params, value: CallValue::none() }
    }

    pub fn with_value(mut self, value: TokenAmount) -> Self {
        self.value = CallValue(value);
        self
    }
}

/// The outcome of a mined transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// False means the transaction was mined but reverted.
    pub success: bool,
}

/// Per-account, per-token custody information.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountInfo {
    pub available: TokenAmount,
    pub locked: TokenAmount,
    pub channel_count: u64,
}
