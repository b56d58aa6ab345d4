//! The on-chain operation layer: a deterministic mapping from protocol actions
//! to custody-contract transactions with uniform simulate → submit → confirm
//! handling. The blockchain itself is reached through the [`ChainClient`] seam.

mod client;
mod data_objects;
pub mod error;
pub(crate) mod operations;

pub use client::{ChainClient, ProviderError};
pub use data_objects::{AccountInfo, CallValue, ChainConfig, ContractCall, TxReceipt};
pub use operations::ChainOperations;
