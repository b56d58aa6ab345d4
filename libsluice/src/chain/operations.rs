use log::*;
use serde_json::json;
use std::sync::Arc;

use crate::amount::TokenAmount;
use crate::chain::client::ChainClient;
use crate::chain::data_objects::{AccountInfo, ChainConfig, ContractCall, TxReceipt};
use crate::chain::error::ChainError;
use crate::channel::{ChannelConfig, ChannelId, State};
use crate::signing::{MessageSigner, Signature};
use crate::types::Address;

/// Executes protocol actions against the custody/adjudicator contracts.
///
/// Every write operation follows the same three-step contract: simulate the call
/// to fail fast without gas, submit the transaction, then wait for inclusion and
/// inspect the receipt. A reverted receipt is a [`ChainError::Transaction`]; a
/// call that never reached the chain is a [`ChainError::ContractCall`].
pub struct ChainOperations<C> {
    client: Arc<C>,
    config: ChainConfig,
    signer: Option<Arc<dyn MessageSigner>>,
}

impl<C: ChainClient> ChainOperations<C> {
    pub fn new(client: Arc<C>, config: ChainConfig, signer: Option<Arc<dyn MessageSigner>>) -> Self {
        ChainOperations { client, config, signer }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    /// The uniform simulate → submit → confirm cycle shared by every write operation.
    async fn execute(&self, op: &'static str, call: ContractCall) -> Result<TxReceipt, ChainError> {
        if self.signer.is_none() {
            return Err(ChainError::MissingSigner);
        }
        trace!("Simulating {op} against {}", call.to);
        self.client.simulate(&call).await.map_err(|e| ChainError::contract_call(op, e))?;
        let tx_hash = self.client.submit(&call).await.map_err(|e| ChainError::contract_call(op, e))?;
        debug!("{op} submitted as {tx_hash}, awaiting inclusion");
        let receipt = self.client.wait_for_receipt(tx_hash).await.map_err(|e| ChainError::contract_call(op, e))?;
        if !receipt.success {
            warn!("{op} transaction {tx_hash} was mined but reverted");
            return Err(ChainError::transaction(op, receipt.tx_hash));
        }
        info!("{op} confirmed in block {} ({tx_hash})", receipt.block_number);
        Ok(receipt)
    }

    /// `create(channel, initialState)` on the custody contract.
    pub async fn create_channel(&self, channel: &ChannelConfig, initial: &State) -> Result<TxReceipt, ChainError> {
        let call = ContractCall::new(
            self.config.custody,
            "create",
            json!({ "channel": channel, "initial": initial }),
        );
        self.execute("create_channel", call).await
    }

    /// `join(channelId, index, signature)`: the guest countersigns into an open channel.
    pub async fn join_channel(
        &self,
        channel_id: ChannelId,
        index: usize,
        signature: &Signature,
    ) -> Result<TxReceipt, ChainError> {
        let call = ContractCall::new(
            self.config.custody,
            "join",
            json!({ "channel_id": channel_id, "index": index, "sig": signature }),
        );
        self.execute("join_channel", call).await
    }

    /// `close(channelId, candidate, proofs)`: cooperative or final-state close.
    pub async fn close_channel(
        &self,
        channel_id: ChannelId,
        candidate: &State,
        proofs: &[State],
    ) -> Result<TxReceipt, ChainError> {
        let call = self.adjudicated_call("close", channel_id, candidate, proofs);
        self.execute("close_channel", call).await
    }

    /// `challenge(channelId, candidate, proofs)`: starts the dispute timer when the
    /// counterparty is unresponsive.
    pub async fn challenge_channel(
        &self,
        channel_id: ChannelId,
        candidate: &State,
        proofs: &[State],
    ) -> Result<TxReceipt, ChainError> {
        let call = self.adjudicated_call("challenge", channel_id, candidate, proofs);
        self.execute("challenge_channel", call).await
    }

    /// `checkpoint(channelId, candidate, proofs)`: anchors a state on-chain without closing.
    pub async fn checkpoint_channel(
        &self,
        channel_id: ChannelId,
        candidate: &State,
        proofs: &[State],
    ) -> Result<TxReceipt, ChainError> {
        let call = self.adjudicated_call("checkpoint", channel_id, candidate, proofs);
        self.execute("checkpoint_channel", call).await
    }

    /// `reset(channelId, candidate, proofs, newChannel, newDeposit)`: closes and
    /// immediately reopens with fresh parameters in one transaction.
    pub async fn reset_channel(
        &self,
        channel_id: ChannelId,
        candidate: &State,
        proofs: &[State],
        new_channel: &ChannelConfig,
        new_deposit: &State,
    ) -> Result<TxReceipt, ChainError> {
        let call = ContractCall::new(
            self.config.custody,
            "reset",
            json!({
                "channel_id": channel_id,
                "candidate": candidate,
                "proofs": proofs,
                "new_channel": new_channel,
                "new_deposit": new_deposit,
            }),
        );
        self.execute("reset_channel", call).await
    }

    /// `deposit(token, amount)` into the custody contract.
    ///
    /// For ERC-20 tokens the custody contract pulls funds via `transferFrom`, so
    /// when the allowance is below `amount`, the full deposit amount is approved
    /// first. The native asset is attached as call value instead.
    pub async fn deposit(&self, token: Address, amount: TokenAmount) -> Result<TxReceipt, ChainError> {
        let owner = self.signer_address().ok_or(ChainError::MissingSigner)?;
        if !token.is_zero() {
            let allowance = self
                .client
                .allowance(token, owner, self.config.custody)
                .await
                .map_err(|e| ChainError::contract_call("deposit", e))?;
            if allowance < amount {
                debug!("Allowance {allowance} below deposit, approving the full {amount} first");
                self.approve_tokens(token, amount).await?;
            }
        }
        let mut call =
            ContractCall::new(self.config.custody, "deposit", json!({ "token": token, "amount": amount }));
        if token.is_zero() {
            call = call.with_value(amount);
        }
        self.execute("deposit", call).await
    }

    /// `withdraw(token, amount)` from the caller's free custody balance.
    pub async fn withdraw(&self, token: Address, amount: TokenAmount) -> Result<TxReceipt, ChainError> {
        let call = ContractCall::new(self.config.custody, "withdraw", json!({ "token": token, "amount": amount }));
        self.execute("withdraw", call).await
    }

    /// ERC-20 `approve(custody, amount)`.
    pub async fn approve_tokens(&self, token: Address, amount: TokenAmount) -> Result<TxReceipt, ChainError> {
        if token.is_zero() {
            return Err(ChainError::invalid_parameter("approve_tokens", "the native asset has no allowance"));
        }
        let call = ContractCall::new(token, "approve", json!({ "spender": self.config.custody, "amount": amount }));
        self.execute("approve_tokens", call).await
    }

    pub async fn get_account_channels(&self, account: Address) -> Result<Vec<ChannelId>, ChainError> {
        self.client.get_account_channels(account).await.map_err(|e| ChainError::contract_call("get_account_channels", e))
    }

    pub async fn get_account_info(&self, account: Address, token: Address) -> Result<AccountInfo, ChainError> {
        self.client.get_account_info(account, token).await.map_err(|e| ChainError::contract_call("get_account_info", e))
    }

    fn adjudicated_call(
        &self,
        function: &'static str,
        channel_id: ChannelId,
        candidate: &State,
        proofs: &[State],
    ) -> ContractCall {
        ContractCall::new(
            self.config.custody,
            function,
            json!({ "channel_id": channel_id, "candidate": candidate, "proofs": proofs }),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A scripted chain client for exercising the operation layer without a chain.

    use super::*;
    use crate::chain::client::ProviderError;
    use crate::types::TxHash;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedChain {
        /// Function names whose simulation should be rejected.
        pub reject_simulation: Mutex<Vec<String>>,
        /// Function names whose transaction should revert after mining.
        pub revert: Mutex<Vec<String>>,
        /// Every call that made it to `submit`, in order.
        pub submitted: Mutex<Vec<ContractCall>>,
        pub allowances: Mutex<HashMap<(Address, Address), TokenAmount>>,
        pub account_info: Mutex<HashMap<(Address, Address), AccountInfo>>,
        counter: Mutex<u8>,
    }

    impl ScriptedChain {
        pub fn submitted_functions(&self) -> Vec<String> {
            self.submitted.lock().unwrap().iter().map(|c| c.function.clone()).collect()
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedChain {
        async fn simulate(&self, call: &ContractCall) -> Result<(), ProviderError> {
            if self.reject_simulation.lock().unwrap().contains(&call.function) {
                return Err(ProviderError::new(format!("simulation of {} rejected", call.function)));
            }
            Ok(())
        }

        async fn submit(&self, call: &ContractCall) -> Result<TxHash, ProviderError> {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            let mut hash = [0u8; 32];
            hash[0] = *counter;
            // Record reverted calls too; revert happens after mining.
            self.submitted.lock().unwrap().push(call.clone());
            if self.revert.lock().unwrap().contains(&call.function) {
                hash[31] = 0xff;
            }
            Ok(TxHash::new(hash))
        }

        async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ProviderError> {
            let success = tx_hash.as_bytes()[31] != 0xff;
            Ok(TxReceipt { tx_hash, block_number: 1, success })
        }

        async fn allowance(
            &self,
            token: Address,
            owner: Address,
            _spender: Address,
        ) -> Result<TokenAmount, ProviderError> {
            Ok(self.allowances.lock().unwrap().get(&(token, owner)).copied().unwrap_or_else(TokenAmount::zero))
        }

        async fn balance_of(&self, _token: Address, _owner: Address) -> Result<TokenAmount, ProviderError> {
            Ok(TokenAmount::zero())
        }

        async fn get_account_channels(&self, _account: Address) -> Result<Vec<ChannelId>, ProviderError> {
            Ok(Vec::new())
        }

        async fn get_account_info(&self, account: Address, token: Address) -> Result<AccountInfo, ProviderError> {
            Ok(self
                .account_info
                .lock()
                .unwrap()
                .get(&(account, token))
                .cloned()
                .unwrap_or(AccountInfo { available: TokenAmount::zero(), locked: TokenAmount::zero(), channel_count: 0 }))
        }
    }
}
