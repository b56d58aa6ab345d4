use futures::channel::{mpsc, oneshot};
use libsluice::amount::TokenAmount;
use libsluice::app_session::AppSessionId;
use libsluice::channel::ChannelId;
use libsluice::types::Address;
use serde_json::{json, Value};

use crate::connection::{ClientCommand, ConnectionStage};
use crate::envelope::RpcMethod;
use crate::errors::ClientError;

/// A cloneable handle onto the [`EventLoop`](crate::connection::EventLoop).
///
/// Requests resolve once the node responds, the request times out, or the
/// connection gives up. Fire-and-forget controls (`reset`, `close`, challenge
/// decisions) only fail if the event loop is already gone.
#[derive(Clone)]
pub struct NodeClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl NodeClient {
    pub(crate) fn new(commands: mpsc::UnboundedSender<ClientCommand>) -> Self {
        NodeClient { commands }
    }

    /// Send one request and wait for the correlated response params.
    pub async fn request(&self, method: RpcMethod, params: Vec<Value>) -> Result<Vec<Value>, ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.commands.unbounded_send(ClientCommand::Request { method, params, sender })?;
        receiver.await?
    }

    /// The current connection stage.
    pub async fn stage(&self) -> Result<ConnectionStage, ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.commands.unbounded_send(ClientCommand::Stage(sender))?;
        Ok(receiver.await?)
    }

    /// Sign the auth challenge the connection is parked on.
    pub fn approve_challenge(&self) -> Result<(), ClientError> {
        Ok(self.commands.unbounded_send(ClientCommand::ApproveChallenge)?)
    }

    /// Decline the auth challenge. The connection moves to `AuthFailed` and
    /// stays there until [`reset`](NodeClient::reset).
    pub fn reject_challenge(&self) -> Result<(), ClientError> {
        Ok(self.commands.unbounded_send(ClientCommand::RejectChallenge)?)
    }

    /// Leave `AuthFailed`/`Failed` and start a fresh connection attempt.
    pub fn reset(&self) -> Result<(), ClientError> {
        Ok(self.commands.unbounded_send(ClientCommand::Reset)?)
    }

    /// Shut the connection down for good.
    pub fn close(&self) -> Result<(), ClientError> {
        Ok(self.commands.unbounded_send(ClientCommand::Close)?)
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(RpcMethod::Ping, vec![]).await?;
        Ok(())
    }

    /// Channels the node tracks for `participant` (all of ours when `None`).
    pub async fn get_channels(&self, participant: Option<Address>) -> Result<Vec<Value>, ClientError> {
        let mut filter = json!({});
        if let Some(address) = participant {
            filter["participant"] = json!(address);
        }
        self.request(RpcMethod::GetChannels, vec![filter]).await
    }

    pub async fn get_ledger_balances(&self, participant: Option<Address>) -> Result<Vec<Value>, ClientError> {
        let mut filter = json!({});
        if let Some(address) = participant {
            filter["participant"] = json!(address);
        }
        self.request(RpcMethod::GetLedgerBalances, vec![filter]).await
    }

    pub async fn get_app_sessions(
        &self,
        participant: Option<Address>,
        status: Option<&str>,
    ) -> Result<Vec<Value>, ClientError> {
        let mut filter = json!({});
        if let Some(address) = participant {
            filter["participant"] = json!(address);
        }
        if let Some(status) = status {
            filter["status"] = json!(status);
        }
        self.request(RpcMethod::GetAppSessions, vec![filter]).await
    }

    pub async fn get_app_definition(&self, app_session_id: &AppSessionId) -> Result<Vec<Value>, ClientError> {
        self.request(RpcMethod::GetAppDefinition, vec![json!({ "app_session_id": app_session_id })]).await
    }

    /// Off-chain ledger transfer to `destination`.
    pub async fn transfer(
        &self,
        destination: Address,
        allocations: &[(String, TokenAmount)],
    ) -> Result<Vec<Value>, ClientError> {
        if allocations.is_empty() {
            return Err(ClientError::missing_parameter("a transfer needs at least one allocation"));
        }
        let allocations: Vec<Value> =
            allocations.iter().map(|(asset, amount)| json!({ "asset": asset, "amount": amount })).collect();
        let params = json!({ "destination": destination, "allocations": allocations });
        self.request(RpcMethod::Transfer, vec![params]).await
    }

    /// Move funds between the channel and the unified ledger balance.
    /// `allocate` moves ledger funds into the channel, `resize` changes the
    /// on-chain deposit; either may be omitted.
    pub async fn resize_channel(
        &self,
        channel_id: &ChannelId,
        allocate: Option<&TokenAmount>,
        resize: Option<&TokenAmount>,
        funds_destination: Address,
    ) -> Result<Vec<Value>, ClientError> {
        if allocate.is_none() && resize.is_none() {
            return Err(ClientError::missing_parameter("resize_channel needs an allocate or resize amount"));
        }
        let mut params = json!({
            "channel_id": channel_id,
            "funds_destination": funds_destination,
        });
        if let Some(amount) = allocate {
            params["allocate_amount"] = json!(amount);
        }
        if let Some(amount) = resize {
            params["resize_amount"] = json!(amount);
        }
        self.request(RpcMethod::ResizeChannel, vec![params]).await
    }

    /// Cooperatively close a ledger channel, paying out to `funds_destination`.
    pub async fn close_channel(
        &self,
        channel_id: &ChannelId,
        funds_destination: Address,
    ) -> Result<Vec<Value>, ClientError> {
        let params = json!({ "channel_id": channel_id, "funds_destination": funds_destination });
        self.request(RpcMethod::CloseChannel, vec![params]).await
    }
}
