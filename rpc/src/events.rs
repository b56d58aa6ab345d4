use serde_json::Value;

use crate::connection::ConnectionStage;
use crate::envelope::Envelope;

/// Events pushed to the consumer's event stream, in the order the connection
/// observed them. Every inbound envelope is surfaced as [`Message`](NodeEvent::Message)
/// *before* request correlation runs, so listeners see pushed events even when
/// they also resolve a pending request.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// The connection state machine moved to a new stage.
    StageChanged(ConnectionStage),
    /// Any inbound envelope, surfaced before correlation.
    Message(Envelope),
    /// The node issued an auth challenge and the client is configured for
    /// interactive approval. Call `approve_challenge`/`reject_challenge`.
    ChallengeReceived(String),
    /// A ledger balance changed.
    BalanceUpdate(Vec<Value>),
    /// A channel's status changed.
    ChannelUpdate(Vec<Value>),
    /// An application session advanced.
    AppSessionUpdate(Vec<Value>),
}
