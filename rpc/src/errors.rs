use libsluice::app_session::{AppSessionError, AppSessionId};
use libsluice::signing::SignerError;
use libsluice::types::Address;
use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::transport::TransportError;

/// The client-facing error taxonomy.
///
/// Misconfiguration (`MissingParameter`) and local invariant violations
/// (`VersionGap`, `SessionClosed`, `QuorumNotMet`) fail immediately and are
/// never retried. Transport failures are retried at the connection level only;
/// a caller sees them once retries are exhausted (`ReconnectFailed`) or its own
/// request timeout fires.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    #[error("the client is not connected")]
    NotConnected,
    #[error("request timed out: {method}")]
    RequestTimeout { method: String },
    #[error("the connection was closed with the request in flight")]
    ConnectionClosed,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("the authentication challenge was rejected by the user")]
    UserRejected,
    #[error("reconnection attempts exhausted")]
    ReconnectFailed,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed wire message: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("remote error: {0}")]
    Rpc(String),
    #[error("version {submitted} does not follow the last accepted version {last}")]
    VersionGap { last: u64, submitted: u64 },
    #[error("app session {0} is closed; no further updates are accepted")]
    SessionClosed(AppSessionId),
    #[error("app session {0} is not tracked by this client")]
    UnknownSession(AppSessionId),
    #[error("collected signer weight {collected} does not meet quorum {required}")]
    QuorumNotMet { required: u16, collected: u32 },
    #[error("no pending session under key {0}")]
    UnknownPendingSession(String),
    #[error("{0} is not a participant of this session")]
    UnknownParticipant(Address),
    #[error(transparent)]
    AppSession(#[from] AppSessionError),
    #[error(transparent)]
    Signer(#[from] SignerError),
}

impl ClientError {
    pub fn missing_parameter(msg: impl Into<String>) -> Self {
        ClientError::MissingParameter(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        ClientError::Rpc(msg.into())
    }
}

impl From<futures::channel::mpsc::SendError> for ClientError {
    fn from(_: futures::channel::mpsc::SendError) -> Self {
        // The event loop is gone; from the caller's view the connection is closed.
        ClientError::ConnectionClosed
    }
}

impl<T> From<futures::channel::mpsc::TrySendError<T>> for ClientError {
    fn from(_: futures::channel::mpsc::TrySendError<T>) -> Self {
        ClientError::ConnectionClosed
    }
}

impl From<futures::channel::oneshot::Canceled> for ClientError {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        ClientError::ConnectionClosed
    }
}
