use libsluice::helpers::{Timestamp, Transcript};
use libsluice::signing::Signature;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("an envelope must carry exactly one of `req` and `res`")]
    AmbiguousDirection,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Every RPC method this core produces or consumes. Methods outside this set
/// are carried as [`Other`](RpcMethod::Other) so push notifications with
/// unknown names still flow to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcMethod {
    AuthRequest,
    AuthChallenge,
    AuthVerify,
    Ping,
    Pong,
    GetChannels,
    CreateAppSession,
    SubmitAppState,
    CloseAppSession,
    GetAppSessions,
    GetAppDefinition,
    ResizeChannel,
    CloseChannel,
    GetLedgerBalances,
    Transfer,
    BalanceUpdate,
    ChannelUpdate,
    AppSessionUpdate,
    Error,
    Other(String),
}

impl RpcMethod {
    pub fn as_str(&self) -> &str {
        match self {
            RpcMethod::AuthRequest => "auth_request",
            RpcMethod::AuthChallenge => "auth_challenge",
            RpcMethod::AuthVerify => "auth_verify",
            RpcMethod::Ping => "ping",
            RpcMethod::Pong => "pong",
            RpcMethod::GetChannels => "get_channels",
            RpcMethod::CreateAppSession => "create_app_session",
            RpcMethod::SubmitAppState => "submit_app_state",
            RpcMethod::CloseAppSession => "close_app_session",
            RpcMethod::GetAppSessions => "get_app_sessions",
            RpcMethod::GetAppDefinition => "get_app_definition",
            RpcMethod::ResizeChannel => "resize_channel",
            RpcMethod::CloseChannel => "close_channel",
            RpcMethod::GetLedgerBalances => "get_ledger_balances",
            RpcMethod::Transfer => "transfer",
            RpcMethod::BalanceUpdate => "balance_update",
            RpcMethod::ChannelUpdate => "channel_update",
            RpcMethod::AppSessionUpdate => "app_session_update",
            RpcMethod::Error => "error",
            RpcMethod::Other(name) => name,
        }
    }

    /// True for server-initiated notifications that are not responses to any request.
    pub fn is_push(&self) -> bool {
        matches!(self, RpcMethod::BalanceUpdate | RpcMethod::ChannelUpdate | RpcMethod::AppSessionUpdate)
    }
}

impl From<&str> for RpcMethod {
    fn from(s: &str) -> Self {
        match s {
            "auth_request" => RpcMethod::AuthRequest,
            "auth_challenge" => RpcMethod::AuthChallenge,
            "auth_verify" => RpcMethod::AuthVerify,
            "ping" => RpcMethod::Ping,
            "pong" => RpcMethod::Pong,
            "get_channels" => RpcMethod::GetChannels,
            "create_app_session" => RpcMethod::CreateAppSession,
            // `submit_state` is the legacy name for the same operation
            "submit_app_state" | "submit_state" => RpcMethod::SubmitAppState,
            "close_app_session" => RpcMethod::CloseAppSession,
            "get_app_sessions" => RpcMethod::GetAppSessions,
            "get_app_definition" => RpcMethod::GetAppDefinition,
            "resize_channel" => RpcMethod::ResizeChannel,
            "close_channel" => RpcMethod::CloseChannel,
            "get_ledger_balances" => RpcMethod::GetLedgerBalances,
            "transfer" => RpcMethod::Transfer,
            "balance_update" => RpcMethod::BalanceUpdate,
            "channel_update" => RpcMethod::ChannelUpdate,
            "app_session_update" => RpcMethod::AppSessionUpdate,
            "error" => RpcMethod::Error,
            other => RpcMethod::Other(other.to_string()),
        }
    }
}

impl Display for RpcMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The positional payload of a request or response:
/// `[requestId, method, params, timestamp]`. The timestamp is optional on the
/// wire; outgoing payloads always carry one.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    pub timestamp: Option<u64>,
}

impl Payload {
    pub fn new(id: u64, method: &RpcMethod, params: Vec<Value>) -> Self {
        Payload { id, method: method.as_str().to_string(), params, timestamp: Some(Timestamp::now().as_millis()) }
    }

    pub fn rpc_method(&self) -> RpcMethod {
        RpcMethod::from(self.method.as_str())
    }

    /// The canonical digest an envelope signature covers: a transcript hash of
    /// the payload's JSON array form under the `"Sluice Rpc v1"` domain.
    pub fn digest(&self) -> [u8; 32] {
        let json = serde_json::to_vec(self).expect("payload serialization is infallible");
        let mut t = Transcript::new("Sluice Rpc v1");
        t.append("payload", &json);
        t.finalize()
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let len = if self.timestamp.is_some() { 4 } else { 3 };
        let mut seq = s.serialize_seq(Some(len))?;
        seq.serialize_element(&self.id)?;
        seq.serialize_element(&self.method)?;
        seq.serialize_element(&self.params)?;
        if let Some(ts) = self.timestamp {
            seq.serialize_element(&ts)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = Payload;

            fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "a [id, method, params, timestamp?] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Payload, A::Error> {
                let id = seq.next_element::<u64>()?.ok_or_else(|| serde::de::Error::custom("missing request id"))?;
                let method =
                    seq.next_element::<String>()?.ok_or_else(|| serde::de::Error::custom("missing method"))?;
                let params =
                    seq.next_element::<Vec<Value>>()?.ok_or_else(|| serde::de::Error::custom("missing params"))?;
                let timestamp = seq.next_element::<u64>()?;
                Ok(Payload { id, method, params, timestamp })
            }
        }

        de.deserialize_seq(PayloadVisitor)
    }
}

/// One wire message. Exactly one of `req` and `res` is present; the envelope's
/// signatures cover the payload digest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res: Option<Payload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sig: Vec<Signature>,
}

impl Envelope {
    pub fn request(payload: Payload, sig: Vec<Signature>) -> Self {
        Envelope { req: Some(payload), res: None, sig }
    }

    pub fn response(payload: Payload, sig: Vec<Signature>) -> Self {
        Envelope { req: None, res: Some(payload), sig }
    }

    /// An error response reuses the envelope with method `"error"` and a single
    /// `{ "error": … }` params entry.
    pub fn error_response(id: u64, message: &str) -> Self {
        let payload = Payload::new(id, &RpcMethod::Error, vec![serde_json::json!({ "error": message })]);
        Envelope::response(payload, Vec::new())
    }

    /// Parse and validate one wire message. `req` and `res` are mutually
    /// exclusive; an envelope with both or neither is malformed.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match (&envelope.req, &envelope.res) {
            (Some(_), None) | (None, Some(_)) => Ok(envelope),
            _ => Err(EnvelopeError::AmbiguousDirection),
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The payload, whichever direction it travels.
    pub fn payload(&self) -> Option<&Payload> {
        self.req.as_ref().or(self.res.as_ref())
    }

    /// If this is an error response, the carried error message.
    pub fn error_message(&self) -> Option<String> {
        let payload = self.res.as_ref()?;
        if payload.rpc_method() != RpcMethod::Error {
            return None;
        }
        let detail = payload.params.first()?;
        Some(detail.get("error").and_then(Value::as_str).unwrap_or("unknown remote error").to_string())
    }
}
