//! RPC layer of the sluice state-channel stack: the wire envelope, the
//! websocket transport seam, the connection/authentication state machine with
//! request-response correlation and reconnection, and the application-session
//! protocol spoken with a coordinating node.

pub mod app_session;
pub mod auth;
pub mod client;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod transport;

pub use app_session::AppSessionClient;
pub use client::NodeClient;
pub use connection::{new_node_client, ChallengePolicy, ConnectOptions, ConnectionStage, EventLoop};
pub use envelope::{Envelope, Payload, RpcMethod};
pub use errors::ClientError;
pub use events::NodeEvent;
pub use transport::{Transport, TransportError, TransportLink, WsTransport};
