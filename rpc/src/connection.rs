use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use libsluice::signing::MessageSigner;
use libsluice::types::Address;
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant};

use crate::auth::{AuthAction, AuthHandshake};
use crate::client::NodeClient;
use crate::envelope::{Envelope, Payload, RpcMethod};
use crate::errors::ClientError;
use crate::events::NodeEvent;
use crate::transport::{Transport, TransportLink};

/// How often the event loop sweeps request deadlines and the keepalive timer.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// What to do when the node issues an auth challenge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChallengePolicy {
    /// Sign the challenge immediately.
    #[default]
    Auto,
    /// Surface the challenge as [`NodeEvent::ChallengeReceived`] and wait for
    /// `approve_challenge` / `reject_challenge`.
    Interactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStage {
    Disconnected,
    Connecting,
    Authenticating,
    /// An interactive auth challenge is waiting for the user's decision.
    PendingChallengeApproval,
    Connected,
    Reconnecting,
    /// Authentication failed or was rejected. No reconnection until `reset`.
    AuthFailed,
    /// Reconnection attempts are exhausted. No reconnection until `reset`.
    Failed,
    /// The client was closed. Terminal.
    Destroyed,
}

impl Display for ConnectionStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStage::Disconnected => "disconnected",
            ConnectionStage::Connecting => "connecting",
            ConnectionStage::Authenticating => "authenticating",
            ConnectionStage::PendingChallengeApproval => "pending_challenge_approval",
            ConnectionStage::Connected => "connected",
            ConnectionStage::Reconnecting => "reconnecting",
            ConnectionStage::AuthFailed => "auth_failed",
            ConnectionStage::Failed => "failed",
            ConnectionStage::Destroyed => "destroyed",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub url: String,
    /// The authorization scope requested in the handshake.
    pub scope: String,
    /// The application address the session is bound to, if any.
    pub application: Option<Address>,
    /// Requested lifetime of the issued credential.
    pub auth_expiry: Duration,
    pub challenge_policy: ChallengePolicy,
    /// Per-request deadline. Expired requests resolve with
    /// [`ClientError::RequestTimeout`]; a late response is then ignored.
    pub request_timeout: Duration,
    /// Reconnections attempted after a drop before giving up.
    pub max_reconnect_attempts: u32,
    /// Attempt `n` waits `n * reconnect_base_delay` before dialing.
    pub reconnect_base_delay: Duration,
    /// Idle time after which a `ping` is sent to keep the connection warm.
    pub keepalive_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            url: "ws://localhost:8000/ws".into(),
            scope: "console".into(),
            application: None,
            auth_expiry: Duration::from_secs(3600),
            challenge_policy: ChallengePolicy::Auto,
            request_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

pub(crate) enum ClientCommand {
    Request {
        method: RpcMethod,
        params: Vec<Value>,
        sender: oneshot::Sender<Result<Vec<Value>, ClientError>>,
    },
    ApproveChallenge,
    RejectChallenge,
    Stage(oneshot::Sender<ConnectionStage>),
    /// Leave `AuthFailed`/`Failed` and start connecting again.
    Reset,
    Close,
}

/// Create a client handle, its event stream, and the event loop that drives
/// them. The caller spawns [`EventLoop::run`]; the handle and the stream stay
/// useful for as long as the loop lives.
pub fn new_node_client(
    transport: Arc<dyn Transport>,
    signer: Arc<dyn MessageSigner>,
    options: ConnectOptions,
) -> (NodeClient, mpsc::UnboundedReceiver<NodeEvent>, EventLoop) {
    let (command_tx, command_rx) = mpsc::unbounded();
    let (event_tx, event_rx) = mpsc::unbounded();
    let event_loop = EventLoop {
        transport,
        signer,
        options,
        commands: command_rx,
        events: event_tx,
        stage: ConnectionStage::Disconnected,
        jwt: None,
        next_id: 1,
        attempts: 0,
        user_rejected: false,
        auth_error: None,
    };
    (NodeClient::new(command_tx), event_rx, event_loop)
}

/// Why one connection ended, as seen by the outer reconnection loop.
enum SessionEnd {
    /// `close` was called or every client handle was dropped.
    UserClosed,
    /// The user rejected the interactive auth challenge.
    AuthRejected,
    /// The node rejected the handshake.
    AuthFailed,
    /// The transport dropped; eligible for reconnection.
    Dropped,
}

enum Flow {
    Continue,
    End(SessionEnd),
}

struct PendingRequest {
    method: String,
    deadline: Instant,
    sender: oneshot::Sender<Result<Vec<Value>, ClientError>>,
}

/// The connection driver. Owns the transport, the signer, request correlation
/// and the reconnection policy; everything else talks to it through
/// [`NodeClient`] commands and the [`NodeEvent`] stream.
pub struct EventLoop {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn MessageSigner>,
    options: ConnectOptions,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<NodeEvent>,
    stage: ConnectionStage,
    /// Credential cache. Survives reconnects; cleared when the node reports it
    /// expired.
    jwt: Option<String>,
    /// Monotonic across reconnects so a late response from a previous
    /// connection can never collide with a live request id.
    next_id: u64,
    attempts: u32,
    user_rejected: bool,
    auth_error: Option<String>,
}

impl EventLoop {
    pub async fn run(mut self) {
        info!("Event loop started for {}", self.options.url);
        loop {
            let stage =
                if self.attempts > 0 { ConnectionStage::Reconnecting } else { ConnectionStage::Connecting };
            self.set_stage(stage);
            match self.transport.connect(&self.options.url).await {
                Ok(link) => match self.drive(link).await {
                    SessionEnd::UserClosed => {
                        self.set_stage(ConnectionStage::Destroyed);
                        break;
                    }
                    SessionEnd::AuthRejected | SessionEnd::AuthFailed => {
                        self.set_stage(ConnectionStage::AuthFailed);
                        if !self.park().await {
                            break;
                        }
                        continue;
                    }
                    SessionEnd::Dropped => {
                        self.set_stage(ConnectionStage::Disconnected);
                    }
                },
                Err(e) => warn!("Connection attempt failed: {e}"),
            }
            self.attempts += 1;
            if self.attempts > self.options.max_reconnect_attempts {
                warn!("Exhausted {} reconnection attempts, giving up", self.options.max_reconnect_attempts);
                self.set_stage(ConnectionStage::Failed);
                if !self.park().await {
                    break;
                }
                continue;
            }
            let delay = self.options.reconnect_base_delay * self.attempts;
            info!("Reconnecting in {delay:?} (attempt {} of {})", self.attempts, self.options.max_reconnect_attempts);
            if !self.backoff(delay).await {
                break;
            }
        }
        debug!("Event loop terminated");
    }

    /// Drive one live connection until it ends.
    async fn drive(&mut self, mut link: Box<dyn TransportLink>) -> SessionEnd {
        let mut auth = AuthHandshake::new(
            self.signer.clone(),
            self.options.scope.clone(),
            self.options.application,
            self.options.auth_expiry,
            self.options.challenge_policy,
            self.jwt.clone(),
        );
        let mut pending: HashMap<u64, PendingRequest> = HashMap::new();
        self.set_stage(ConnectionStage::Authenticating);
        let (method, params) = auth.initial_request();
        if let Err(e) = self.send_request(&mut link, method, params, false).await {
            warn!("Could not open the handshake: {e}");
            return SessionEnd::Dropped;
        }
        let mut ticker = interval(SWEEP_INTERVAL);
        let mut last_traffic = Instant::now();
        loop {
            tokio::select! {
                inbound = link.next_message() => {
                    match inbound {
                        Some(Ok(text)) => {
                            last_traffic = Instant::now();
                            match self.handle_inbound(&text, &mut link, &mut auth, &mut pending).await {
                                Flow::Continue => {}
                                Flow::End(end) => {
                                    self.fail_pending(&mut pending, |_| ClientError::ConnectionClosed);
                                    return end;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Transport error, dropping the connection: {e}");
                            self.fail_pending(&mut pending, |_| ClientError::ConnectionClosed);
                            return SessionEnd::Dropped;
                        }
                        None => {
                            info!("The node closed the connection");
                            self.fail_pending(&mut pending, |_| ClientError::ConnectionClosed);
                            return SessionEnd::Dropped;
                        }
                    }
                }
                command = self.commands.next() => {
                    let Some(command) = command else {
                        debug!("All client handles dropped, closing");
                        link.close().await;
                        self.fail_pending(&mut pending, |_| ClientError::ConnectionClosed);
                        return SessionEnd::UserClosed;
                    };
                    match self.handle_command(command, &mut link, &mut auth, &mut pending).await {
                        Flow::Continue => {}
                        Flow::End(end) => {
                            let user_rejected = self.user_rejected;
                            self.fail_pending(&mut pending, |_| {
                                if user_rejected { ClientError::UserRejected } else { ClientError::ConnectionClosed }
                            });
                            return end;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_deadlines(&mut pending);
                    if self.stage == ConnectionStage::Connected
                        && last_traffic.elapsed() >= self.options.keepalive_interval
                    {
                        // Fire-and-forget: the pong comes back as an unmatched
                        // response and is dropped by correlation.
                        if let Err(e) = self.send_request(&mut link, RpcMethod::Ping, vec![], true).await {
                            warn!("Keepalive failed, dropping the connection: {e}");
                            self.fail_pending(&mut pending, |_| ClientError::ConnectionClosed);
                            return SessionEnd::Dropped;
                        }
                        last_traffic = Instant::now();
                    }
                }
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        text: &str,
        link: &mut Box<dyn TransportLink>,
        auth: &mut AuthHandshake,
        pending: &mut HashMap<u64, PendingRequest>,
    ) -> Flow {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring malformed message: {e}");
                return Flow::Continue;
            }
        };
        // Listeners see every envelope, before correlation claims it.
        self.emit(NodeEvent::Message(envelope.clone()));
        if !auth.is_authenticated() {
            match auth.on_envelope(&envelope) {
                AuthAction::Send(method, params) => {
                    if let Err(e) = self.send_request(link, method, params, false).await {
                        warn!("Handshake send failed: {e}");
                        return Flow::End(SessionEnd::Dropped);
                    }
                    return Flow::Continue;
                }
                AuthAction::AwaitApproval(challenge) => {
                    self.set_stage(ConnectionStage::PendingChallengeApproval);
                    self.emit(NodeEvent::ChallengeReceived(challenge));
                    return Flow::Continue;
                }
                AuthAction::Authenticated { jwt } => {
                    info!("Authenticated with {}", self.options.url);
                    self.jwt = jwt;
                    self.attempts = 0;
                    self.auth_error = None;
                    self.set_stage(ConnectionStage::Connected);
                    return Flow::Continue;
                }
                AuthAction::Restart => {
                    self.jwt = None;
                    let (method, params) = auth.initial_request();
                    if let Err(e) = self.send_request(link, method, params, false).await {
                        warn!("Handshake restart failed: {e}");
                        return Flow::End(SessionEnd::Dropped);
                    }
                    return Flow::Continue;
                }
                AuthAction::Fail(message) => {
                    warn!("Authentication failed: {message}");
                    self.auth_error = Some(message);
                    return Flow::End(SessionEnd::AuthFailed);
                }
                AuthAction::Ignore => {}
            }
        }
        if let Some(payload) = &envelope.res {
            if let Some(request) = pending.remove(&payload.id) {
                let result = match envelope.error_message() {
                    Some(message) => Err(ClientError::Rpc(message)),
                    None => Ok(payload.params.clone()),
                };
                let _ = request.sender.send(result);
                return Flow::Continue;
            }
        }
        if let Some(payload) = envelope.payload() {
            match payload.rpc_method() {
                RpcMethod::BalanceUpdate => self.emit(NodeEvent::BalanceUpdate(payload.params.clone())),
                RpcMethod::ChannelUpdate => self.emit(NodeEvent::ChannelUpdate(payload.params.clone())),
                RpcMethod::AppSessionUpdate => self.emit(NodeEvent::AppSessionUpdate(payload.params.clone())),
                method => trace!("Ignoring unmatched {method} (id {})", payload.id),
            }
        }
        Flow::Continue
    }

    async fn handle_command(
        &mut self,
        command: ClientCommand,
        link: &mut Box<dyn TransportLink>,
        auth: &mut AuthHandshake,
        pending: &mut HashMap<u64, PendingRequest>,
    ) -> Flow {
        match command {
            ClientCommand::Request { method, params, sender } => {
                if self.stage != ConnectionStage::Connected {
                    let _ = sender.send(Err(ClientError::NotConnected));
                    return Flow::Continue;
                }
                match self.send_request(link, method.clone(), params, true).await {
                    Ok(id) => {
                        let deadline = Instant::now() + self.options.request_timeout;
                        pending.insert(id, PendingRequest { method: method.to_string(), deadline, sender });
                        Flow::Continue
                    }
                    Err(e @ ClientError::Signer(_)) => {
                        let _ = sender.send(Err(e));
                        Flow::Continue
                    }
                    Err(e) => {
                        warn!("Send failed, dropping the connection: {e}");
                        let _ = sender.send(Err(ClientError::ConnectionClosed));
                        Flow::End(SessionEnd::Dropped)
                    }
                }
            }
            ClientCommand::ApproveChallenge => {
                match auth.approve() {
                    Some(AuthAction::Send(method, params)) => {
                        self.set_stage(ConnectionStage::Authenticating);
                        if let Err(e) = self.send_request(link, method, params, false).await {
                            warn!("Handshake send failed: {e}");
                            return Flow::End(SessionEnd::Dropped);
                        }
                    }
                    Some(AuthAction::Fail(message)) => {
                        self.auth_error = Some(message);
                        return Flow::End(SessionEnd::AuthFailed);
                    }
                    _ => trace!("No challenge waiting for approval"),
                }
                Flow::Continue
            }
            ClientCommand::RejectChallenge => {
                if self.stage == ConnectionStage::PendingChallengeApproval {
                    info!("Auth challenge rejected by the user");
                    self.user_rejected = true;
                    link.close().await;
                    return Flow::End(SessionEnd::AuthRejected);
                }
                Flow::Continue
            }
            ClientCommand::Stage(sender) => {
                let _ = sender.send(self.stage);
                Flow::Continue
            }
            ClientCommand::Reset => Flow::Continue,
            ClientCommand::Close => {
                link.close().await;
                Flow::End(SessionEnd::UserClosed)
            }
        }
    }

    /// Assign an id, timestamp and (optionally) a session-key signature, then
    /// put the request on the wire.
    async fn send_request(
        &mut self,
        link: &mut Box<dyn TransportLink>,
        method: RpcMethod,
        params: Vec<Value>,
        signed: bool,
    ) -> Result<u64, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let payload = Payload::new(id, &method, params);
        let sig = if signed { vec![self.signer.sign(&payload.digest())?] } else { Vec::new() };
        let text = Envelope::request(payload, sig).to_json()?;
        trace!("Sending {method} (id {id})");
        link.send(text).await?;
        Ok(id)
    }

    fn sweep_deadlines(&mut self, pending: &mut HashMap<u64, PendingRequest>) {
        let now = Instant::now();
        let expired: Vec<u64> =
            pending.iter().filter(|(_, request)| request.deadline <= now).map(|(id, _)| *id).collect();
        for id in expired {
            if let Some(request) = pending.remove(&id) {
                debug!("Request {id} ({}) timed out", request.method);
                let _ = request.sender.send(Err(ClientError::RequestTimeout { method: request.method }));
            }
        }
    }

    fn fail_pending<F>(&mut self, pending: &mut HashMap<u64, PendingRequest>, error: F)
    where
        F: Fn(&str) -> ClientError,
    {
        for (_, request) in pending.drain() {
            let _ = request.sender.send(Err(error(&request.method)));
        }
    }

    /// Hold in a terminal-until-reset stage, answering commands, until the
    /// client resets (true) or closes (false).
    async fn park(&mut self) -> bool {
        loop {
            match self.commands.next().await {
                None => return false,
                Some(ClientCommand::Close) => {
                    self.set_stage(ConnectionStage::Destroyed);
                    return false;
                }
                Some(ClientCommand::Reset) => {
                    info!("Client reset, reconnecting");
                    self.attempts = 0;
                    self.user_rejected = false;
                    self.auth_error = None;
                    self.set_stage(ConnectionStage::Disconnected);
                    return true;
                }
                Some(ClientCommand::Stage(sender)) => {
                    let _ = sender.send(self.stage);
                }
                Some(ClientCommand::Request { sender, .. }) => {
                    let _ = sender.send(Err(self.offline_error()));
                }
                Some(_) => {}
            }
        }
    }

    /// Wait out a reconnect delay while still answering commands.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                command = self.commands.next() => match command {
                    None => return false,
                    Some(ClientCommand::Close) => {
                        self.set_stage(ConnectionStage::Destroyed);
                        return false;
                    }
                    Some(ClientCommand::Reset) => {
                        self.attempts = 0;
                        self.user_rejected = false;
                        return true;
                    }
                    Some(ClientCommand::Stage(sender)) => {
                        let _ = sender.send(self.stage);
                    }
                    Some(ClientCommand::Request { sender, .. }) => {
                        let _ = sender.send(Err(ClientError::NotConnected));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    fn offline_error(&self) -> ClientError {
        if self.user_rejected {
            ClientError::UserRejected
        } else if self.stage == ConnectionStage::Failed {
            ClientError::ReconnectFailed
        } else if let Some(message) = &self.auth_error {
            ClientError::AuthFailed(message.clone())
        } else {
            ClientError::NotConnected
        }
    }

    fn set_stage(&mut self, stage: ConnectionStage) {
        if self.stage == stage {
            return;
        }
        debug!("Connection stage: {} -> {}", self.stage, stage);
        self.stage = stage;
        self.emit(NodeEvent::StageChanged(stage));
    }

    fn emit(&self, event: NodeEvent) {
        // The consumer may have dropped the stream; that only silences events.
        let _ = self.events.unbounded_send(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_options_are_usable() {
        let options = ConnectOptions::default();
        assert_eq!(options.challenge_policy, ChallengePolicy::Auto);
        assert!(options.max_reconnect_attempts > 0);
        assert!(options.reconnect_base_delay > Duration::ZERO);
        assert!(options.request_timeout > SWEEP_INTERVAL);
    }

    #[test]
    fn stage_names_are_stable() {
        assert_eq!(ConnectionStage::PendingChallengeApproval.to_string(), "pending_challenge_approval");
        assert_eq!(ConnectionStage::Failed.to_string(), "failed");
        assert_ne!(ConnectionStage::AuthFailed, ConnectionStage::Failed);
    }
}
