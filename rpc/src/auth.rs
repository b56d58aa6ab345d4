use libsluice::helpers::{Timestamp, Transcript};
use libsluice::signing::MessageSigner;
use libsluice::types::Address;
use log::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ChallengePolicy;
use crate::envelope::{Envelope, RpcMethod};

/// What the handshake driver wants the connection to do next.
#[derive(Debug)]
pub enum AuthAction {
    /// Send this request and keep waiting.
    Send(RpcMethod, Vec<Value>),
    /// Interactive policy: park in `PendingChallengeApproval` and surface the
    /// challenge to the consumer.
    AwaitApproval(String),
    /// The handshake completed. `jwt` is the node-issued credential, cached for
    /// the next connection.
    Authenticated { jwt: Option<String> },
    /// The cached credential expired; clear it and restart the handshake.
    /// Issued at most once per connection.
    Restart,
    /// The handshake failed terminally.
    Fail(String),
    /// Not a handshake message; ignore.
    Ignore,
}

#[derive(Debug, PartialEq)]
enum AuthState {
    Idle,
    AwaitingChallenge,
    AwaitingApproval { challenge: String },
    AwaitingVerify,
    Done,
}

/// Drives the `auth_request` → `auth_challenge` → `auth_verify` handshake.
///
/// One instance lives for one connection attempt; the only state that survives
/// reconnects is the cached jwt, which the event loop carries between instances.
pub struct AuthHandshake {
    signer: Arc<dyn MessageSigner>,
    scope: String,
    application: Option<Address>,
    expiry: Duration,
    policy: ChallengePolicy,
    jwt: Option<String>,
    expiry_retry_used: bool,
    state: AuthState,
}

impl AuthHandshake {
    pub fn new(
        signer: Arc<dyn MessageSigner>,
        scope: String,
        application: Option<Address>,
        expiry: Duration,
        policy: ChallengePolicy,
        jwt: Option<String>,
    ) -> Self {
        AuthHandshake { signer, scope, application, expiry, policy, jwt, expiry_retry_used: false, state: AuthState::Idle }
    }

    /// The jwt to carry forward to the next connection (updated on success,
    /// cleared on expiry).
    pub fn jwt(&self) -> Option<&str> {
        self.jwt.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Done
    }

    /// The opening `auth_request`, naming the identity and the requested scope.
    /// This message is unsigned: nothing has been challenged yet.
    pub fn initial_request(&mut self) -> (RpcMethod, Vec<Value>) {
        self.state = AuthState::AwaitingChallenge;
        let mut request = json!({
            "address": self.signer.address(),
            "scope": self.scope,
            "expires": Timestamp::from_now(self.expiry).as_millis(),
        });
        if let Some(app) = self.application {
            request["application"] = json!(app);
        }
        if let Some(jwt) = &self.jwt {
            request["jwt"] = json!(jwt);
        }
        (RpcMethod::AuthRequest, vec![request])
    }

    /// Feed one inbound envelope observed while authenticating.
    pub fn on_envelope(&mut self, envelope: &Envelope) -> AuthAction {
        if let Some(message) = envelope.error_message() {
            return self.on_error(&message);
        }
        let payload = match &envelope.res {
            Some(payload) => payload,
            None => return AuthAction::Ignore,
        };
        match payload.rpc_method() {
            RpcMethod::AuthChallenge if self.state == AuthState::AwaitingChallenge => {
                let challenge = payload
                    .params
                    .first()
                    .and_then(|p| p.get("challenge_message"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let challenge = match challenge {
                    Some(c) => c,
                    None => return AuthAction::Fail("auth_challenge carried no challenge message".into()),
                };
                match self.policy {
                    ChallengePolicy::Auto => self.sign_challenge(&challenge),
                    ChallengePolicy::Interactive => {
                        debug!("Auth challenge received, awaiting user approval");
                        self.state = AuthState::AwaitingApproval { challenge: challenge.clone() };
                        AuthAction::AwaitApproval(challenge)
                    }
                }
            }
            RpcMethod::AuthVerify if self.state == AuthState::AwaitingVerify => {
                let jwt = payload
                    .params
                    .first()
                    .and_then(|p| p.get("jwt_token"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(token) = &jwt {
                    trace!("Caching node-issued credential ({} bytes)", token.len());
                    self.jwt = Some(token.clone());
                }
                self.state = AuthState::Done;
                AuthAction::Authenticated { jwt: self.jwt.clone() }
            }
            _ => AuthAction::Ignore,
        }
    }

    /// Approve a pending interactive challenge.
    pub fn approve(&mut self) -> Option<AuthAction> {
        match std::mem::replace(&mut self.state, AuthState::Idle) {
            AuthState::AwaitingApproval { challenge } => Some(self.sign_challenge(&challenge)),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn on_error(&mut self, message: &str) -> AuthAction {
        let expired = message.to_ascii_lowercase().contains("expired");
        if expired && self.jwt.is_some() && !self.expiry_retry_used {
            info!("Cached credential expired; clearing it and restarting the handshake");
            self.expiry_retry_used = true;
            self.jwt = None;
            self.state = AuthState::Idle;
            return AuthAction::Restart;
        }
        AuthAction::Fail(message.to_string())
    }

    fn sign_challenge(&mut self, challenge: &str) -> AuthAction {
        let expires = Timestamp::from_now(self.expiry).as_millis();
        let digest = challenge_digest(challenge, self.signer.address(), &self.scope, self.application, expires);
        let signature = match self.signer.sign(&digest) {
            Ok(sig) => sig,
            Err(e) => return AuthAction::Fail(format!("could not sign auth challenge: {e}")),
        };
        self.state = AuthState::AwaitingVerify;
        let mut verify = json!({
            "challenge": challenge,
            "address": self.signer.address(),
            "scope": self.scope,
            "expires": expires,
            "signature": signature,
        });
        if let Some(app) = self.application {
            verify["application"] = json!(app);
        }
        AuthAction::Send(RpcMethod::AuthVerify, vec![verify])
    }
}

/// The scoped authorization digest signed in `auth_verify`. Binding the scope,
/// identity, application and expiry into the signed message is what stops a
/// node replaying the signature for broader access.
pub fn challenge_digest(
    challenge: &str,
    address: Address,
    scope: &str,
    application: Option<Address>,
    expires_millis: u64,
) -> [u8; 32] {
    let mut t = Transcript::new("Sluice Auth v1");
    t.append("challenge", challenge.as_bytes());
    t.append("address", address.as_bytes());
    t.append("scope", scope.as_bytes());
    if let Some(app) = application {
        t.append("application", app.as_bytes());
    }
    t.append_u64("expires", expires_millis);
    t.finalize()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envelope::Payload;
    use libsluice::signing::stub::StubSigner;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes)
    }

    fn handshake(policy: ChallengePolicy, jwt: Option<String>) -> AuthHandshake {
        AuthHandshake::new(
            Arc::new(StubSigner::new(addr(1))),
            "app.create".into(),
            Some(addr(9)),
            Duration::from_secs(3600),
            policy,
            jwt,
        )
    }

    fn challenge_envelope(id: u64) -> Envelope {
        let payload =
            Payload::new(id, &RpcMethod::AuthChallenge, vec![json!({"challenge_message": "uuid-challenge-1"})]);
        Envelope::response(payload, vec![])
    }

    fn verify_envelope(id: u64, jwt: Option<&str>) -> Envelope {
        let mut body = json!({"success": true});
        if let Some(token) = jwt {
            body["jwt_token"] = json!(token);
        }
        Envelope::response(Payload::new(id, &RpcMethod::AuthVerify, vec![body]), vec![])
    }

    #[test]
    fn auto_policy_signs_the_challenge_immediately() {
        let mut auth = handshake(ChallengePolicy::Auto, None);
        let (method, params) = auth.initial_request();
        assert_eq!(method, RpcMethod::AuthRequest);
        assert_eq!(params[0]["scope"], "app.create");
        assert!(params[0].get("jwt").is_none());

        match auth.on_envelope(&challenge_envelope(1)) {
            AuthAction::Send(RpcMethod::AuthVerify, params) => {
                assert_eq!(params[0]["challenge"], "uuid-challenge-1");
                assert!(params[0]["signature"].is_string());
            }
            other => panic!("expected auth_verify, got {other:?}"),
        }

        match auth.on_envelope(&verify_envelope(2, Some("jwt-abc"))) {
            AuthAction::Authenticated { jwt } => assert_eq!(jwt.as_deref(), Some("jwt-abc")),
            other => panic!("expected authentication, got {other:?}"),
        }
        assert!(auth.is_authenticated());
        assert_eq!(auth.jwt(), Some("jwt-abc"));
    }

    #[test]
    fn interactive_policy_waits_for_approval() {
        let mut auth = handshake(ChallengePolicy::Interactive, None);
        auth.initial_request();
        match auth.on_envelope(&challenge_envelope(1)) {
            AuthAction::AwaitApproval(challenge) => assert_eq!(challenge, "uuid-challenge-1"),
            other => panic!("expected approval wait, got {other:?}"),
        }
        // Approving signs the parked challenge
        match auth.approve() {
            Some(AuthAction::Send(RpcMethod::AuthVerify, _)) => {}
            other => panic!("expected auth_verify after approval, got {other:?}"),
        }
        // A second approve has nothing to do
        assert!(auth.approve().is_none());
    }

    #[test]
    fn handshake_error_is_terminal() {
        let mut auth = handshake(ChallengePolicy::Auto, None);
        auth.initial_request();
        let action = auth.on_envelope(&Envelope::error_response(1, "unknown identity"));
        assert!(matches!(action, AuthAction::Fail(_)));
    }

    #[test]
    fn expired_credential_restarts_exactly_once() {
        let mut auth = handshake(ChallengePolicy::Auto, Some("stale-jwt".into()));
        let (_, params) = auth.initial_request();
        assert_eq!(params[0]["jwt"], "stale-jwt");

        // First expiry: clear and restart
        match auth.on_envelope(&Envelope::error_response(1, "session token expired")) {
            AuthAction::Restart => {}
            other => panic!("expected restart, got {other:?}"),
        }
        let (_, params) = auth.initial_request();
        assert!(params[0].get("jwt").is_none());

        // Second expiry error in the same connection: terminal
        let action = auth.on_envelope(&Envelope::error_response(2, "session token expired"));
        assert!(matches!(action, AuthAction::Fail(_)));
    }

    #[test]
    fn digest_binds_scope_and_expiry() {
        let base = challenge_digest("c", addr(1), "app.create", None, 1000);
        assert_eq!(base, challenge_digest("c", addr(1), "app.create", None, 1000));
        assert_ne!(base, challenge_digest("c", addr(1), "app.create", None, 2000));
        assert_ne!(base, challenge_digest("c", addr(1), "ledger.readonly", None, 1000));
        assert_ne!(base, challenge_digest("c", addr(2), "app.create", None, 1000));
        assert_ne!(base, challenge_digest("c", addr(1), "app.create", Some(addr(9)), 1000));
    }
}
