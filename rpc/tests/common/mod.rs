#![allow(dead_code)]

use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use libsluice::types::Address;
use serde_json::{json, Value};
use sluice_rpc::transport::memory::MemoryPeer;
use sluice_rpc::{ConnectOptions, ConnectionStage, Envelope, NodeEvent, Payload, RpcMethod};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn addr(n: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = n;
    Address::new(bytes)
}

/// Options tuned for tests: short timeouts, quick reconnects.
pub fn test_options() -> ConnectOptions {
    ConnectOptions {
        request_timeout: Duration::from_millis(500),
        max_reconnect_attempts: 2,
        reconnect_base_delay: Duration::from_millis(10),
        keepalive_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

/// The next envelope the client put on the wire.
pub async fn next_envelope(peer: &mut MemoryPeer) -> Envelope {
    let text = tokio::time::timeout(Duration::from_secs(5), peer.from_client.recv())
        .await
        .expect("timed out waiting for a client message")
        .expect("the client hung up");
    Envelope::from_json(&text).expect("client sent a malformed envelope")
}

/// The next request payload the client put on the wire.
pub async fn next_request(peer: &mut MemoryPeer) -> Payload {
    next_envelope(peer).await.req.expect("expected a request envelope")
}

pub fn reply(peer: &MemoryPeer, id: u64, method: &RpcMethod, params: Vec<Value>) {
    let envelope = Envelope::response(Payload::new(id, method, params), vec![]);
    peer.to_client.send(envelope.to_json().unwrap()).expect("the client hung up");
}

pub fn reply_error(peer: &MemoryPeer, id: u64, message: &str) {
    let envelope = Envelope::error_response(id, message);
    peer.to_client.send(envelope.to_json().unwrap()).expect("the client hung up");
}

/// Play the node's side of a successful auth handshake, issuing `jwt`.
pub async fn serve_auth(peer: &mut MemoryPeer, jwt: &str) {
    let request = next_request(peer).await;
    assert_eq!(request.rpc_method(), RpcMethod::AuthRequest);
    reply(peer, request.id, &RpcMethod::AuthChallenge, vec![json!({"challenge_message": "challenge-1"})]);
    let verify = next_request(peer).await;
    assert_eq!(verify.rpc_method(), RpcMethod::AuthVerify);
    assert!(verify.params[0]["signature"].is_string(), "auth_verify must carry a signature");
    reply(peer, verify.id, &RpcMethod::AuthVerify, vec![json!({"jwt_token": jwt})]);
}

/// Block until the connection reports `target`, consuming events on the way.
pub async fn wait_for_stage(events: &mut UnboundedReceiver<NodeEvent>, target: ConnectionStage) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            if let NodeEvent::StageChanged(stage) = event {
                if stage == target {
                    return;
                }
            }
        }
        panic!("the event stream ended before reaching {target}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for stage {target}"));
}
