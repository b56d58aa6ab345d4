use libsluice::app_session::{
    create_digest, update_digest, AppDefinition, AppSessionAllocation, AppSessionId, AppSessionState, Intent,
};
use libsluice::signing::{MessageSigner, Signature};
use libsluice::types::Address;
use log::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::NodeClient;
use crate::envelope::RpcMethod;
use crate::errors::ClientError;

/// A session proposal waiting for enough signatures to be submitted.
///
/// Everything the creation digest covers is frozen here when the proposal is
/// made; the digest is computed once and signatures always refer to that
/// snapshot, never to a re-serialization.
struct PendingCreate {
    definition: AppDefinition,
    allocations: Vec<AppSessionAllocation>,
    session_data: Option<String>,
    digest: [u8; 32],
    signatures: Vec<(Address, Signature)>,
}

struct TrackedSession {
    definition: AppDefinition,
    version: u64,
    closed: bool,
}

/// Drives the application-session protocol over a [`NodeClient`].
///
/// Creation is a two-phase flow: `propose_session` freezes the definition and
/// signs it locally, `add_signature` collects counterparty signatures over the
/// same digest, and `create_session` submits once the collected signing weight
/// meets the definition's quorum. After creation every state change is a
/// versioned update; versions advance by exactly one and `Close` is terminal.
pub struct AppSessionClient {
    node: NodeClient,
    signer: Arc<dyn MessageSigner>,
    pending: Mutex<HashMap<String, PendingCreate>>,
    sessions: Mutex<HashMap<AppSessionId, TrackedSession>>,
}

impl AppSessionClient {
    pub fn new(node: NodeClient, signer: Arc<dyn MessageSigner>) -> Self {
        AppSessionClient { node, signer, pending: Mutex::new(HashMap::new()), sessions: Mutex::new(HashMap::new()) }
    }

    /// Freeze a session proposal under `key` and sign it. The returned
    /// signature is ours; ship the same inputs to the counterparties and
    /// collect theirs with [`add_signature`](AppSessionClient::add_signature).
    pub fn propose_session(
        &self,
        key: &str,
        definition: AppDefinition,
        allocations: Vec<AppSessionAllocation>,
        session_data: Option<String>,
    ) -> Result<Signature, ClientError> {
        definition.validate()?;
        let me = self.signer.address();
        if definition.participant_index(me).is_none() {
            return Err(ClientError::UnknownParticipant(me));
        }
        let digest = create_digest(&definition, &allocations, session_data.as_deref());
        let signature = self.signer.sign(&digest)?;
        debug!("Proposed app session {key} ({} participants)", definition.participants.len());
        self.pending.lock().unwrap().insert(
            key.to_string(),
            PendingCreate { definition, allocations, session_data, digest, signatures: vec![(me, signature)] },
        );
        Ok(signature)
    }

    /// The digest counterparties must sign to endorse the proposal under `key`.
    pub fn pending_digest(&self, key: &str) -> Result<[u8; 32], ClientError> {
        let pending = self.pending.lock().unwrap();
        let entry = pending.get(key).ok_or_else(|| ClientError::UnknownPendingSession(key.to_string()))?;
        Ok(entry.digest)
    }

    /// Record a counterparty's signature over the frozen proposal. A repeat
    /// signature from the same participant replaces the previous one.
    pub fn add_signature(&self, key: &str, signer: Address, signature: Signature) -> Result<(), ClientError> {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending.get_mut(key).ok_or_else(|| ClientError::UnknownPendingSession(key.to_string()))?;
        if entry.definition.participant_index(signer).is_none() {
            return Err(ClientError::UnknownParticipant(signer));
        }
        entry.signatures.retain(|(address, _)| *address != signer);
        entry.signatures.push((signer, signature));
        Ok(())
    }

    /// Submit the proposal under `key` once its collected signing weight meets
    /// the quorum. Signatures travel in participant order. On acceptance the
    /// session starts tracking at version 1 and the pending entry is consumed.
    pub async fn create_session(&self, key: &str) -> Result<AppSessionId, ClientError> {
        let (params, definition) = {
            let pending = self.pending.lock().unwrap();
            let entry = pending.get(key).ok_or_else(|| ClientError::UnknownPendingSession(key.to_string()))?;
            let signers: Vec<Address> = entry.signatures.iter().map(|(address, _)| *address).collect();
            if !entry.definition.quorum_met(&signers) {
                return Err(ClientError::QuorumNotMet {
                    required: entry.definition.quorum,
                    collected: entry.definition.collected_weight(&signers),
                });
            }
            let ordered = ordered_signatures(&entry.definition, &entry.signatures);
            let mut params = json!({
                "definition": entry.definition,
                "allocations": entry.allocations,
                "signatures": ordered,
            });
            if let Some(data) = &entry.session_data {
                params["session_data"] = json!(data);
            }
            (params, entry.definition.clone())
        };
        let response = self.node.request(RpcMethod::CreateAppSession, vec![params]).await?;
        let id = response
            .first()
            .and_then(|body| body.get("app_session_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::rpc("create_app_session response carried no session id"))?;
        let id = AppSessionId::new(id);
        info!("App session {id} created");
        self.pending.lock().unwrap().remove(key);
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), TrackedSession { definition, version: 1, closed: false });
        Ok(id)
    }

    /// Start tracking a session created by someone else (or recovered from
    /// `get_app_definition`) at its current version.
    pub fn adopt_session(
        &self,
        id: AppSessionId,
        definition: AppDefinition,
        version: u64,
    ) -> Result<(), ClientError> {
        definition.validate()?;
        self.sessions.lock().unwrap().insert(id, TrackedSession { definition, version, closed: false });
        Ok(())
    }

    pub fn session_version(&self, id: &AppSessionId) -> Option<u64> {
        self.sessions.lock().unwrap().get(id).map(|tracked| tracked.version)
    }

    pub fn is_closed(&self, id: &AppSessionId) -> Option<bool> {
        self.sessions.lock().unwrap().get(id).map(|tracked| tracked.closed)
    }

    /// Submit the next update, at the version following the last accepted one.
    /// Returns the accepted version.
    pub async fn submit_update(
        &self,
        id: &AppSessionId,
        intent: Intent,
        allocations: Vec<AppSessionAllocation>,
        session_data: Option<String>,
        co_signatures: &[(Address, Signature)],
    ) -> Result<u64, ClientError> {
        let next = self.next_version(id)?;
        self.submit_versioned_update(id, next, intent, allocations, session_data, co_signatures).await
    }

    /// Close the session with its final allocations. Accepted closes are
    /// terminal; any later update fails with
    /// [`SessionClosed`](ClientError::SessionClosed).
    pub async fn close_session(
        &self,
        id: &AppSessionId,
        allocations: Vec<AppSessionAllocation>,
        session_data: Option<String>,
        co_signatures: &[(Address, Signature)],
    ) -> Result<u64, ClientError> {
        let next = self.next_version(id)?;
        self.submit_versioned_update(id, next, Intent::Close, allocations, session_data, co_signatures).await
    }

    /// Submit an update at an explicit version. The version must be exactly one
    /// past the last accepted version; anything else is a
    /// [`VersionGap`](ClientError::VersionGap).
    pub async fn submit_versioned_update(
        &self,
        id: &AppSessionId,
        version: u64,
        intent: Intent,
        allocations: Vec<AppSessionAllocation>,
        session_data: Option<String>,
        co_signatures: &[(Address, Signature)],
    ) -> Result<u64, ClientError> {
        let params = {
            let sessions = self.sessions.lock().unwrap();
            let tracked = sessions.get(id).ok_or_else(|| ClientError::UnknownSession(id.clone()))?;
            if tracked.closed {
                return Err(ClientError::SessionClosed(id.clone()));
            }
            if version != tracked.version + 1 {
                return Err(ClientError::VersionGap { last: tracked.version, submitted: version });
            }
            let state = AppSessionState { app_session_id: id.clone(), intent, version, allocations, session_data };
            let digest = update_digest(&state);
            let me = self.signer.address();
            if tracked.definition.participant_index(me).is_none() {
                return Err(ClientError::UnknownParticipant(me));
            }
            let mut signatures: Vec<(Address, Signature)> = vec![(me, self.signer.sign(&digest)?)];
            for (address, signature) in co_signatures {
                if tracked.definition.participant_index(*address).is_none() {
                    return Err(ClientError::UnknownParticipant(*address));
                }
                signatures.retain(|(existing, _)| existing != address);
                signatures.push((*address, *signature));
            }
            let signers: Vec<Address> = signatures.iter().map(|(address, _)| *address).collect();
            if !tracked.definition.quorum_met(&signers) {
                return Err(ClientError::QuorumNotMet {
                    required: tracked.definition.quorum,
                    collected: tracked.definition.collected_weight(&signers),
                });
            }
            let ordered = ordered_signatures(&tracked.definition, &signatures);
            let mut params = json!({
                "app_session_id": state.app_session_id,
                "intent": state.intent,
                "version": state.version,
                "allocations": state.allocations,
                "signatures": ordered,
            });
            if let Some(data) = &state.session_data {
                params["session_data"] = json!(data);
            }
            params
        };
        let method = if intent == Intent::Close { RpcMethod::CloseAppSession } else { RpcMethod::SubmitAppState };
        self.node.request(method, vec![params]).await?;
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(tracked) = sessions.get_mut(id) {
            tracked.version = version;
            if intent == Intent::Close {
                info!("App session {id} closed at version {version}");
                tracked.closed = true;
            }
        }
        Ok(version)
    }

    fn next_version(&self, id: &AppSessionId) -> Result<u64, ClientError> {
        let sessions = self.sessions.lock().unwrap();
        let tracked = sessions.get(id).ok_or_else(|| ClientError::UnknownSession(id.clone()))?;
        Ok(tracked.version + 1)
    }
}

/// Signatures in participant order, skipping participants that have not signed.
fn ordered_signatures(definition: &AppDefinition, signatures: &[(Address, Signature)]) -> Vec<Signature> {
    definition
        .participants
        .iter()
        .filter_map(|participant| {
            signatures.iter().find(|(address, _)| address == participant).map(|(_, signature)| *signature)
        })
        .collect()
}
