use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

use crate::amount::TokenAmount;
use crate::helpers::Transcript;
use crate::types::Address;

#[derive(Clone, Debug, Error)]
pub enum AppSessionError {
    #[error("invalid app definition: {0}")]
    InvalidDefinition(String),
    #[error("address {0} is not a participant of this session")]
    UnknownParticipant(Address),
}

/// Identifier of an application session, allocated by the coordinator.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppSessionId(String);

impl AppSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        AppSessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AppSessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a versioned session update intends to do with the allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Operate,
    Deposit,
    Withdraw,
    Close,
}

impl Display for Intent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Operate => write!(f, "operate"),
            Intent::Deposit => write!(f, "deposit"),
            Intent::Withdraw => write!(f, "withdraw"),
            Intent::Close => write!(f, "close"),
        }
    }
}

/// The immutable definition of a multi-party application session.
///
/// `weights[i]` is participant i's signing weight; an update is authorized when
/// the summed weight of its signers reaches `quorum`. The two-party "exclusive"
/// degenerate case is `weights = [0, 0, 100], quorum = 100`: only the third
/// (coordinating) participant's signature carries weight, which lets a server
/// co-sign on behalf of passive participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub protocol: String,
    pub participants: Vec<Address>,
    pub weights: Vec<u16>,
    pub quorum: u16,
    /// Challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
}

impl AppDefinition {
    pub fn validate(&self) -> Result<(), AppSessionError> {
        if self.participants.len() < 2 {
            return Err(AppSessionError::InvalidDefinition("at least two participants are required".into()));
        }
        if self.participants.len() != self.weights.len() {
            return Err(AppSessionError::InvalidDefinition(format!(
                "{} participants but {} weights",
                self.participants.len(),
                self.weights.len()
            )));
        }
        let total: u32 = self.weights.iter().map(|w| *w as u32).sum();
        if total < self.quorum as u32 {
            return Err(AppSessionError::InvalidDefinition(format!(
                "total weight {total} can never reach quorum {}",
                self.quorum
            )));
        }
        Ok(())
    }

    pub fn participant_index(&self, address: Address) -> Option<usize> {
        self.participants.iter().position(|p| *p == address)
    }

    pub fn weight_of(&self, address: Address) -> Option<u16> {
        self.participant_index(address).map(|i| self.weights[i])
    }

    /// True when the summed weight of the (deduplicated) signer set meets the quorum.
    pub fn quorum_met(&self, signers: &[Address]) -> bool {
        let mut seen: Vec<Address> = Vec::with_capacity(signers.len());
        let mut total: u32 = 0;
        for signer in signers {
            if seen.contains(signer) {
                continue;
            }
            seen.push(*signer);
            if let Some(weight) = self.weight_of(*signer) {
                total += weight as u32;
            }
        }
        total >= self.quorum as u32
    }

    /// Weight actually collected from the given signer set (unknown signers count zero).
    pub fn collected_weight(&self, signers: &[Address]) -> u32 {
        let mut seen: Vec<Address> = Vec::with_capacity(signers.len());
        let mut total: u32 = 0;
        for signer in signers {
            if seen.contains(signer) {
                continue;
            }
            seen.push(*signer);
            total += self.weight_of(*signer).unwrap_or(0) as u32;
        }
        total
    }
}

/// One participant's asset balance within a session ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSessionAllocation {
    pub participant: Address,
    pub asset: String,
    pub amount: TokenAmount,
}

impl AppSessionAllocation {
    pub fn new(participant: Address, asset: impl Into<String>, amount: TokenAmount) -> Self {
        Self { participant, asset: asset.into(), amount }
    }
}

/// A versioned session snapshot. Versions start at 1 on creation and each
/// accepted update increments the version by exactly one. `Close` is terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSessionState {
    pub app_session_id: AppSessionId,
    pub intent: Intent,
    pub version: u64,
    pub allocations: Vec<AppSessionAllocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_data: Option<String>,
}

fn append_allocations(t: &mut Transcript, allocations: &[AppSessionAllocation]) {
    t.append_u64("allocation_count", allocations.len() as u64);
    for a in allocations {
        t.append("participant", a.participant.as_bytes());
        t.append("asset", a.asset.as_bytes());
        t.append("amount", &a.amount.to_big_endian());
    }
}

/// Canonical digest every required participant signs to authorize session creation.
pub fn create_digest(
    definition: &AppDefinition,
    allocations: &[AppSessionAllocation],
    session_data: Option<&str>,
) -> [u8; 32] {
    let mut t = Transcript::new("Sluice AppSession Create v1");
    t.append("protocol", definition.protocol.as_bytes());
    t.append_u64("participant_count", definition.participants.len() as u64);
    for (participant, weight) in definition.participants.iter().zip(&definition.weights) {
        t.append("participant", participant.as_bytes());
        t.append_u64("weight", *weight as u64);
    }
    t.append_u64("quorum", definition.quorum as u64);
    t.append_u64("challenge", definition.challenge);
    t.append_u64("nonce", definition.nonce);
    append_allocations(&mut t, allocations);
    t.append("session_data", session_data.unwrap_or("").as_bytes());
    t.finalize()
}

/// Canonical digest every required participant signs to authorize one update.
pub fn update_digest(state: &AppSessionState) -> [u8; 32] {
    let mut t = Transcript::new("Sluice AppSession Update v1");
    t.append("app_session_id", state.app_session_id.as_str().as_bytes());
    t.append("intent", state.intent.to_string().as_bytes());
    t.append_u64("version", state.version);
    append_allocations(&mut t, &state.allocations);
    t.append("session_data", state.session_data.as_deref().unwrap_or("").as_bytes());
    t.finalize()
}
