use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use crate::amount::TokenAmount;
use crate::helpers::Transcript;
use crate::signing::{Signature, SignatureVerifier};
use crate::types::Address;

/// The immutable parameters of a two-party channel.
///
/// The channel ID is derived from a transcript hash (domain separator:
/// `"Sluice ChannelId v1"`) over the following fields, in order:
/// - `host`: participant 0's address (20 bytes)
/// - `guest`: participant 1's address (20 bytes)
/// - `adjudicator`: the adjudicator contract address (20 bytes)
/// - `challenge`: the challenge period in seconds (u64, little-endian)
/// - `nonce`: the channel nonce (u64, little-endian)
///
/// The same inputs always yield the same id; changing any field (in particular
/// the nonce) yields a different id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    participants: [Address; 2],
    adjudicator: Address,
    challenge: Duration,
    nonce: u64,
}

impl ChannelConfig {
    pub fn new(participants: [Address; 2], adjudicator: Address, challenge: Duration, nonce: u64) -> Self {
        ChannelConfig { participants, adjudicator, challenge, nonce }
    }

    /// A config with a freshly drawn nonce, for opening a new channel between
    /// parties that may have channeled before.
    pub fn with_fresh_nonce(participants: [Address; 2], adjudicator: Address, challenge: Duration) -> Self {
        ChannelConfig::new(participants, adjudicator, challenge, rand::random())
    }

    pub fn participants(&self) -> &[Address; 2] {
        &self.participants
    }

    pub fn adjudicator(&self) -> Address {
        self.adjudicator
    }

    pub fn challenge(&self) -> Duration {
        self.challenge
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn channel_id(&self) -> ChannelId {
        let mut t = Transcript::new("Sluice ChannelId v1");
        t.append("host", self.participants[0].as_bytes());
        t.append("guest", self.participants[1].as_bytes());
        t.append("adjudicator", self.adjudicator.as_bytes());
        t.append_u64("challenge", self.challenge.as_secs());
        t.append_u64("nonce", self.nonce);
        ChannelId(t.finalize())
    }
}

/// The unique identifier of a channel. See [`ChannelConfig::channel_id`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(#[serde(serialize_with = "ser_id", deserialize_with = "de_id")] [u8; 32]);

fn ser_id<S: serde::Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    crate::helpers::to_hex(bytes, s)
}

fn de_id<'de, D: serde::Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
    let bytes = crate::helpers::from_hex(de)?;
    bytes.try_into().map_err(|_| serde::de::Error::custom("channel id must be 32 bytes"))
}

impl ChannelId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

/// Which participant the local actor is. Host is index 0, guest is index 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn index(&self) -> usize {
        match self {
            Role::Host => 0,
            Role::Guest => 1,
        }
    }

    /// Derive the local role by matching an address against the channel's participants.
    pub fn from_address(config: &ChannelConfig, address: Address) -> Option<Role> {
        if config.participants[0] == address {
            Some(Role::Host)
        } else if config.participants[1] == address {
            Some(Role::Guest)
        } else {
            None
        }
    }

    pub fn counterparty(&self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "Host"),
            Role::Guest => write!(f, "Guest"),
        }
    }
}

/// One participant's share of the funds locked at a given state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Address,
    pub token: Address,
    pub amount: TokenAmount,
}

impl Allocation {
    pub fn new(destination: Address, token: Address, amount: TokenAmount) -> Self {
        Allocation { destination, token, amount }
    }
}

/// One snapshot of a channel: opaque application data plus one allocation per
/// participant, in participant order, and any signatures collected so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub data: Vec<u8>,
    pub allocations: Vec<Allocation>,
    pub sigs: Vec<Signature>,
}

impl State {
    pub fn new(data: Vec<u8>, allocations: Vec<Allocation>) -> Self {
        State { data, allocations, sigs: Vec::new() }
    }

    /// The canonical hash of this state, bound to its owning channel.
    ///
    /// Signatures are *not* part of the hash: signing and hashing would
    /// otherwise be circular.
    pub fn hash(&self, channel_id: &ChannelId) -> [u8; 32] {
        let mut t = Transcript::new("Sluice StateHash v1");
        t.append("channel_id", channel_id.as_bytes());
        t.append("data", &self.data);
        t.append_u64("allocation_count", self.allocations.len() as u64);
        for allocation in &self.allocations {
            t.append("destination", allocation.destination.as_bytes());
            t.append("token", allocation.token.as_bytes());
            t.append("amount", &allocation.amount.to_big_endian());
        }
        t.finalize()
    }

    /// Sum of allocated amounts for one token across all participants.
    /// `None` when the sum overflows 256 bits.
    pub fn total_for(&self, token: Address) -> Option<TokenAmount> {
        self.allocations
            .iter()
            .filter(|a| a.token == token)
            .try_fold(TokenAmount::zero(), |acc, a| acc.checked_add(a.amount))
    }

    /// Per-token totals across all allocations. `None` when any per-token sum
    /// overflows 256 bits; such a state can never balance against locked funds.
    pub fn token_totals(&self) -> Option<HashMap<Address, TokenAmount>> {
        let mut totals = HashMap::new();
        for a in &self.allocations {
            let entry = totals.entry(a.token).or_insert_with(TokenAmount::zero);
            *entry = entry.checked_add(a.amount)?;
        }
        Some(totals)
    }

    /// True when every address in `required` has a valid signature over this
    /// state's hash among `sigs`.
    pub fn is_signed_by_all(
        &self,
        channel_id: &ChannelId,
        verifier: &dyn SignatureVerifier,
        required: &[Address],
    ) -> bool {
        let digest = self.hash(channel_id);
        required.iter().all(|addr| self.sigs.iter().any(|sig| verifier.verify(&digest, sig, *addr)))
    }

    /// True when `participant` has a valid signature over this state's hash.
    pub fn is_signed_by(&self, channel_id: &ChannelId, verifier: &dyn SignatureVerifier, participant: Address) -> bool {
        self.is_signed_by_all(channel_id, verifier, &[participant])
    }
}
