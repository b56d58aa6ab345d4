use blake2::Blake2b512;
use digest::Digest;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

pub fn to_hex<S>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    hex::encode(bytes).serialize(s)
}

pub fn from_hex<'de, D>(de: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str = String::deserialize(de)?;
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(&hex_str);
    hex::decode(hex_str).map_err(|e| serde::de::Error::custom(format!("Invalid hex string: {e}")))
}

/// A domain-separated hash transcript over labeled, length-framed fields.
///
/// Every canonical digest in the protocol (channel ids, state hashes, RPC payload
/// digests, app-session digests) is computed through a transcript so that two
/// different field sequences can never collide by concatenation.
pub struct Transcript {
    hasher: Blake2b512,
}

impl Transcript {
    /// Start a new transcript under the given domain separator.
    pub fn new(domain: &str) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update((domain.len() as u64).to_le_bytes());
        hasher.update(domain.as_bytes());
        Transcript { hasher }
    }

    /// Append a labeled field. Both the label and the value are length-prefixed.
    pub fn append(&mut self, label: &str, value: &[u8]) -> &mut Self {
        self.hasher.update((label.len() as u64).to_le_bytes());
        self.hasher.update(label.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    /// Append a labeled u64 field, little-endian.
    pub fn append_u64(&mut self, label: &str, value: u64) -> &mut Self {
        self.append(label, &value.to_le_bytes())
    }

    /// Finish the transcript and return the first 32 bytes of the digest.
    pub fn finalize(self) -> [u8; 32] {
        let output = self.hasher.finalize();
        let mut result = [0u8; 32];
        result.copy_from_slice(&output[..32]);
        result
    }
}

/// A UTC Unix timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a new Timestamp from milliseconds since Unix epoch.
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the current UTC time as a Timestamp.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis() as u64)
    }

    /// Creates a Timestamp that is `duration` time from now.
    pub fn from_now(duration: Duration) -> Self {
        Self(Utc::now().timestamp_millis() as u64 + duration.as_millis() as u64)
    }

    /// Returns the underlying milliseconds value.
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}
