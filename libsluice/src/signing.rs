use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;

use crate::types::Address;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing failed: {0}")]
    SigningFailed(String),
    #[error("signature recovery failed: {0}")]
    RecoveryFailed(String),
    #[error("no signing identity is configured")]
    MissingIdentity,
}

/// A 65-byte `r ‖ s ‖ v` signature blob.
///
/// The encoding is opaque to this crate; producing and checking signatures is the
/// job of the [`MessageSigner`] and [`SignatureVerifier`] implementations supplied
/// by the embedding application.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 65]);

impl Signature {
    pub fn new(bytes: [u8; 65]) -> Self {
        Signature(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 65] = bytes.try_into().ok()?;
        Some(Signature(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).ok()?;
        Signature::from_slice(&bytes)
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Truncated; full signatures are noise in logs.
        write!(f, "Signature(0x{}…)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        Signature::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 65 hex-encoded signature bytes"))
    }
}

/// Produces signatures over 32-byte canonical digests.
///
/// Implementations wrap the actual cryptography (ECDSA, EIP-712 wrapping, remote
/// signers); this crate only ever hands them a digest it computed via
/// [`crate::helpers::Transcript`].
pub trait MessageSigner: Send + Sync {
    /// The address this signer's signatures recover to.
    fn address(&self) -> Address;

    fn sign(&self, digest: &[u8; 32]) -> Result<Signature, SignerError>;
}

/// Recovers the signing address from a digest and signature.
pub trait SignatureVerifier: Send + Sync {
    fn recover(&self, digest: &[u8; 32], signature: &Signature) -> Result<Address, SignerError>;

    /// True when `signature` over `digest` recovers to `expected`.
    fn verify(&self, digest: &[u8; 32], signature: &Signature, expected: Address) -> bool {
        self.recover(digest, signature).map(|addr| addr == expected).unwrap_or(false)
    }
}

#[cfg(any(test, feature = "stub_crypto"))]
pub mod stub {
    //! A deterministic, non-cryptographic signer pair for tests.
    //!
    //! The "signature" is a transcript hash of the digest and the signer address,
    //! repeated to fill 65 bytes, so recovery is a lookup over known signers.

    use super::*;
    use crate::helpers::Transcript;

    pub struct StubSigner {
        address: Address,
    }

    impl StubSigner {
        pub fn new(address: Address) -> Self {
            Self { address }
        }

        fn tag(address: Address, digest: &[u8; 32]) -> [u8; 65] {
            let mut t = Transcript::new("Sluice StubSig v1");
            t.append("address", address.as_bytes());
            t.append("digest", digest);
            let hash = t.finalize();
            let mut out = [0u8; 65];
            out[..32].copy_from_slice(&hash);
            out[32..64].copy_from_slice(&hash);
            out[64] = 27;
            out
        }
    }

    impl MessageSigner for StubSigner {
        fn address(&self) -> Address {
            self.address
        }

        fn sign(&self, digest: &[u8; 32]) -> Result<Signature, SignerError> {
            Ok(Signature::new(Self::tag(self.address, digest)))
        }
    }

    /// Recovers by trying each known address against the stub tag.
    pub struct StubVerifier {
        pub known: Vec<Address>,
    }

    impl SignatureVerifier for StubVerifier {
        fn recover(&self, digest: &[u8; 32], signature: &Signature) -> Result<Address, SignerError> {
            self.known
                .iter()
                .copied()
                .find(|addr| Signature::new(StubSigner::tag(*addr, digest)) == *signature)
                .ok_or_else(|| SignerError::RecoveryFailed("unknown stub signature".into()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::stub::{StubSigner, StubVerifier};
    use super::*;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::new(bytes)
    }

    #[test]
    fn signature_hex_roundtrip() {
        let sig = Signature::new([0xabu8; 65]);
        let hex_str = sig.to_hex();
        assert_eq!(hex_str.len(), 2 + 130);
        assert_eq!(Signature::from_hex(&hex_str).unwrap(), sig);
        assert!(Signature::from_hex("0xdead").is_none());
    }

    #[test]
    fn signature_serde_roundtrip() {
        let sig = Signature::new([3u8; 65]);
        let json = serde_json::to_string(&sig).unwrap();
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn stub_signer_recovers() {
        let signer = StubSigner::new(addr(1));
        let verifier = StubVerifier { known: vec![addr(1), addr(2)] };
        let digest = [9u8; 32];
        let sig = signer.sign(&digest).unwrap();
        assert_eq!(verifier.recover(&digest, &sig).unwrap(), addr(1));
        assert!(verifier.verify(&digest, &sig, addr(1)));
        assert!(!verifier.verify(&digest, &sig, addr(2)));
        // Signature over a different digest does not verify
        let other = signer.sign(&[8u8; 32]).unwrap();
        assert!(!verifier.verify(&digest, &other, addr(1)));
    }
}
