//! Node identity: deterministic Ed25519 keypair and base-58 peer ID.

use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Peer ID: deterministic hash of the public key. Used as the node's
/// network-wide name; printable as base-58.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive a peer ID from a verifying key (same as Keypair does).
    pub fn from_public_key(public: &VerifyingKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        PeerId(id)
    }

    /// Derive a peer ID from raw public key bytes, validating that they
    /// encode a real Ed25519 point.
    pub fn from_public_key_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self::from_public_key(&key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| IdentityError::InvalidPeerId(s.to_string()))?;
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPeerId(s.to_string()))?;
        Ok(PeerId(id))
    }
}

/// Ed25519 keypair derived from a stable external identifier. Keep the
/// signing key private; expose only public material and the peer ID.
pub struct Keypair {
    signing: SigningKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Derive a keypair from a stable external identifier (e.g. a phone
    /// number). Deterministic: the same identifier always yields the same
    /// key material and the same peer ID.
    pub fn from_external_id(external_id: &str) -> Result<Self, IdentityError> {
        let mut hasher = Sha256::new();
        hasher.update(external_id.as_bytes());
        let digest = hasher.finalize();
        let seed: [u8; 32] = digest
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Seed)?;
        let signing = SigningKey::from_bytes(&seed);
        let peer_id = PeerId::from_public_key(&signing.verifying_key());
        Ok(Self { signing, peer_id })
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("key seed derivation failed")]
    Seed,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}
