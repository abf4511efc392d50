//! Peer identities: ed25519 keypairs and the [`PeerId`] derived from them.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// An ed25519 identity keypair.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
}

impl Keypair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self::from_secret_bytes(bytes)
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Keypair {
            secret: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.secret.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.secret.sign(msg).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// An ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodingError> {
        let bytes: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodingError::InvalidLength(bytes.len()))?;
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| DecodingError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Verifies an ed25519 signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.0.verify(msg, &signature).is_ok()
    }

    pub fn to_peer_id(&self) -> PeerId {
        PeerId(self.0.to_bytes())
    }
}

/// Identifies a peer. It is the peer's ed25519 public key, shown in base58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        key.to_peer_id()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Recovers the public key this id was derived from.
    pub fn public_key(&self) -> Result<PublicKey, DecodingError> {
        PublicKey::from_bytes(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

impl FromStr for PeerId {
    type Err = DecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DecodingError::InvalidLength(bytes.len()))?;
        Ok(PeerId(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("invalid key length: {0}")]
    InvalidLength(usize),

    #[error("bytes are not a valid ed25519 public key")]
    InvalidPublicKey,

    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
}
