//! Private networks: a connection protector that only lets peers holding the
//! same 32-byte pre-shared key talk to each other.
//!
//! Each side sends a random 24-byte nonce, then everything after it is
//! XOR-ed with an XChaCha20 keystream derived from the key and the sender's
//! nonce. With a different key the remote sees garbage and the next
//! negotiation step fails.

mod crypt;

use std::{fmt, io, str::FromStr};

use futures::{AsyncReadExt, AsyncWriteExt, FutureExt, future::BoxFuture};
use meshwire_core::{BoxedStream, ConnectionProtector};

pub use crypt::PnetOutput;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;

const KEY_CODEC: &str = "/key/swarm/psk/1.0.0/";
const KEY_ENCODING_BASE16: &str = "/base16/";

/// A 32-byte pre-shared key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PreSharedKey([u8; KEY_SIZE]);

impl PreSharedKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        PreSharedKey(bytes)
    }

    pub fn generate() -> Self {
        PreSharedKey(rand::random())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Parses the swarm key file format:
///
/// ```text
/// /key/swarm/psk/1.0.0/
/// /base16/
/// <64 hex digits>
/// ```
impl FromStr for PreSharedKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = s.lines().map(str::trim);
        if lines.next() != Some(KEY_CODEC) {
            return Err(KeyParseError::InvalidKeyFile);
        }
        match lines.next() {
            Some(KEY_ENCODING_BASE16) => {}
            Some(other) => return Err(KeyParseError::UnsupportedEncoding(other.to_owned())),
            None => return Err(KeyParseError::InvalidKeyFile),
        }
        let encoded = lines.next().ok_or(KeyParseError::InvalidKeyFile)?;
        let bytes = hex::decode(encoded)?;
        let key: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyParseError::InvalidKeyLength(bytes.len()))?;
        Ok(PreSharedKey(key))
    }
}

impl fmt::Display for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{KEY_CODEC}")?;
        writeln!(f, "{KEY_ENCODING_BASE16}")?;
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreSharedKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("not a swarm key file")]
    InvalidKeyFile,
    #[error("unsupported key encoding {0}")]
    UnsupportedEncoding(String),
    #[error("invalid hex in key: {0}")]
    InvalidKeyEncoding(#[from] hex::FromHexError),
    #[error("key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Protects connections with a [`PreSharedKey`].
#[derive(Debug, Clone, Copy)]
pub struct PnetConfig {
    key: PreSharedKey,
}

impl PnetConfig {
    pub fn new(key: PreSharedKey) -> Self {
        PnetConfig { key }
    }

    /// Exchanges nonces and wraps `io` in the keyed cipher.
    pub async fn handshake<S>(self, mut io: S) -> io::Result<PnetOutput<S>>
    where
        S: futures::AsyncRead + futures::AsyncWrite + Unpin,
    {
        let local_nonce: [u8; NONCE_SIZE] = rand::random();
        io.write_all(&local_nonce).await?;
        io.flush().await?;

        let mut remote_nonce = [0u8; NONCE_SIZE];
        io.read_exact(&mut remote_nonce).await?;
        tracing::trace!("Exchanged pnet nonces");

        Ok(PnetOutput::new(io, &self.key, &local_nonce, &remote_nonce))
    }
}

impl ConnectionProtector for PnetConfig {
    fn protect(&self, io: BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let config = *self;
        async move {
            let output = config.handshake(io).await?;
            Ok(Box::new(output) as BoxedStream)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::future;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    const KEY_FILE: &str = "/key/swarm/psk/1.0.0/\n/base16/\n\
        6189c5cf0b87fb800c1a9feeda73c6ab5e998db48fb9e6a978575c770ceef683";

    #[test]
    fn parses_swarm_key_files() {
        let key: PreSharedKey = KEY_FILE.parse().unwrap();
        assert_eq!(key.as_bytes()[0], 0x61);
        assert_eq!(key.to_string(), KEY_FILE);
    }

    #[test]
    fn rejects_malformed_key_files() {
        assert!(matches!(
            "/key/swarm/psk/1.0.0/\n/base64/\nAAAA".parse::<PreSharedKey>(),
            Err(KeyParseError::UnsupportedEncoding(_))
        ));
        assert!(matches!(
            "/key/swarm/psk/1.0.0/\n/base16/\nabcd".parse::<PreSharedKey>(),
            Err(KeyParseError::InvalidKeyLength(2))
        ));
        assert!(matches!(
            "hello".parse::<PreSharedKey>(),
            Err(KeyParseError::InvalidKeyFile)
        ));
    }

    async fn exchange(left: PreSharedKey, right: PreSharedKey) -> Vec<u8> {
        let (a, b) = tokio::io::duplex(1024);
        let (a, b) = future::join(
            PnetConfig::new(left).handshake(a.compat()),
            PnetConfig::new(right).handshake(b.compat()),
        )
        .await;
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        a.write_all(b"hello there!").await.unwrap();
        a.flush().await.unwrap();
        let mut buf = vec![0u8; 12];
        b.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn same_key_round_trips() {
        let key = PreSharedKey::generate();
        assert_eq!(exchange(key, key).await, b"hello there!");
    }

    #[tokio::test]
    async fn different_keys_garble_the_stream() {
        let received = exchange(PreSharedKey::generate(), PreSharedKey::generate()).await;
        assert_ne!(received, b"hello there!");
    }
}
