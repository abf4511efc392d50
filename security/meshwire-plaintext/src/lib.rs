//! Identity exchange without encryption.
//!
//! Each side writes its 32-byte ed25519 public key and reads the remote's.
//! Nothing is authenticated, so only use it in tests or on links that are
//! already trusted.

use std::io;

use futures::{AsyncReadExt, AsyncWriteExt, FutureExt, future::BoxFuture};
use meshwire_core::{BoxedStream, ConnectionEncrypter, DecodingError, PeerId, PublicKey};

pub const PROTOCOL: &str = "/plaintext/2.0.0";

#[derive(Debug, thiserror::Error)]
pub enum PlaintextError {
    #[error("remote sent an invalid public key: {0}")]
    InvalidPublicKey(#[from] DecodingError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<PlaintextError> for io::Error {
    fn from(err: PlaintextError) -> Self {
        match err {
            PlaintextError::Io(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    local_key: PublicKey,
}

impl Config {
    pub fn new(local_key: PublicKey) -> Self {
        Config { local_key }
    }

    async fn handshake(self, mut io: BoxedStream) -> Result<(PeerId, BoxedStream), PlaintextError> {
        io.write_all(&self.local_key.to_bytes()).await?;
        io.flush().await?;

        let mut remote = [0u8; 32];
        io.read_exact(&mut remote).await?;
        let remote = PublicKey::from_bytes(&remote)?;
        tracing::trace!(peer=%remote.to_peer_id(), "Plaintext handshake complete");
        Ok((remote.to_peer_id(), io))
    }
}

impl ConnectionEncrypter for Config {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn secure_inbound(&self, io: BoxedStream) -> BoxFuture<'static, io::Result<(PeerId, BoxedStream)>> {
        let config = self.clone();
        async move { Ok(config.handshake(io).await?) }.boxed()
    }

    fn secure_outbound(
        &self,
        io: BoxedStream,
        _remote_peer: Option<PeerId>,
    ) -> BoxFuture<'static, io::Result<(PeerId, BoxedStream)>> {
        let config = self.clone();
        async move { Ok(config.handshake(io).await?) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::future;
    use meshwire_core::Keypair;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    #[tokio::test]
    async fn both_sides_learn_each_others_identity() {
        let (a, b) = tokio::io::duplex(256);
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let (outbound, inbound) = future::join(
            Config::new(alice.public()).secure_outbound(Box::new(a.compat()), None),
            Config::new(bob.public()).secure_inbound(Box::new(b.compat())),
        )
        .await;

        assert_eq!(outbound.unwrap().0, bob.peer_id());
        assert_eq!(inbound.unwrap().0, alice.peer_id());
    }

    #[tokio::test]
    async fn truncated_key_fails_the_handshake() {
        let (a, mut b) = tokio::io::duplex(256);
        let alice = Keypair::generate();
        let remote = async move {
            use tokio::io::AsyncWriteExt;
            b.write_all(&[1, 2, 3]).await.unwrap();
            b.shutdown().await.unwrap();
            b
        };
        let (result, _b) = future::join(
            Config::new(alice.public()).secure_inbound(Box::new(a.compat())),
            remote,
        )
        .await;
        let err = result.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
