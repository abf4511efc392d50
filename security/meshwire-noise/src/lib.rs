//! Noise `XX` handshake securing meshwire connections.
//!
//! Both parties exchange static X25519 keys inside the handshake and bind
//! them to their ed25519 identity with a signature, so the handshake yields
//! an authenticated [`PeerId`] for the remote.
//!
//! Every message on the wire is a 2-byte big-endian length followed by that
//! many bytes of noise ciphertext.

mod io;

use std::io as stdio;

use futures::{AsyncReadExt, AsyncWriteExt, FutureExt, future::BoxFuture};
use meshwire_core::{BoxedStream, ConnectionEncrypter, Keypair, PeerId, PublicKey};
use snow::{HandshakeState, params::NoiseParams};

pub use io::Output;

pub const PROTOCOL: &str = "/noise";

const PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
/// Prefix of the message an identity key signs to vouch for a static key.
const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";
const MAX_FRAME_LEN: usize = u16::MAX as usize;
/// Public key followed by an ed25519 signature.
const IDENTITY_PAYLOAD_LEN: usize = 32 + 64;

#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error(transparent)]
    Io(#[from] stdio::Error),
    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),
    #[error("invalid identity payload")]
    InvalidPayload,
    #[error("identity signature does not cover the remote static key")]
    BadSignature,
    #[error("remote did not reveal its static key")]
    MissingRemoteStatic,
}

impl From<NoiseError> for stdio::Error {
    fn from(err: NoiseError) -> Self {
        match err {
            NoiseError::Io(e) => e,
            e => stdio::Error::new(stdio::ErrorKind::InvalidData, e),
        }
    }
}

/// Noise configuration: the local identity and a static DH key signed by it.
#[derive(Clone)]
pub struct Config {
    identity: Keypair,
    params: NoiseParams,
    static_private: Vec<u8>,
    static_public: Vec<u8>,
    prologue: Vec<u8>,
}

impl Config {
    /// Creates a config with a freshly generated static key.
    pub fn new(identity: Keypair) -> Result<Self, NoiseError> {
        let params: NoiseParams = PATTERN.parse()?;
        let static_keypair = snow::Builder::new(params.clone()).generate_keypair()?;
        Ok(Config {
            identity,
            params,
            static_private: static_keypair.private,
            static_public: static_keypair.public,
            prologue: Vec::new(),
        })
    }

    /// Data both sides must agree on for the handshake to succeed.
    pub fn with_prologue(mut self, prologue: Vec<u8>) -> Self {
        self.prologue = prologue;
        self
    }

    fn handshake_state(&self, initiator: bool) -> Result<HandshakeState, NoiseError> {
        let builder = snow::Builder::new(self.params.clone())
            .local_private_key(&self.static_private)
            .prologue(&self.prologue);
        let state = if initiator {
            builder.build_initiator()?
        } else {
            builder.build_responder()?
        };
        Ok(state)
    }

    fn identity_payload(&self) -> Vec<u8> {
        let mut signed = STATIC_KEY_DOMAIN.to_vec();
        signed.extend_from_slice(&self.static_public);
        let mut payload = Vec::with_capacity(IDENTITY_PAYLOAD_LEN);
        payload.extend_from_slice(&self.identity.public().to_bytes());
        payload.extend_from_slice(&self.identity.sign(&signed));
        payload
    }

    async fn initiate(self, mut io: BoxedStream) -> Result<(PeerId, BoxedStream), NoiseError> {
        let mut state = self.handshake_state(true)?;
        // -> e
        send(&mut io, &mut state, &[]).await?;
        // <- e, ee, s, es
        let payload = recv(&mut io, &mut state).await?;
        let remote = verify_identity(&payload, &state)?;
        // -> s, se
        send(&mut io, &mut state, &self.identity_payload()).await?;

        let session = state.into_transport_mode()?;
        tracing::trace!(peer=%remote, "Noise handshake complete as initiator");
        Ok((remote, Box::new(Output::new(io, session))))
    }

    async fn respond(self, mut io: BoxedStream) -> Result<(PeerId, BoxedStream), NoiseError> {
        let mut state = self.handshake_state(false)?;
        recv(&mut io, &mut state).await?;
        send(&mut io, &mut state, &self.identity_payload()).await?;
        let payload = recv(&mut io, &mut state).await?;
        let remote = verify_identity(&payload, &state)?;

        let session = state.into_transport_mode()?;
        tracing::trace!(peer=%remote, "Noise handshake complete as responder");
        Ok((remote, Box::new(Output::new(io, session))))
    }
}

impl ConnectionEncrypter for Config {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn secure_inbound(&self, io: BoxedStream) -> BoxFuture<'static, stdio::Result<(PeerId, BoxedStream)>> {
        let config = self.clone();
        async move { Ok(config.respond(io).await?) }.boxed()
    }

    fn secure_outbound(
        &self,
        io: BoxedStream,
        _remote_peer: Option<PeerId>,
    ) -> BoxFuture<'static, stdio::Result<(PeerId, BoxedStream)>> {
        let config = self.clone();
        async move { Ok(config.initiate(io).await?) }.boxed()
    }
}

async fn send(
    io: &mut BoxedStream,
    state: &mut HandshakeState,
    payload: &[u8],
) -> Result<(), NoiseError> {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    let len = state.write_message(payload, &mut buf)?;
    io.write_all(&(len as u16).to_be_bytes()).await?;
    io.write_all(&buf[..len]).await?;
    io.flush().await?;
    Ok(())
}

async fn recv(io: &mut BoxedStream, state: &mut HandshakeState) -> Result<Vec<u8>, NoiseError> {
    let mut len = [0u8; 2];
    io.read_exact(&mut len).await?;
    let mut frame = vec![0u8; u16::from_be_bytes(len) as usize];
    io.read_exact(&mut frame).await?;

    let mut payload = vec![0u8; MAX_FRAME_LEN];
    let n = state.read_message(&frame, &mut payload)?;
    payload.truncate(n);
    Ok(payload)
}

/// Checks that the remote identity key signed the static key it used in
/// the handshake, and returns the identity.
fn verify_identity(payload: &[u8], state: &HandshakeState) -> Result<PeerId, NoiseError> {
    if payload.len() != IDENTITY_PAYLOAD_LEN {
        return Err(NoiseError::InvalidPayload);
    }
    let (key, signature) = payload.split_at(32);
    let key = PublicKey::from_bytes(key).map_err(|_| NoiseError::InvalidPayload)?;
    let remote_static = state
        .get_remote_static()
        .ok_or(NoiseError::MissingRemoteStatic)?;

    let mut signed = STATIC_KEY_DOMAIN.to_vec();
    signed.extend_from_slice(remote_static);
    if !key.verify(&signed, signature) {
        return Err(NoiseError::BadSignature);
    }
    Ok(key.to_peer_id())
}

#[cfg(test)]
mod tests {
    use futures::future;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    async fn secure_pair(
        alice: &Keypair,
        bob: &Keypair,
    ) -> (
        stdio::Result<(PeerId, BoxedStream)>,
        stdio::Result<(PeerId, BoxedStream)>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 16);
        future::join(
            Config::new(alice.clone())
                .unwrap()
                .secure_outbound(Box::new(a.compat()), None),
            Config::new(bob.clone())
                .unwrap()
                .secure_inbound(Box::new(b.compat())),
        )
        .await
    }

    #[tokio::test]
    async fn handshake_authenticates_both_identities() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (outbound, inbound) = secure_pair(&alice, &bob).await;
        assert_eq!(outbound.unwrap().0, bob.peer_id());
        assert_eq!(inbound.unwrap().0, alice.peer_id());
    }

    #[tokio::test]
    async fn transport_carries_data_both_ways() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (outbound, inbound) = secure_pair(&alice, &bob).await;
        let (_, mut a) = outbound.unwrap();
        let (_, mut b) = inbound.unwrap();

        let big = vec![0xab_u8; 3 * MAX_FRAME_LEN];
        let write = async {
            a.write_all(b"hello there!").await.unwrap();
            a.write_all(&big).await.unwrap();
            a.flush().await.unwrap();
        };
        let read = async {
            let mut greeting = [0u8; 12];
            b.read_exact(&mut greeting).await.unwrap();
            let mut rest = vec![0u8; big.len()];
            b.read_exact(&mut rest).await.unwrap();
            (greeting, rest)
        };
        let ((), (greeting, rest)) = future::join(write, read).await;
        assert_eq!(&greeting, b"hello there!");
        assert_eq!(rest, big);

        b.write_all(b"back").await.unwrap();
        b.flush().await.unwrap();
        let mut reply = [0u8; 4];
        a.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"back");
    }

    #[tokio::test]
    async fn mismatched_prologue_fails() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (outbound, inbound) = future::join(
            Config::new(Keypair::generate())
                .unwrap()
                .with_prologue(b"one".to_vec())
                .secure_outbound(Box::new(a.compat()), None),
            Config::new(Keypair::generate())
                .unwrap()
                .with_prologue(b"two".to_vec())
                .secure_inbound(Box::new(b.compat())),
        )
        .await;
        assert!(outbound.is_err() || inbound.is_err());
    }
}
