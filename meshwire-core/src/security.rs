use std::io;

use futures::{FutureExt, future::BoxFuture};

use crate::{
    Negotiated, PeerId, Upgrade, UpgradeInfo, registry::Registry, utils::BoxedStream,
};

/// A connection encrypter, e.g. noise or plaintext.
///
/// Both directions authenticate the remote and hand back its [`PeerId`]
/// along with the secured duplex.
pub trait ConnectionEncrypter: Send + Sync + 'static {
    /// The protocol id announced during negotiation.
    fn protocol(&self) -> &str;

    fn secure_inbound(&self, io: BoxedStream) -> BoxFuture<'static, io::Result<(PeerId, BoxedStream)>>;

    /// `remote_peer` is the peer the dialer expects, if known.
    fn secure_outbound(
        &self,
        io: BoxedStream,
        remote_peer: Option<PeerId>,
    ) -> BoxFuture<'static, io::Result<(PeerId, BoxedStream)>>;
}

/// The result of a successful security upgrade.
pub struct SecuredConnection {
    pub remote_peer: PeerId,
    /// Protocol id of the encrypter that secured the connection.
    pub protocol: String,
    pub stream: BoxedStream,
}

/// Negotiates one of the registered encrypters and runs its handshake.
#[derive(Clone)]
pub struct SecurityUpgrade {
    encrypters: Registry<dyn ConnectionEncrypter>,
    remote_peer: Option<PeerId>,
}

impl SecurityUpgrade {
    pub fn new(encrypters: Registry<dyn ConnectionEncrypter>, remote_peer: Option<PeerId>) -> Self {
        SecurityUpgrade {
            encrypters,
            remote_peer,
        }
    }

    fn secure(
        self,
        stream: Negotiated<BoxedStream>,
        info: String,
        outbound: bool,
    ) -> BoxFuture<'static, io::Result<SecuredConnection>> {
        let Some(encrypter) = self.encrypters.get(&info).cloned() else {
            let err = io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no encrypter registered for {info}"),
            );
            return futures::future::ready(Err(err)).boxed();
        };
        let handshake = if outbound {
            encrypter.secure_outbound(Box::new(stream), self.remote_peer)
        } else {
            encrypter.secure_inbound(Box::new(stream))
        };
        async move {
            let (remote_peer, stream) = handshake.await?;
            Ok(SecuredConnection {
                remote_peer,
                protocol: info,
                stream,
            })
        }
        .boxed()
    }
}

impl UpgradeInfo for SecurityUpgrade {
    type Info = String;
    type InfoIter = std::vec::IntoIter<String>;

    fn protocol_info(&self) -> Self::InfoIter {
        self.encrypters
            .protocols()
            .map(str::to_owned)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl Upgrade<Negotiated<BoxedStream>> for SecurityUpgrade {
    type Output = SecuredConnection;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<SecuredConnection>>;

    fn upgrade_inbound(self, stream: Negotiated<BoxedStream>, info: Self::Info) -> Self::Future {
        self.secure(stream, info, false)
    }

    fn upgrade_outbound(self, stream: Negotiated<BoxedStream>, info: Self::Info) -> Self::Future {
        self.secure(stream, info, true)
    }
}
