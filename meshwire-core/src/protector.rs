use std::io;

use futures::future::BoxFuture;

use crate::utils::BoxedStream;

/// Wraps a raw connection before any negotiation takes place, e.g. with a
/// pre-shared key. A failed protection aborts the upgrade.
pub trait ConnectionProtector: Send + Sync + 'static {
    fn protect(&self, io: BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>>;
}
