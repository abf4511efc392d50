use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use futures::{FutureExt, future::BoxFuture};

use crate::{Connection, Stream};

/// An inbound stream whose protocol was negotiated, handed to the handler
/// registered for that protocol.
#[derive(Debug)]
pub struct IncomingStream {
    pub connection: Connection,
    pub stream: Stream,
    pub protocol: String,
}

/// Serves inbound streams for one or more protocols.
pub trait StreamHandler: Send + Sync + 'static {
    fn call(&self, incoming: IncomingStream) -> BoxFuture<'static, ()>;
}

impl<F, Fut> StreamHandler for F
where
    F: Fn(IncomingStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, incoming: IncomingStream) -> BoxFuture<'static, ()> {
        self(incoming).boxed()
    }
}

type HandlerMap = HashMap<String, Arc<dyn StreamHandler>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("a handler is already registered for {0}")]
    DuplicateProtocol(String),

    #[error("invalid protocol id: {0:?}")]
    InvalidProtocol(String),
}

/// Maps protocol ids to stream handlers.
///
/// Writers replace the whole map, so inbound negotiation works on a
/// consistent snapshot even while handlers are added or removed.
#[derive(Clone, Default)]
pub struct Registrar {
    handlers: Arc<RwLock<Arc<HandlerMap>>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every protocol in `protocols`.
    ///
    /// Nothing is registered if any protocol id is invalid or already taken.
    pub fn handle<I, P, H>(&self, protocols: I, handler: H) -> Result<(), RegistrarError>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
        H: StreamHandler,
    {
        let handler: Arc<dyn StreamHandler> = Arc::new(handler);
        let protocols: Vec<String> = protocols.into_iter().map(Into::into).collect();

        let mut guard = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut next = HandlerMap::clone(&guard);
        for protocol in protocols {
            if !protocol.starts_with('/') || protocol.contains('\n') {
                return Err(RegistrarError::InvalidProtocol(protocol));
            }
            if next.contains_key(&protocol) {
                return Err(RegistrarError::DuplicateProtocol(protocol));
            }
            tracing::debug!(protocol=%protocol, "Registered stream handler");
            next.insert(protocol, handler.clone());
        }
        *guard = Arc::new(next);
        Ok(())
    }

    /// Removes the handlers for `protocols`. Unknown ids are ignored.
    pub fn unhandle<I, P>(&self, protocols: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let mut guard = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut next = HandlerMap::clone(&guard);
        for protocol in protocols {
            if next.remove(protocol.as_ref()).is_some() {
                tracing::debug!(protocol=%protocol.as_ref(), "Removed stream handler");
            }
        }
        *guard = Arc::new(next);
    }

    /// The registered protocol ids, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.snapshot().keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub fn handler(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.snapshot().get(protocol).cloned()
    }

    pub(crate) fn snapshot(&self) -> Arc<HandlerMap> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("protocols", &self.protocols())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_: IncomingStream) {}

    #[test]
    fn handle_and_unhandle_update_the_protocol_set() {
        let registrar = Registrar::new();
        registrar.handle(["/b/1", "/a/1"], noop).unwrap();
        assert_eq!(registrar.protocols(), ["/a/1", "/b/1"]);

        registrar.unhandle(["/a/1", "/missing"]);
        assert_eq!(registrar.protocols(), ["/b/1"]);
        assert!(registrar.handler("/a/1").is_none());
        assert!(registrar.handler("/b/1").is_some());
    }

    #[test]
    fn duplicate_registration_leaves_the_map_untouched() {
        let registrar = Registrar::new();
        registrar.handle(["/a/1"], noop).unwrap();
        let err = registrar.handle(["/c/1", "/a/1"], noop).unwrap_err();
        assert!(matches!(err, RegistrarError::DuplicateProtocol(p) if p == "/a/1"));
        assert_eq!(registrar.protocols(), ["/a/1"]);
    }

    #[test]
    fn protocol_ids_must_be_paths() {
        let registrar = Registrar::new();
        assert!(matches!(
            registrar.handle(["echo"], noop),
            Err(RegistrarError::InvalidProtocol(_))
        ));
    }

    #[test]
    fn snapshots_are_stable_across_updates() {
        let registrar = Registrar::new();
        registrar.handle(["/a/1"], noop).unwrap();
        let snapshot = registrar.snapshot();
        registrar.handle(["/b/1"], noop).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registrar.snapshot().len(), 2);
    }
}
