use futures::future::BoxFuture;

/// Spawns the background tasks of a connection: its muxer driver and
/// one task per inbound stream.
pub trait Executor: Send + Sync {
    fn exec(&self, future: BoxFuture<'static, ()>);
}

impl<F> Executor for F
where
    F: Fn(BoxFuture<'static, ()>) + Send + Sync,
{
    fn exec(&self, future: BoxFuture<'static, ()>) {
        self(future)
    }
}
