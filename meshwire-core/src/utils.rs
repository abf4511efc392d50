use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{
    AsyncRead, AsyncWrite,
    future::{self, Either},
    pin_mut,
};
use futures_timer::Delay;

use crate::Error;

/// Object-safe bundle of the duplex traits every layer of a connection speaks.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A type-erased duplex byte stream.
pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `fut` to completion or fails with [`Error::Timeout`].
pub(crate) async fn timeout<F>(fut: F, duration: Duration) -> Result<F::Output, Error>
where
    F: Future,
{
    pin_mut!(fut);
    match future::select(fut, Delay::new(duration)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(Error::Timeout),
    }
}
