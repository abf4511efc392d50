use std::fmt;

use futures::{
    FutureExt,
    channel::oneshot,
    future::{self, Either, Shared},
    pin_mut,
};

use crate::Error;

/// Triggers the [`AbortSignal`]s created from it.
///
/// Dropping the controller without calling [`abort`](Self::abort) does not
/// count as an abort.
pub struct AbortController {
    trigger: oneshot::Sender<()>,
    signal: AbortSignal,
}

/// A cancellation token observed by upgrades and stream opens.
#[derive(Clone)]
pub struct AbortSignal {
    aborted: Shared<oneshot::Receiver<()>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (trigger, aborted) = oneshot::channel();
        AbortController {
            trigger,
            signal: AbortSignal {
                aborted: aborted.shared(),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(self) {
        let _ = self.trigger.send(());
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        matches!(self.aborted.peek(), Some(Ok(())))
    }

    /// Resolves once aborted. Never resolves if the controller is dropped.
    pub async fn aborted(&self) {
        if self.aborted.clone().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("signal", &self.signal)
            .finish()
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Runs `fut` unless `signal` fires first, in which case it is dropped and
/// [`Error::Cancelled`] is returned.
pub(crate) async fn abortable<F, T>(fut: F, signal: Option<&AbortSignal>) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let Some(signal) = signal else {
        return fut.await;
    };
    if signal.is_aborted() {
        return Err(Error::Cancelled);
    }
    let aborted = signal.aborted();
    pin_mut!(fut);
    pin_mut!(aborted);
    match future::select(fut, aborted).await {
        Either::Left((output, _)) => output,
        Either::Right(_) => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_cancels_pending_work() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let work = abortable(future::pending::<Result<(), Error>>(), Some(&signal));
        controller.abort();
        assert!(matches!(work.await, Err(Error::Cancelled)));
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn dropped_controller_is_not_an_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        drop(controller);
        assert!(!signal.is_aborted());
        let result = abortable(async { Ok(7) }, Some(&signal)).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn already_aborted_signal_short_circuits() {
        let controller = AbortController::new();
        let signal = controller.signal();
        controller.abort();
        // peek only sees the value once the shared future has been polled
        signal.aborted().await;
        let result = abortable(async { Ok(()) }, Some(&signal)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
