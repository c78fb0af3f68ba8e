//! Promise-style task primitives backing every op's shared future.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::op::OpResult;
use crate::Error;

/// The shared future every [`Op`] clone observes.
///
/// [`Op`]: crate::op::Op
pub type OpFuture = Shared<BoxFuture<'static, OpResult>>;

/// The completion side of an op's future.
///
/// Differs from a plain oneshot in that it may be completed by a third party
/// before the work that would normally produce the result has run; whichever
/// caller wins the race on the `done` flag publishes the result, and the
/// loser's value is discarded. Clones share state, so any clone may complete
/// the op.
#[derive(Clone)]
pub(crate) struct OpTask {
    done: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<oneshot::Sender<OpResult>>>>,
    future: OpFuture,
}

impl OpTask {
    pub(crate) fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let future = rx
            .map(|result| {
                result.unwrap_or_else(|_| {
                    Err(Error::Aborted(
                        "op abandoned before completion".into(),
                    ))
                })
            })
            .boxed()
            .shared();

        OpTask {
            done: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            future,
        }
    }

    /// A clone of the shared future for this task's result.
    pub(crate) fn future(&self) -> OpFuture {
        self.future.clone()
    }

    /// Publish the result. Returns whether this call won the race; a losing
    /// call is a no-op.
    pub(crate) fn complete(&self, result: OpResult) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let tx = self
                .tx
                .lock()
                .expect("op task lock poisoned")
                .take()
                .expect("winning completion found no sender");
            // The receiver lives inside our shared future, which we hold.
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for OpTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpTask")
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future for a side-result produced alongside an op, e.g. the value computed
/// by [`Dispatcher::call`], the filled buffers of a read, or an enumeration
/// batch.
///
/// [`Dispatcher::call`]: crate::dispatcher::Dispatcher::call
#[derive(Debug)]
pub struct ValueFuture<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> ValueFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, Error>>) -> Self {
        ValueFuture { rx }
    }
}

impl<T> Future for ValueFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(Error::Aborted("op abandoned before completion".into()))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn first_completion_wins() {
        let task = OpTask::new();
        assert!(task.complete(Ok(None)));
        assert!(!task.complete(Err(Error::invalid("loser"))));

        let result = task.future().await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let task = OpTask::new();
        let clone = task.clone();
        assert!(clone.complete(Ok(None)));
        assert!(!task.complete(Ok(None)));

        // Both futures resolve to the published value.
        assert!(matches!(task.future().await, Ok(None)));
        assert!(matches!(clone.future().await, Ok(None)));
    }

    #[test]
    fn dropping_the_task_aborts_waiters() {
        let task = OpTask::new();
        let future = task.future();
        drop(task);

        let result = future.now_or_never().expect("dropped sender resolves");
        assert!(matches!(result, Err(Error::Aborted(_))));
    }
}
