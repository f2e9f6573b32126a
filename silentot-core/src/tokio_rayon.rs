//! Run CPU-bound work on rayon from async code.
//!
//! Tree expansion and encoding are too expensive to run on a tokio worker, so
//! the protocols hand them to the rayon pool and await the result.
use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    pin::Pin,
    task::{Context, Poll},
    thread,
};

use tokio::sync::oneshot;

pub struct TokioRayonJoinHandle<T: Send> {
    rx: oneshot::Receiver<thread::Result<T>>,
}

/// Spawns `func` on the global [`rayon`] pool. The returned handle resolves to
/// the result, or to the panic payload if `func` panicked.
pub fn spawn_compute<F, T>(func: F) -> TokioRayonJoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    rayon::spawn(|| {
        let res = catch_unwind(AssertUnwindSafe(func));
        if let Err(Err(panic)) = tx.send(res) {
            // nobody is waiting for the result, let rayon handle the panic
            resume_unwind(panic);
        }
    });
    TokioRayonJoinHandle { rx }
}

impl<T: Send + 'static> Future for TokioRayonJoinHandle<T> {
    type Output = thread::Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);
        match rx.poll(cx) {
            Poll::Ready(res) => {
                Poll::Ready(res.expect("oneshot::Sender is not dropped before send"))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
