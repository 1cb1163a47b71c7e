//! Turns a device completion signal into a future.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::device::Handle;

/// Resolves once the device signals one pending operation.
///
/// The wait itself is parked with the driver's shared waiter (the system
/// thread pool on Windows), not on a thread of its own. The observation is
/// unregistered as soon as the future resolves or is dropped.
pub(crate) struct Completion<W> {
    signal: oneshot::Receiver<()>,
    watch: Option<W>,
}

impl<W> Completion<W> {
    pub(crate) fn watch<H>(handle: &H, context: &H::Context) -> Result<Completion<W>, u32>
    where
        H: Handle<Watch = W>,
    {
        let (notify, signal) = oneshot::channel();
        let watch = handle.watch(context, notify)?;
        Ok(Completion { signal, watch: Some(watch) })
    }

    /// Whether the device already signalled, without registering a waker.
    #[cfg(test)]
    pub(crate) fn is_signalled(&mut self) -> bool {
        matches!(self.signal.try_recv(), Ok(Some(())))
    }
}

impl<W: Unpin> Future for Completion<W> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        // A dropped sender means the driver gave up watching; the caller finds
        // out what happened from the overlapped result either way.
        match Pin::new(&mut this.signal).poll(cx) {
            Poll::Ready(_) => {
                this.watch = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
