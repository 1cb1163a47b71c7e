//! Reads and writes: one overlapped operation from submission to cleanup.

use std::sync::Arc;

use futures::future::{self, Either};
use futures::pin_mut;
use log::trace;
use tokio_util::sync::CancellationToken;

use crate::buf::{check_range, IoBuf, IoBufMut};
use crate::completion::Completion;
use crate::device::{
    Driver, Handle, Submitted, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED,
};
use crate::port::{SerialPort, CLOSED};
use crate::registry::Token;
use crate::{BufResult, Error, Result};

impl<D: Driver> SerialPort<D> {
    /// Reads up to `count` bytes into `buf[offset..offset + count]`.
    ///
    /// How long the read waits for data is governed by the port's
    /// [`TimeoutMode`](crate::TimeoutMode); `Ok(0)` means nothing arrived.
    /// Cancelling `cancel`, or closing the port, ends the read with
    /// [`Error::Cancelled`] unless the device finished it first.
    ///
    /// The buffer is returned with the result. If the future is dropped while
    /// the device still owns the buffer, the drop cancels the read and blocks
    /// until the device has released it.
    pub async fn read<B: IoBufMut>(
        &self,
        mut buf: B,
        offset: usize,
        count: usize,
        cancel: Option<&CancellationToken>,
    ) -> BufResult<usize, B> {
        if let Err(err) = self.validate(buf.bytes_total(), offset, count) {
            return (Err(err), buf);
        }
        let res = self
            .execute(&mut buf, cancel, |handle, context, buf: &mut B| unsafe {
                handle.read_overlapped(buf.stable_mut_ptr().add(offset), count, context)
            })
            .await;
        (res, buf)
    }

    /// Writes up to `count` bytes from `buf[offset..offset + count]`.
    ///
    /// Returns the number of bytes the device accepted. Cancellation and
    /// buffer ownership behave as for [`read`](Self::read).
    pub async fn write<B: IoBuf>(
        &self,
        mut buf: B,
        offset: usize,
        count: usize,
        cancel: Option<&CancellationToken>,
    ) -> BufResult<usize, B> {
        if let Err(err) = self.validate(buf.bytes_total(), offset, count) {
            return (Err(err), buf);
        }
        let res = self
            .execute(&mut buf, cancel, |handle, context, buf: &mut B| unsafe {
                handle.write_overlapped(buf.stable_ptr().add(offset), count, context)
            })
            .await;
        (res, buf)
    }

    fn validate(&self, len: usize, offset: usize, count: usize) -> Result<()> {
        if !self.is_open() {
            return Err(Error::InvalidState(CLOSED));
        }
        check_range(len, offset, count)
    }

    /// Drives one operation to its end.
    ///
    /// `buf` is borrowed for the whole call, and the [`Pending`] guard that
    /// owns the device side of the operation lives inside this future, so the
    /// guard always finishes with the device before the buffer can go away.
    async fn execute<B, F>(
        &self,
        buf: &mut B,
        cancel: Option<&CancellationToken>,
        submit: F,
    ) -> Result<usize>
    where
        F: FnOnce(
            &D::Handle,
            &<D::Handle as Handle>::Context,
            &mut B,
        ) -> std::result::Result<Submitted, u32>,
    {
        let handle = self.handle()?;
        let context = handle.context().map_err(|code| self.device_error(code))?;
        let mut op = Pending {
            port: self,
            handle,
            context: Arc::new(context),
            token: None,
            in_flight: false,
        };

        let (token, session) = {
            let mut state = self.state.lock();
            // Closed, or closed and reopened, since the handle was taken.
            if !state.is_current(&op.handle) {
                return Err(Error::InvalidState(CLOSED));
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }

            match submit(&*op.handle, &*op.context, buf) {
                Ok(Submitted::Complete(n)) => {
                    trace!("operation completed synchronously: {} bytes", n);
                    return Ok(n);
                }
                Ok(Submitted::Pending) | Err(ERROR_IO_PENDING) => op.in_flight = true,
                Err(ERROR_OPERATION_ABORTED) => return Err(Error::Cancelled),
                Err(code) => return Err(self.device_error(code)),
            }
            // Still under the lock, so a cancel or close cannot slip in between.
            let token = state.ops.insert(op.handle.clone(), op.context.clone());
            op.token = Some(token);
            (token, state.session.clone())
        };
        trace!("operation {} pending", token);

        let mut completion =
            Completion::watch(&*op.handle, &*op.context).map_err(|code| self.device_error(code))?;
        let stop = stop_requested(cancel, &session);
        pin_mut!(stop);

        // A stop request seen together with the completion still goes through
        // the device, whose final status decides the outcome.
        let stopped = matches!(future::select(stop, &mut completion).await, Either::Left(_));
        if stopped {
            self.cancel_operation(token);
            // The device may still be using the buffer until it acknowledges.
            (&mut completion).await;
        }
        drop(completion);

        match op.handle.overlapped_result(&*op.context) {
            Ok(n) => {
                op.in_flight = false;
                trace!("operation {} completed: {} bytes", token, n);
                Ok(n)
            }
            Err(ERROR_IO_INCOMPLETE) => Err(self.device_error(ERROR_IO_INCOMPLETE)),
            Err(ERROR_OPERATION_ABORTED) => {
                op.in_flight = false;
                trace!("operation {} cancelled", token);
                Err(Error::Cancelled)
            }
            Err(code) => {
                op.in_flight = false;
                Err(self.device_error(code))
            }
        }
    }
}

/// Resolves when the caller cancels or the session is closed.
async fn stop_requested(cancel: Option<&CancellationToken>, session: &CancellationToken) {
    match cancel {
        Some(cancel) => {
            let by_caller = cancel.cancelled();
            let by_close = session.cancelled();
            pin_mut!(by_caller, by_close);
            future::select(by_caller, by_close).await;
        }
        None => session.cancelled().await,
    }
}

/// The device side of one operation, released on every exit path.
///
/// Dropping it removes the registry entry. If the device still owns the
/// operation at that point, because the caller stopped waiting or the result
/// could not be fetched, the operation is cancelled and drained first so the
/// buffer and completion context outlive it.
struct Pending<'a, D: Driver> {
    port: &'a SerialPort<D>,
    handle: Arc<D::Handle>,
    context: Arc<<D::Handle as Handle>::Context>,
    token: Option<Token>,
    in_flight: bool,
}

impl<D: Driver> Drop for Pending<'_, D> {
    fn drop(&mut self) {
        if self.in_flight {
            if let Some(token) = self.token {
                trace!("operation {} abandoned, draining", token);
                self.port.cancel_operation(token);
            }
            if let Err(code) = self.handle.drain(&*self.context) {
                trace!("drained operation ended with error {}", code);
            }
        }
        if let Some(token) = self.token {
            self.port.state.lock().ops.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{Loopback, ERROR_GEN_FAILURE};
    use crate::settings::{PortSettings, TimeoutMode};
    use futures::executor::block_on;
    use std::time::Duration;

    fn open_port(mode: TimeoutMode) -> SerialPort<Loopback> {
        let settings = PortSettings::new(115_200)
            .with_buffer_sizes(16, 16)
            .with_timeout(mode, Duration::from_millis(20));
        let port = SerialPort::new(Loopback::new(), "loop", settings);
        port.open().unwrap();
        port
    }

    #[test]
    fn out_of_range_is_rejected_before_submission() {
        let port = open_port(TimeoutMode::Immediate);
        let (res, buf) = block_on(port.read(vec![0u8; 12], 10, 5, None));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        assert_eq!(buf.len(), 12);

        let (res, _) = block_on(port.write(vec![0u8; 12], 13, 0, None));
        assert!(matches!(res, Err(Error::InvalidArgument(_))));

        assert_eq!(port.driver().submitted(), 0);
        assert_eq!(port.pending_operations(), 0);
    }

    #[test]
    fn io_on_closed_port_is_invalid_state() {
        let port = SerialPort::new(Loopback::new(), "loop", PortSettings::default());
        let (res, _) = block_on(port.read(vec![0u8; 4], 0, 4, None));
        assert!(matches!(res, Err(Error::InvalidState(_))));
        let (res, _) = block_on(port.write(b"data", 0, 4, None));
        assert!(matches!(res, Err(Error::InvalidState(_))));

        port.open().unwrap();
        port.close();
        let (res, _) = block_on(port.write(b"data", 0, 4, None));
        assert!(matches!(res, Err(Error::InvalidState(_))));
        assert_eq!(port.driver().submitted(), 0);
    }

    #[test]
    fn already_cancelled_token_never_submits() {
        let port = open_port(TimeoutMode::WaitAny);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (res, _) = block_on(port.read(vec![0u8; 4], 0, 4, Some(&cancel)));
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(port.driver().submitted(), 0);
        assert_eq!(port.pending_operations(), 0);
    }

    #[test]
    fn writes_at_an_offset() {
        let port = open_port(TimeoutMode::Immediate);
        let (res, _) = block_on(port.write(*b"xxhello", 2, 5, None));
        assert_eq!(res.unwrap(), 5);

        let (res, buf) = block_on(port.read([0u8; 8], 3, 5, None));
        assert_eq!(res.unwrap(), 5);
        assert_eq!(&buf[3..], b"hello");
    }

    #[test]
    fn pending_write_completes_asynchronously() {
        let port = open_port(TimeoutMode::Immediate);
        let data: Vec<u8> = (0..40).collect();

        let (res, data) = block_on(port.write(data, 0, 40, None));
        assert_eq!(res.unwrap(), 40);
        assert_eq!(port.pending_operations(), 0);

        let (res, buf) = block_on(port.read(vec![0u8; 64], 0, 64, None));
        assert_eq!(res.unwrap(), 40);
        assert_eq!(&buf[..40], &data[..]);
    }

    #[test]
    fn wait_all_returns_partial_count_on_timeout() {
        let port = open_port(TimeoutMode::WaitAll);
        port.driver().feed(b"abc");

        let (res, buf) = block_on(port.read(vec![0u8; 8], 0, 8, None));
        assert_eq!(res.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(port.pending_operations(), 0);
    }

    #[test]
    fn dropping_a_pending_read_releases_it() {
        let port = open_port(TimeoutMode::WaitAny);
        block_on(async {
            let read = port.read(vec![0u8; 4], 0, 4, None);
            pin_mut!(read);
            assert!(futures::poll!(read.as_mut()).is_pending());
            assert_eq!(port.pending_operations(), 1);
        });
        assert_eq!(port.pending_operations(), 0);

        // The abandoned read must not swallow later data.
        port.driver().feed(b"z");
        let (res, buf) = block_on(port.read(vec![0u8; 4], 0, 4, None));
        assert_eq!(res.unwrap(), 1);
        assert_eq!(buf[0], b'z');
    }

    #[test]
    fn failed_submission_is_a_device_error() {
        let port = open_port(TimeoutMode::WaitAny);
        port.driver().fail_next_io(ERROR_GEN_FAILURE);

        let (res, _) = block_on(port.write(b"data", 0, 4, None));
        match res {
            Err(Error::Device { code, message }) => {
                assert_eq!(code, ERROR_GEN_FAILURE);
                assert_eq!(message, "A device attached to the system is not functioning.");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(port.pending_operations(), 0);

        let (res, _) = block_on(port.write(b"data", 0, 4, None));
        assert_eq!(res.unwrap(), 4);
    }

    #[test]
    fn aborted_submission_is_cancelled() {
        let port = open_port(TimeoutMode::WaitAny);
        port.driver().fail_next_io(ERROR_OPERATION_ABORTED);

        let (res, _) = block_on(port.read(vec![0u8; 4], 0, 4, None));
        assert!(matches!(res, Err(Error::Cancelled)), "got {:?}", res);
        assert_eq!(port.pending_operations(), 0);
    }

    #[test]
    fn failed_completion_is_a_device_error() {
        let port = open_port(TimeoutMode::WaitAny);

        port.driver().fail_next_completion(ERROR_GEN_FAILURE);
        let (res, _) = block_on(port.read(vec![0u8; 4], 0, 4, None));
        assert!(matches!(res, Err(Error::Device { code: ERROR_GEN_FAILURE, .. })), "got {:?}", res);
        assert_eq!(port.pending_operations(), 0);

        // Larger than the write queue, so the write goes pending too.
        port.driver().fail_next_completion(ERROR_GEN_FAILURE);
        let (res, _) = block_on(port.write(vec![1u8; 40], 0, 40, None));
        assert_eq!(res.unwrap_err().native_code(), Some(ERROR_GEN_FAILURE));
        assert_eq!(port.pending_operations(), 0);
        assert_eq!(port.driver().buffered(), 0);
    }

    #[test]
    fn cancel_after_the_device_finished_keeps_the_result() {
        let port = open_port(TimeoutMode::WaitAny);
        let cancel = CancellationToken::new();

        block_on(async {
            let read = port.read(vec![0u8; 4], 0, 4, Some(&cancel));
            pin_mut!(read);
            assert!(futures::poll!(read.as_mut()).is_pending());

            port.driver().feed(b"ok");
            cancel.cancel();

            let (res, buf) = read.await;
            assert_eq!(res.unwrap(), 2);
            assert_eq!(&buf[..2], b"ok");
        });
        assert_eq!(port.pending_operations(), 0);
    }
}
