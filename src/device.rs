//! The seam between the I/O engine and the device driver.
//!
//! A [`Driver`] opens and configures devices, a [`Handle`] is one open device
//! that accepts overlapped reads and writes. Every operation gets its own
//! completion context from [`Handle::context`]; the engine keeps that context
//! alive, and at a fixed address, until the driver reports it finished.
//!
//! Errors cross this seam as native (Win32) error codes so the engine can
//! classify them without knowing which driver produced them.

use futures::channel::oneshot;

use crate::settings::PortSettings;

/// Access denied, typically because another process holds the device.
pub const ERROR_ACCESS_DENIED: u32 = 5;
/// The device has been closed.
pub const ERROR_INVALID_HANDLE: u32 = 6;
/// A parameter was rejected by the driver.
pub const ERROR_INVALID_PARAMETER: u32 = 87;
/// The operation was cancelled.
pub const ERROR_OPERATION_ABORTED: u32 = 995;
/// The operation has not completed yet.
pub const ERROR_IO_INCOMPLETE: u32 = 996;
/// The operation was queued and will complete later.
pub const ERROR_IO_PENDING: u32 = 997;
/// There was nothing to cancel.
pub const ERROR_NOT_FOUND: u32 = 1168;

/// Outcome of submitting an overlapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// The operation finished synchronously, transferring this many bytes.
    Complete(usize),
    /// The operation is in flight; its context will be signalled.
    Pending,
}

/// Opens devices and describes their errors.
pub trait Driver: Send + Sync {
    /// An open device.
    type Handle: Handle;

    /// Opens the device at `path` and configures it from `settings`.
    ///
    /// Anything acquired before a failure must be released before returning.
    fn open(&self, path: &str, settings: &PortSettings) -> Result<Self::Handle, u32>;

    /// Human readable description of a native error code.
    fn translate_error(&self, code: u32) -> String;
}

/// An open device accepting overlapped operations.
pub trait Handle: Send + Sync + 'static {
    /// Per-operation completion context.
    type Context: Send + Sync + 'static;

    /// Registration of a completion observer; dropping it unregisters.
    type Watch: Send + Unpin;

    /// Allocates a fresh completion context.
    fn context(&self) -> Result<Self::Context, u32>;

    /// Starts reading up to `len` bytes into `buf`.
    ///
    /// # Safety
    ///
    /// `buf..buf + len` must stay valid for writes, and `context` must stay
    /// alive, until the operation has completed: either `Complete` was
    /// returned, or [`overlapped_result`](Handle::overlapped_result) or
    /// [`drain`](Handle::drain) returned something other than
    /// `ERROR_IO_INCOMPLETE`.
    unsafe fn read_overlapped(
        &self,
        buf: *mut u8,
        len: usize,
        context: &Self::Context,
    ) -> Result<Submitted, u32>;

    /// Starts writing `len` bytes from `buf`.
    ///
    /// # Safety
    ///
    /// Same contract as [`read_overlapped`](Handle::read_overlapped), for reads
    /// of `buf..buf + len`.
    unsafe fn write_overlapped(
        &self,
        buf: *const u8,
        len: usize,
        context: &Self::Context,
    ) -> Result<Submitted, u32>;

    /// Result of a pending operation, without waiting.
    ///
    /// Returns `ERROR_IO_INCOMPLETE` while the operation is still in flight.
    fn overlapped_result(&self, context: &Self::Context) -> Result<usize, u32>;

    /// Blocks until a pending operation completes and returns its result.
    fn drain(&self, context: &Self::Context) -> Result<usize, u32>;

    /// Requests cancellation of the one operation using `context`.
    ///
    /// Returns `ERROR_NOT_FOUND` if there was nothing left to cancel.
    fn cancel(&self, context: &Self::Context) -> Result<(), u32>;

    /// Arranges for `notify` to fire once the operation using `context`
    /// completes, or right away if it already has.
    fn watch(&self, context: &Self::Context, notify: oneshot::Sender<()>)
        -> Result<Self::Watch, u32>;

    /// Releases the device now, even while other references to the handle
    /// are still alive. Closing twice does nothing.
    ///
    /// Callers drain their in-flight operations first. Afterwards submissions
    /// fail with `ERROR_INVALID_HANDLE` and `cancel` reports `ERROR_NOT_FOUND`.
    /// Results of operations that already completed stay available; a context
    /// that never completed reports `ERROR_OPERATION_ABORTED`.
    fn close(&self);
}
