//! An in-memory device that loops written bytes back to its reader.
//!
//! The loopback behaves like a serial port with its TX line wired to its RX
//! line. It honours the [`Timeouts`] derived at open time the way a serial
//! driver does, completes large writes asynchronously, and cancels single
//! operations, which makes it a stand-in for real hardware in tests. Device
//! failures can be injected at open, at submission and at completion.
//!
//! Each open session runs one service thread that completes every pending
//! operation of that session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::device::{
    Driver, Handle, Submitted, ERROR_ACCESS_DENIED, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER,
    ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED,
};
use crate::settings::{PortSettings, Timeouts, MAXDWORD};

/// "A device attached to the system is not functioning."
pub const ERROR_GEN_FAILURE: u32 = 31;

/// A simulated serial device. Clones share the same wire.
#[derive(Clone)]
pub struct Loopback {
    wire: Arc<Wire>,
}

/// An open session on a [`Loopback`].
pub struct LoopbackHandle {
    wire: Arc<Wire>,
    session: u64,
    closed: AtomicBool,
}

/// Completion context of one loopback operation.
pub struct LoopbackOp {
    cell: Arc<OpCell>,
}

/// Keeps a completion observer registered with a [`LoopbackOp`].
pub struct LoopbackWatch {
    cell: Option<Arc<OpCell>>,
}

struct Wire {
    state: Mutex<WireState>,
    cond: Condvar,
}

struct WireState {
    echo: bool,
    attached: bool,
    session: u64,
    fail_open: Option<u32>,
    fail_io: Option<u32>,
    fail_completion: Option<u32>,
    clear_to_send: bool,
    timeouts: Timeouts,
    write_capacity: usize,
    rx: VecDeque<u8>,
    reads: VecDeque<PendingRead>,
    writes: VecDeque<PendingWrite>,
    submitted: usize,
}

struct OpCell {
    state: Mutex<OpState>,
    done: Condvar,
}

#[derive(Default)]
struct OpState {
    result: Option<Result<usize, u32>>,
    notify: Option<oneshot::Sender<()>>,
}

/// Region lent by the caller for the lifetime of an operation.
struct RawBuf {
    ptr: *mut u8,
    len: usize,
}

// The engine keeps the region alive and unaliased until the operation completes.
unsafe impl Send for RawBuf {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Immediate,
    Any,
    All,
}

struct PendingRead {
    op: Arc<OpCell>,
    buf: RawBuf,
    filled: usize,
    mode: ReadMode,
    deadline: Option<Instant>,
}

struct PendingWrite {
    op: Arc<OpCell>,
    buf: RawBuf,
}

impl Loopback {
    /// A device that echoes everything written to it.
    pub fn new() -> Loopback {
        Loopback::with_echo(true)
    }

    /// A device that accepts writes and never answers.
    pub fn sink() -> Loopback {
        Loopback::with_echo(false)
    }

    fn with_echo(echo: bool) -> Loopback {
        Loopback {
            wire: Arc::new(Wire {
                state: Mutex::new(WireState {
                    echo,
                    attached: false,
                    session: 0,
                    fail_open: None,
                    fail_io: None,
                    fail_completion: None,
                    clear_to_send: true,
                    timeouts: Timeouts::default(),
                    write_capacity: 0,
                    rx: VecDeque::new(),
                    reads: VecDeque::new(),
                    writes: VecDeque::new(),
                    submitted: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Delivers `bytes` as if the remote end had sent them.
    pub fn feed(&self, bytes: &[u8]) {
        let mut state = self.wire.state.lock();
        state.rx.extend(bytes);
        state.pump(Instant::now());
        self.wire.cond.notify_all();
    }

    /// Makes the next `open` fail with `code`.
    pub fn fail_next_open(&self, code: u32) {
        self.wire.state.lock().fail_open = Some(code);
    }

    /// Makes the next read or write submission fail with `code`.
    pub fn fail_next_io(&self, code: u32) {
        self.wire.state.lock().fail_io = Some(code);
    }

    /// Makes the next read or write that goes pending complete with `code`.
    pub fn fail_next_completion(&self, code: u32) {
        self.wire.state.lock().fail_completion = Some(code);
    }

    /// Raises or drops the clear-to-send line. While it is down, writes stay
    /// queued until they are cancelled or the line comes back.
    pub fn set_clear_to_send(&self, asserted: bool) {
        self.wire.state.lock().clear_to_send = asserted;
        self.wire.cond.notify_all();
    }

    /// Whether a session currently holds the device.
    pub fn is_attached(&self) -> bool {
        self.wire.state.lock().attached
    }

    /// Number of reads and writes submitted so far.
    pub fn submitted(&self) -> usize {
        self.wire.state.lock().submitted
    }

    /// Bytes received but not yet read.
    pub fn buffered(&self) -> usize {
        self.wire.state.lock().rx.len()
    }
}

impl Default for Loopback {
    fn default() -> Loopback {
        Loopback::new()
    }
}

impl Driver for Loopback {
    type Handle = LoopbackHandle;

    fn open(&self, path: &str, settings: &PortSettings) -> Result<LoopbackHandle, u32> {
        let mut state = self.wire.state.lock();
        if let Some(code) = state.fail_open.take() {
            return Err(code);
        }
        if state.attached {
            return Err(ERROR_ACCESS_DENIED);
        }
        if settings.baud_rate == 0 {
            return Err(ERROR_INVALID_PARAMETER);
        }

        state.timeouts = settings.timeouts();
        state.write_capacity = settings.write_buffer_size as usize;
        state.session += 1;

        let wire = self.wire.clone();
        let session = state.session;
        thread::Builder::new()
            .name(format!("loopback {}", path))
            .spawn(move || wire.service(session))
            .map_err(|_| ERROR_GEN_FAILURE)?;

        state.attached = true;
        trace!("loopback {} attached, session {}", path, session);
        Ok(LoopbackHandle {
            wire: self.wire.clone(),
            session,
            closed: AtomicBool::new(false),
        })
    }

    fn translate_error(&self, code: u32) -> String {
        match code {
            ERROR_ACCESS_DENIED => "Access is denied.".to_string(),
            ERROR_GEN_FAILURE => "A device attached to the system is not functioning.".to_string(),
            ERROR_INVALID_HANDLE => "The handle is invalid.".to_string(),
            ERROR_INVALID_PARAMETER => "The parameter is incorrect.".to_string(),
            ERROR_OPERATION_ABORTED => {
                "The I/O operation has been aborted because of either a thread exit or an application request.".to_string()
            }
            ERROR_IO_INCOMPLETE => "Overlapped I/O event is not in a signaled state.".to_string(),
            ERROR_IO_PENDING => "Overlapped I/O operation is in progress.".to_string(),
            ERROR_NOT_FOUND => "Element not found.".to_string(),
            code => format!("Unknown error ({})", code),
        }
    }
}

impl Wire {
    /// Completes queued writes and expires read deadlines until the session ends.
    fn service(&self, session: u64) {
        let mut state = self.state.lock();
        loop {
            if state.session != session {
                break;
            }
            if !state.attached && state.reads.is_empty() && state.writes.is_empty() {
                break;
            }

            while state.clear_to_send {
                let write = match state.writes.pop_front() {
                    Some(write) => write,
                    None => break,
                };
                let len = write.buf.len;
                state.deliver(&write.buf);
                write.op.complete(Ok(len));
            }
            state.pump(Instant::now());

            match state.reads.iter().filter_map(|read| read.deadline).min() {
                Some(deadline) => {
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

impl WireState {
    /// Copies written bytes onto the receive line.
    fn deliver(&mut self, buf: &RawBuf) {
        if self.echo && buf.len > 0 {
            let bytes = unsafe { std::slice::from_raw_parts(buf.ptr as *const u8, buf.len) };
            self.rx.extend(bytes);
        }
        self.pump(Instant::now());
    }

    /// Hands received bytes to pending reads and times out expired ones.
    fn pump(&mut self, now: Instant) {
        while let Some(read) = self.reads.front_mut() {
            let ready = match read.mode {
                ReadMode::Any => {
                    read.take(&mut self.rx);
                    read.filled > 0
                }
                ReadMode::Immediate => {
                    read.take(&mut self.rx);
                    true
                }
                ReadMode::All => {
                    read.take(&mut self.rx);
                    read.filled == read.buf.len
                }
            };
            if !ready {
                break;
            }
            if let Some(read) = self.reads.pop_front() {
                read.op.complete(Ok(read.filled));
            }
        }

        // An expired read reports whatever it has gathered, which is a success.
        self.reads.retain(|read| match read.deadline {
            Some(deadline) if deadline <= now => {
                read.op.complete(Ok(read.filled));
                false
            }
            _ => true,
        });
    }

    fn read_mode(&self, len: usize) -> (ReadMode, Option<Instant>) {
        let t = &self.timeouts;
        if t.read_interval == MAXDWORD && t.read_total_multiplier == 0 && t.read_total_constant == 0 {
            return (ReadMode::Immediate, None);
        }
        if t.read_interval == MAXDWORD && t.read_total_multiplier == MAXDWORD {
            let wait = Duration::from_millis(u64::from(t.read_total_constant));
            return (ReadMode::Any, Some(Instant::now() + wait));
        }
        let total = u64::from(t.read_total_multiplier) * len as u64 + u64::from(t.read_total_constant);
        let deadline = match total {
            0 => None,
            millis => Some(Instant::now() + Duration::from_millis(millis)),
        };
        (ReadMode::All, deadline)
    }

    /// Completes and removes the queued operation using `op`.
    fn cancel(&mut self, op: &Arc<OpCell>) -> bool {
        if let Some(pos) = self.reads.iter().position(|read| Arc::ptr_eq(&read.op, op)) {
            if let Some(read) = self.reads.remove(pos) {
                read.op.complete(Err(ERROR_OPERATION_ABORTED));
            }
            return true;
        }
        if let Some(pos) = self.writes.iter().position(|write| Arc::ptr_eq(&write.op, op)) {
            if let Some(write) = self.writes.remove(pos) {
                write.op.complete(Err(ERROR_OPERATION_ABORTED));
            }
            return true;
        }
        false
    }
}

impl PendingRead {
    fn take(&mut self, rx: &mut VecDeque<u8>) {
        let n = rx.len().min(self.buf.len - self.filled);
        if n == 0 {
            return;
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(self.buf.ptr.add(self.filled), n) };
        for (dst, src) in dst.iter_mut().zip(rx.drain(..n)) {
            *dst = src;
        }
        self.filled += n;
    }
}

impl OpCell {
    fn complete(&self, result: Result<usize, u32>) {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return;
        }
        state.result = Some(result);
        if let Some(notify) = state.notify.take() {
            let _ = notify.send(());
        }
        self.done.notify_all();
    }
}

impl Handle for LoopbackHandle {
    type Context = LoopbackOp;
    type Watch = LoopbackWatch;

    fn context(&self) -> Result<LoopbackOp, u32> {
        Ok(LoopbackOp {
            cell: Arc::new(OpCell {
                state: Mutex::new(OpState::default()),
                done: Condvar::new(),
            }),
        })
    }

    unsafe fn read_overlapped(
        &self,
        buf: *mut u8,
        len: usize,
        context: &LoopbackOp,
    ) -> Result<Submitted, u32> {
        let mut state = self.wire.state.lock();
        self.admit(&mut state, context)?;

        let (mode, deadline) = state.read_mode(len);
        let mut read = PendingRead {
            op: context.cell.clone(),
            buf: RawBuf { ptr: buf, len },
            filled: 0,
            mode,
            deadline,
        };

        if state.reads.is_empty() {
            read.take(&mut state.rx);
            let done = match mode {
                ReadMode::Immediate => true,
                ReadMode::Any => read.filled > 0 || len == 0,
                ReadMode::All => read.filled == len,
            };
            if done {
                context.cell.complete(Ok(read.filled));
                return Ok(Submitted::Complete(read.filled));
            }
        }

        if let Some(code) = state.fail_completion.take() {
            context.cell.complete(Err(code));
            return Ok(Submitted::Pending);
        }
        state.reads.push_back(read);
        self.wire.cond.notify_all();
        Ok(Submitted::Pending)
    }

    unsafe fn write_overlapped(
        &self,
        buf: *const u8,
        len: usize,
        context: &LoopbackOp,
    ) -> Result<Submitted, u32> {
        let mut state = self.wire.state.lock();
        self.admit(&mut state, context)?;

        let buf = RawBuf { ptr: buf as *mut u8, len };
        if state.clear_to_send && state.writes.is_empty() && len <= state.write_capacity {
            state.deliver(&buf);
            context.cell.complete(Ok(len));
            return Ok(Submitted::Complete(len));
        }

        if let Some(code) = state.fail_completion.take() {
            context.cell.complete(Err(code));
            return Ok(Submitted::Pending);
        }

        state.writes.push_back(PendingWrite { op: context.cell.clone(), buf });
        self.wire.cond.notify_all();
        Ok(Submitted::Pending)
    }

    fn overlapped_result(&self, context: &LoopbackOp) -> Result<usize, u32> {
        context.cell.state.lock().result.unwrap_or(Err(ERROR_IO_INCOMPLETE))
    }

    fn drain(&self, context: &LoopbackOp) -> Result<usize, u32> {
        let mut state = context.cell.state.lock();
        loop {
            if let Some(result) = state.result {
                return result;
            }
            // Everything queued was aborted on close; this one was never submitted.
            if self.closed.load(Ordering::Acquire) {
                return Err(ERROR_OPERATION_ABORTED);
            }
            context.cell.done.wait(&mut state);
        }
    }

    fn cancel(&self, context: &LoopbackOp) -> Result<(), u32> {
        let mut state = self.wire.state.lock();
        if !self.closed.load(Ordering::Acquire) && state.cancel(&context.cell) {
            Ok(())
        } else {
            Err(ERROR_NOT_FOUND)
        }
    }

    fn watch(&self, context: &LoopbackOp, notify: oneshot::Sender<()>) -> Result<LoopbackWatch, u32> {
        let mut state = context.cell.state.lock();
        if state.result.is_some() {
            let _ = notify.send(());
            return Ok(LoopbackWatch { cell: None });
        }
        state.notify = Some(notify);
        Ok(LoopbackWatch { cell: Some(context.cell.clone()) })
    }

    fn close(&self) {
        let mut state = self.wire.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Closing a device aborts whatever is still queued on it.
        for read in state.reads.drain(..) {
            read.op.complete(Err(ERROR_OPERATION_ABORTED));
        }
        for write in state.writes.drain(..) {
            write.op.complete(Err(ERROR_OPERATION_ABORTED));
        }
        if state.session == self.session {
            state.attached = false;
        }
        self.wire.cond.notify_all();
        trace!("loopback session {} closed", self.session);
    }
}

impl LoopbackHandle {
    /// Counts a submission and applies an injected submission failure.
    fn admit(&self, state: &mut WireState, context: &LoopbackOp) -> Result<(), u32> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ERROR_INVALID_HANDLE);
        }
        state.submitted += 1;
        if let Some(code) = state.fail_io.take() {
            context.cell.complete(Err(code));
            return Err(code);
        }
        Ok(())
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl Drop for LoopbackWatch {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.state.lock().notify = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TimeoutMode;

    fn open(driver: &Loopback, mode: TimeoutMode) -> LoopbackHandle {
        let settings = PortSettings::new(115_200)
            .with_buffer_sizes(64, 64)
            .with_timeout(mode, Duration::from_millis(50));
        driver.open("loop", &settings).unwrap()
    }

    #[test]
    fn echoes_small_writes_synchronously() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::Immediate);
        let op = handle.context().unwrap();
        let data = b"hello";

        let submitted = unsafe { handle.write_overlapped(data.as_ptr(), data.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Complete(5)));
        assert_eq!(driver.buffered(), 5);

        let op = handle.context().unwrap();
        let mut buf = [0u8; 8];
        let submitted = unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Complete(5)));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn immediate_read_returns_zero_without_data() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::Immediate);
        let op = handle.context().unwrap();
        let mut buf = [0u8; 8];

        let submitted = unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Complete(0)));
    }

    #[test]
    fn large_writes_complete_on_the_service_thread() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAny);
        let op = handle.context().unwrap();
        let data = vec![7u8; 65];

        let submitted = unsafe { handle.write_overlapped(data.as_ptr(), data.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Pending));
        assert_eq!(handle.drain(&op), Ok(65));
        assert_eq!(driver.buffered(), 65);
    }

    #[test]
    fn wait_all_times_out_with_partial_data() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAll);
        driver.feed(b"ab");

        let op = handle.context().unwrap();
        let mut buf = [0u8; 4];
        let submitted = unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Pending));
        assert_eq!(handle.drain(&op), Ok(2));
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn cancel_targets_one_operation() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAny);
        let first = handle.context().unwrap();
        let second = handle.context().unwrap();
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];

        unsafe {
            handle.read_overlapped(a.as_mut_ptr(), a.len(), &first).unwrap();
            handle.read_overlapped(b.as_mut_ptr(), b.len(), &second).unwrap();
        }
        assert_eq!(handle.cancel(&second), Ok(()));
        assert_eq!(handle.overlapped_result(&second), Err(ERROR_OPERATION_ABORTED));
        assert_eq!(handle.overlapped_result(&first), Err(ERROR_IO_INCOMPLETE));
        assert_eq!(handle.cancel(&second), Err(ERROR_NOT_FOUND));

        driver.feed(b"x");
        assert_eq!(handle.drain(&first), Ok(1));
    }

    #[test]
    fn open_is_exclusive_and_failures_are_injectable() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAny);
        assert_eq!(
            driver.open("loop", &PortSettings::default()).err(),
            Some(ERROR_ACCESS_DENIED)
        );
        drop(handle);
        assert!(!driver.is_attached());

        driver.fail_next_open(ERROR_GEN_FAILURE);
        assert_eq!(
            driver.open("loop", &PortSettings::default()).err(),
            Some(ERROR_GEN_FAILURE)
        );
        assert!(driver.open("loop", &PortSettings::default()).is_ok());
    }

    #[test]
    fn writes_wait_for_clear_to_send() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::Immediate);
        driver.set_clear_to_send(false);

        let op = handle.context().unwrap();
        let data = b"held";
        let submitted = unsafe { handle.write_overlapped(data.as_ptr(), data.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Pending));
        assert_eq!(handle.overlapped_result(&op), Err(ERROR_IO_INCOMPLETE));
        assert_eq!(driver.buffered(), 0);

        driver.set_clear_to_send(true);
        assert_eq!(handle.drain(&op), Ok(4));
        assert_eq!(driver.buffered(), 4);
    }

    #[test]
    fn injected_io_failures() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAny);
        let mut buf = [0u8; 4];

        driver.fail_next_io(ERROR_GEN_FAILURE);
        let op = handle.context().unwrap();
        let submitted = unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &op) };
        assert_eq!(submitted, Err(ERROR_GEN_FAILURE));
        assert_eq!(handle.drain(&op), Err(ERROR_GEN_FAILURE));

        driver.fail_next_completion(ERROR_GEN_FAILURE);
        let op = handle.context().unwrap();
        let submitted = unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &op) };
        assert_eq!(submitted, Ok(Submitted::Pending));
        assert_eq!(handle.overlapped_result(&op), Err(ERROR_GEN_FAILURE));
        assert_eq!(handle.cancel(&op), Err(ERROR_NOT_FOUND));
        assert_eq!(driver.submitted(), 2);
    }

    #[test]
    fn close_aborts_queued_operations_and_detaches() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAny);
        let queued = handle.context().unwrap();
        let idle = handle.context().unwrap();
        let mut buf = [0u8; 4];

        unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &queued) }.unwrap();
        handle.close();
        assert!(!driver.is_attached());
        assert_eq!(handle.drain(&queued), Err(ERROR_OPERATION_ABORTED));
        assert_eq!(handle.drain(&idle), Err(ERROR_OPERATION_ABORTED));
        assert_eq!(handle.cancel(&queued), Err(ERROR_NOT_FOUND));

        let submitted = unsafe { handle.read_overlapped(buf.as_mut_ptr(), buf.len(), &idle) };
        assert_eq!(submitted, Err(ERROR_INVALID_HANDLE));

        // A new session is not disturbed when the old handle finally goes away.
        let reopened = open(&driver, TimeoutMode::WaitAny);
        drop(handle);
        assert!(driver.is_attached());
        drop(reopened);
        assert!(!driver.is_attached());
    }

    #[test]
    fn queued_immediate_read_completes_with_what_arrived() {
        let driver = Loopback::new();
        let handle = open(&driver, TimeoutMode::WaitAny);
        let first = handle.context().unwrap();
        let second = handle.context().unwrap();
        let mut a = [0u8; 1];
        let mut b = [0u8; 4];

        unsafe { handle.read_overlapped(a.as_mut_ptr(), a.len(), &first) }.unwrap();
        driver.wire.state.lock().timeouts = PortSettings::default()
            .with_timeout(TimeoutMode::Immediate, Duration::from_millis(50))
            .timeouts();
        let submitted = unsafe { handle.read_overlapped(b.as_mut_ptr(), b.len(), &second) };
        assert_eq!(submitted, Ok(Submitted::Pending));

        driver.feed(b"xy");
        assert_eq!(handle.drain(&first), Ok(1));
        assert_eq!(handle.drain(&second), Ok(1));
        assert_eq!(&b[..1], b"y");
    }
}
