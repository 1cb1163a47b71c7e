//! Port lifecycle: configuration, open, close and operation cancellation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use serialport::{DataBits, Parity, StopBits};
use tokio_util::sync::CancellationToken;

use crate::device::{Driver, Handle, ERROR_NOT_FOUND};
use crate::registry::{Registry, Token};
use crate::settings::{PortSettings, TimeoutMode};
use crate::{Error, Result};

pub(crate) const CLOSED: &str = "port is closed";
const OPEN: &str = "port is open";

/// A serial port driven through overlapped I/O.
///
/// The port starts closed. While closed its settings may be changed; while
/// open, reads and writes may be issued concurrently from any number of tasks
/// through a shared reference. Dropping the port closes it.
pub struct SerialPort<D: Driver> {
    driver: D,
    path: String,
    pub(crate) state: Mutex<State<D::Handle>>,
}

/// Everything guarded by the port lock.
///
/// The handle and the registry share one lock so that checking "still open",
/// registering an operation and submitting it happen as a single step.
pub(crate) struct State<H: Handle> {
    pub(crate) handle: Option<Arc<H>>,
    pub(crate) settings: PortSettings,
    pub(crate) ops: Registry<H>,
    /// Cancelled when the current session is closed.
    pub(crate) session: CancellationToken,
}

impl<H: Handle> State<H> {
    /// Whether `handle` is the handle of the session that is open right now.
    pub(crate) fn is_current(&self, handle: &Arc<H>) -> bool {
        self.handle.as_ref().is_some_and(|open| Arc::ptr_eq(open, handle))
    }
}

impl<D: Driver> SerialPort<D> {
    /// Creates a closed port for the device at `path`.
    pub fn new<P: Into<String>>(driver: D, path: P, settings: PortSettings) -> SerialPort<D> {
        SerialPort {
            driver,
            path: path.into(),
            state: Mutex::new(State {
                handle: None,
                settings,
                ops: Registry::new(),
                session: CancellationToken::new(),
            }),
        }
    }

    /// The device path this port opens.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The driver this port opens its device with.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Returns `true` between a successful [`open`](Self::open) and the next
    /// [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Number of operations the device has not finished yet.
    pub fn pending_operations(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// Opens and configures the device.
    ///
    /// On failure the port stays closed and nothing is left acquired.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.handle.is_some() {
            return Err(Error::InvalidState("port is already open"));
        }

        let handle = self
            .driver
            .open(&self.path, &state.settings)
            .map_err(|code| self.device_error(code))?;

        state.handle = Some(Arc::new(handle));
        state.session = CancellationToken::new();
        debug!(
            "opened {} at {} baud, {:?}",
            self.path, state.settings.baud_rate, state.settings.timeout_mode
        );
        Ok(())
    }

    /// Closes the port, cancelling every operation still in flight.
    ///
    /// Closing a closed port does nothing. Otherwise this blocks until the
    /// device has acknowledged each cancellation, then releases the device, so
    /// the port can be opened again right away. The cancelled operations
    /// resolve with [`Error::Cancelled`], or with the result the device had
    /// already produced, the next time they are polled.
    pub fn close(&self) {
        let (handle, outstanding) = {
            let mut state = self.state.lock();
            let handle = match state.handle.take() {
                Some(handle) => handle,
                None => return,
            };

            state.session.cancel();
            let outstanding = state.ops.take_all();
            for (token, entry) in &outstanding {
                match entry.handle.cancel(&*entry.context) {
                    Ok(()) | Err(ERROR_NOT_FOUND) => {}
                    Err(code) => warn!(
                        "failed to cancel operation {} on close: {}",
                        token,
                        self.driver.translate_error(code)
                    ),
                }
            }
            (handle, outstanding)
        };

        // The device may write into the buffers of cancelled operations until
        // it reports them finished.
        for (token, entry) in &outstanding {
            if let Err(code) = entry.handle.drain(&*entry.context) {
                trace!("operation {} ended with error {} on close", token, code);
            }
        }
        handle.close();
        debug!("closed {}, cancelled {} operations", self.path, outstanding.len());
    }

    /// A copy of the current settings.
    pub fn settings(&self) -> PortSettings {
        self.state.lock().settings.clone()
    }

    /// Replaces all settings. Fails while the port is open.
    pub fn set_settings(&self, settings: PortSettings) -> Result<()> {
        self.configure(|current| *current = settings)
    }

    /// Sets the baud rate. Fails while the port is open.
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.configure(|settings| settings.baud_rate = baud_rate)
    }

    /// Sets the character size. Fails while the port is open.
    pub fn set_data_bits(&self, data_bits: DataBits) -> Result<()> {
        self.configure(|settings| settings.data_bits = data_bits)
    }

    /// Sets the parity mode. Fails while the port is open.
    pub fn set_parity(&self, parity: Parity) -> Result<()> {
        self.configure(|settings| settings.parity = parity)
    }

    /// Sets the number of stop bits. Fails while the port is open.
    pub fn set_stop_bits(&self, stop_bits: StopBits) -> Result<()> {
        self.configure(|settings| settings.stop_bits = stop_bits)
    }

    /// Sets the driver queue sizes. Fails while the port is open.
    pub fn set_buffer_sizes(&self, read: u32, write: u32) -> Result<()> {
        self.configure(|settings| {
            settings.read_buffer_size = read;
            settings.write_buffer_size = write;
        })
    }

    /// Sets the `WaitAll` read timeout. Fails while the port is open.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.configure(|settings| settings.timeout = timeout)
    }

    /// Sets the timeout mode. Fails while the port is open.
    pub fn set_timeout_mode(&self, mode: TimeoutMode) -> Result<()> {
        self.configure(|settings| settings.timeout_mode = mode)
    }

    fn configure<F: FnOnce(&mut PortSettings)>(&self, f: F) -> Result<()> {
        let mut state = self.state.lock();
        if state.handle.is_some() {
            return Err(Error::InvalidState(OPEN));
        }
        f(&mut state.settings);
        Ok(())
    }

    /// The handle of the open session.
    pub(crate) fn handle(&self) -> Result<Arc<D::Handle>> {
        self.state.lock().handle.clone().ok_or(Error::InvalidState(CLOSED))
    }

    /// Asks the device to cancel the one operation registered under `token`.
    ///
    /// An operation that already left the registry, or that the device already
    /// finished, is not an error.
    pub(crate) fn cancel_operation(&self, token: Token) {
        let state = self.state.lock();
        let entry = match state.ops.get(token) {
            Some(entry) => entry,
            None => {
                trace!("operation {} already retired", token);
                return;
            }
        };
        match entry.handle.cancel(&*entry.context) {
            Ok(()) => trace!("cancel requested for operation {}", token),
            Err(ERROR_NOT_FOUND) => trace!("operation {} finished before it could be cancelled", token),
            Err(code) => warn!(
                "failed to cancel operation {}: {}",
                token,
                self.driver.translate_error(code)
            ),
        }
    }

    pub(crate) fn device_error(&self, code: u32) -> Error {
        Error::Device {
            code,
            message: self.driver.translate_error(code),
        }
    }
}

impl<D: Driver> Drop for SerialPort<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Driver> fmt::Debug for SerialPort<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}
