//! Windows COM ports over overlapped I/O.
#![cfg(windows)]

mod serial;
mod wait;

pub use self::serial::{ComDriver, ComHandle, OverlappedContext};
pub use self::wait::Wait;

/// A serial port on a Windows COM device.
pub type ComPort = crate::SerialPort<ComDriver>;
