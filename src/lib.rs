//! # overlapped-serial - Cancellable async serial port I/O
//!
//! This crate exposes a serial device as an asynchronous byte stream built on
//! overlapped I/O: every read and write is submitted to the driver, completes
//! either synchronously or later through a completion event, and can be
//! cancelled individually or all at once by closing the port.
//!
//! Buffers are passed by value and handed back with the result, so the
//! device can never be left holding memory that was already freed.
//!
//! **The device driver is only implemented for Windows.** The [`loopback`]
//! module provides an in-memory device that runs everywhere.
//!
//! ```no_run
//! # async fn demo() -> overlapped_serial::Result<()> {
//! use overlapped_serial::{PortSettings, SerialPort, TimeoutMode};
//! use overlapped_serial::loopback::Loopback;
//!
//! let port = SerialPort::new(Loopback::new(), "loop", PortSettings::new(115_200));
//! port.open()?;
//! let (written, _) = port.write(b"AT+TEST\r\n", 0, 9, None).await;
//! let (read, buf) = port.read(vec![0u8; 1024], 0, 1024, None).await;
//! println!("{:?}", &buf[..read?]);
//! # let _ = (written, TimeoutMode::WaitAny);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

mod buf;
mod completion;
pub mod device;
mod error;
pub mod loopback;
mod op;
mod port;
mod registry;
mod settings;

#[cfg(windows)]
pub mod windows;

// Enums from the serialport crate
pub use serialport::{DataBits, Parity, StopBits};

pub use buf::{IoBuf, IoBufMut};
pub use error::{BufResult, Error, Result};
pub use port::SerialPort;
pub use settings::{PortSettings, TimeoutMode, Timeouts, MAXDWORD};

#[cfg(windows)]
pub use windows::{ComDriver, ComPort};
