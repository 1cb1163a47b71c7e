//! Port configuration and the timeout block derived from it.

use std::time::Duration;

use serialport::{DataBits, Parity, StopBits};

/// The all-ones `DWORD` the device layer treats as "no limit".
pub const MAXDWORD: u32 = u32::MAX;

/// How reads wait for data. Fixed for the lifetime of an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutMode {
    /// Return whatever is already buffered, possibly nothing, without waiting.
    Immediate,
    /// Wait until at least one byte has arrived, then return what is buffered.
    #[default]
    WaitAny,
    /// Wait until the requested count arrived or the configured timeout elapsed.
    WaitAll,
}

/// Device-level read/write timeouts, in the layout the device driver consumes.
///
/// All values are milliseconds, `MAXDWORD` has the special meanings documented
/// on [`TimeoutMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    /// Maximum gap between two received bytes.
    pub read_interval: u32,
    /// Per-byte component of the total read timeout.
    pub read_total_multiplier: u32,
    /// Constant component of the total read timeout.
    pub read_total_constant: u32,
    /// Per-byte component of the total write timeout.
    pub write_total_multiplier: u32,
    /// Constant component of the total write timeout.
    pub write_total_constant: u32,
}

/// Settings applied to the device when the port is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    /// Line speed in bits per second.
    pub baud_rate: u32,
    /// Number of bits per character.
    pub data_bits: DataBits,
    /// Parity checking mode.
    pub parity: Parity,
    /// Number of stop bits.
    pub stop_bits: StopBits,
    /// Size of the driver's input queue in bytes.
    pub read_buffer_size: u32,
    /// Size of the driver's output queue in bytes.
    pub write_buffer_size: u32,
    /// Total read timeout used by [`TimeoutMode::WaitAll`].
    pub timeout: Duration,
    /// How reads wait for data.
    pub timeout_mode: TimeoutMode,
}

impl Default for PortSettings {
    fn default() -> PortSettings {
        PortSettings {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            timeout: Duration::from_secs(1),
            timeout_mode: TimeoutMode::WaitAny,
        }
    }
}

impl PortSettings {
    /// Default 8N1 settings at the given baud rate.
    pub fn new(baud_rate: u32) -> PortSettings {
        PortSettings { baud_rate, ..PortSettings::default() }
    }

    /// Sets the character size.
    pub fn with_data_bits(mut self, data_bits: DataBits) -> PortSettings {
        self.data_bits = data_bits;
        self
    }

    /// Sets the parity mode.
    pub fn with_parity(mut self, parity: Parity) -> PortSettings {
        self.parity = parity;
        self
    }

    /// Sets the number of stop bits.
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> PortSettings {
        self.stop_bits = stop_bits;
        self
    }

    /// Sets the driver's input and output queue sizes.
    pub fn with_buffer_sizes(mut self, read: u32, write: u32) -> PortSettings {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }

    /// Sets the timeout mode and the `WaitAll` timeout.
    pub fn with_timeout(mut self, mode: TimeoutMode, timeout: Duration) -> PortSettings {
        self.timeout_mode = mode;
        self.timeout = timeout;
        self
    }

    /// Character size as the device control block expects it.
    pub fn byte_size(&self) -> u8 {
        match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }

    /// Timeout block for the configured [`TimeoutMode`].
    ///
    /// | mode        | no data        | some data          | all data  |
    /// |-------------|----------------|--------------------|-----------|
    /// | `Immediate` | returns 0      | returns at once    | at once   |
    /// | `WaitAny`   | waits          | returns at once    | at once   |
    /// | `WaitAll`   | waits `timeout`| waits `timeout`    | at once   |
    pub fn timeouts(&self) -> Timeouts {
        match self.timeout_mode {
            TimeoutMode::Immediate => Timeouts {
                read_interval: MAXDWORD,
                ..Timeouts::default()
            },
            TimeoutMode::WaitAny => Timeouts {
                read_interval: MAXDWORD,
                read_total_multiplier: MAXDWORD,
                read_total_constant: MAXDWORD - 1,
                ..Timeouts::default()
            },
            TimeoutMode::WaitAll => {
                // 0 would mean "wait forever", MAXDWORD is reserved.
                let millis = self.timeout.as_millis().clamp(1, u128::from(MAXDWORD - 1));
                Timeouts {
                    read_total_constant: millis as u32,
                    ..Timeouts::default()
                }
            }
        }
    }
}
