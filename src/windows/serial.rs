//! COM port driver.

use std::cell::UnsafeCell;
use std::ffi::{c_void, OsStr};
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use futures::channel::oneshot;
use log::trace;
use parking_lot::Mutex;
use serialport::{Parity, StopBits};

use windows_sys::Win32::Devices::Communication::{
    GetCommState, PurgeComm, SetCommState, SetCommTimeouts, SetupComm, COMMTIMEOUTS, DCB,
    EVENPARITY, NOPARITY, ODDPARITY, ONESTOPBIT, PURGE_RXCLEAR, PURGE_TXCLEAR, TWOSTOPBITS,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::CreateEventW;

use crate::device::{
    Driver, Handle, Submitted, ERROR_INVALID_HANDLE, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING,
    ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED,
};
use crate::settings::PortSettings;
use crate::windows::wait::Wait;

// fBinary and fParity bits of `DCB::_bitfield`
const DCB_BINARY: u32 = 0x0001;
const DCB_PARITY: u32 = 0x0002;

fn last_error() -> u32 {
    unsafe { GetLastError() }
}

/// Opens COM ports with `CreateFileW` in overlapped mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComDriver;

/// An open COM port. The raw handle is null once closed.
pub struct ComHandle {
    raw: AtomicPtr<c_void>,
}

/// The `OVERLAPPED` block and manual-reset event of one operation.
pub struct OverlappedContext {
    overlapped: UnsafeCell<OVERLAPPED>,
    event: HANDLE,
    /// Final result, kept so it can still be read after the port is closed.
    outcome: Mutex<Option<Result<usize, u32>>>,
}

// `overlapped` is written by the kernel only while the operation is in flight,
// during which the engine never touches it.
unsafe impl Send for OverlappedContext {}
unsafe impl Sync for OverlappedContext {}

impl Driver for ComDriver {
    type Handle = ComHandle;

    fn open(&self, path: &str, settings: &PortSettings) -> Result<ComHandle, u32> {
        let name = device_name(path);
        let wide: Vec<u16> = OsStr::new(&name).encode_wide().chain(Some(0)).collect();

        let raw = unsafe {
            CreateFileW(
                wide.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if raw == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }

        // From here on dropping `handle` closes the device again.
        let handle = ComHandle {
            raw: AtomicPtr::new(raw),
        };
        configure(&handle, settings)?;
        trace!("opened {}", name);
        Ok(handle)
    }

    fn translate_error(&self, code: u32) -> String {
        io::Error::from_raw_os_error(code as i32).to_string()
    }
}

/// Win32 device namespace path, so `COM10` and above open too.
fn device_name(path: &str) -> String {
    if path.starts_with(r"\\.\") {
        path.to_string()
    } else {
        format!(r"\\.\{}", path)
    }
}

/// Applies queue sizes, line settings and timeouts to an open device.
fn configure(handle: &ComHandle, settings: &PortSettings) -> Result<(), u32> {
    let raw = handle.raw();
    unsafe {
        if SetupComm(raw, settings.read_buffer_size, settings.write_buffer_size) == 0 {
            return Err(last_error());
        }

        let mut dcb: DCB = mem::zeroed();
        dcb.DCBlength = mem::size_of::<DCB>() as u32;
        if GetCommState(raw, &mut dcb) == 0 {
            return Err(last_error());
        }

        dcb.BaudRate = settings.baud_rate;
        dcb.ByteSize = settings.byte_size();
        dcb.Parity = match settings.parity {
            Parity::None => NOPARITY,
            Parity::Odd => ODDPARITY,
            Parity::Even => EVENPARITY,
        };
        dcb.StopBits = match settings.stop_bits {
            StopBits::One => ONESTOPBIT,
            StopBits::Two => TWOSTOPBITS,
        };
        dcb._bitfield |= DCB_BINARY;
        if settings.parity == Parity::None {
            dcb._bitfield &= !DCB_PARITY;
        } else {
            dcb._bitfield |= DCB_PARITY;
        }
        if SetCommState(raw, &dcb) == 0 {
            return Err(last_error());
        }

        let t = settings.timeouts();
        let timeouts = COMMTIMEOUTS {
            ReadIntervalTimeout: t.read_interval,
            ReadTotalTimeoutMultiplier: t.read_total_multiplier,
            ReadTotalTimeoutConstant: t.read_total_constant,
            WriteTotalTimeoutMultiplier: t.write_total_multiplier,
            WriteTotalTimeoutConstant: t.write_total_constant,
        };
        if SetCommTimeouts(raw, &timeouts) == 0 {
            return Err(last_error());
        }

        if PurgeComm(raw, PURGE_TXCLEAR | PURGE_RXCLEAR) == 0 {
            return Err(last_error());
        }
    }
    Ok(())
}

impl Handle for ComHandle {
    type Context = OverlappedContext;
    type Watch = Wait;

    fn context(&self) -> Result<OverlappedContext, u32> {
        // Manual reset, so a completion that happens before anyone waits is kept.
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() {
            return Err(last_error());
        }
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = event;
        Ok(OverlappedContext {
            overlapped: UnsafeCell::new(overlapped),
            event,
            outcome: Mutex::new(None),
        })
    }

    unsafe fn read_overlapped(
        &self,
        buf: *mut u8,
        len: usize,
        context: &OverlappedContext,
    ) -> Result<Submitted, u32> {
        // A short read is fine for a byte stream.
        let raw = self.raw();
        if raw.is_null() {
            return Err(ERROR_INVALID_HANDLE);
        }
        let len = len.min(u32::MAX as usize) as u32;
        let mut transferred = 0;
        if ReadFile(raw, buf, len, &mut transferred, context.overlapped.get()) != 0 {
            return Ok(Submitted::Complete(transferred as usize));
        }
        match last_error() {
            ERROR_IO_PENDING => Ok(Submitted::Pending),
            code => Err(code),
        }
    }

    unsafe fn write_overlapped(
        &self,
        buf: *const u8,
        len: usize,
        context: &OverlappedContext,
    ) -> Result<Submitted, u32> {
        let raw = self.raw();
        if raw.is_null() {
            return Err(ERROR_INVALID_HANDLE);
        }
        let len = len.min(u32::MAX as usize) as u32;
        let mut transferred = 0;
        if WriteFile(raw, buf, len, &mut transferred, context.overlapped.get()) != 0 {
            return Ok(Submitted::Complete(transferred as usize));
        }
        match last_error() {
            ERROR_IO_PENDING => Ok(Submitted::Pending),
            code => Err(code),
        }
    }

    fn overlapped_result(&self, context: &OverlappedContext) -> Result<usize, u32> {
        self.result(context, false)
    }

    fn drain(&self, context: &OverlappedContext) -> Result<usize, u32> {
        self.result(context, true)
    }

    fn cancel(&self, context: &OverlappedContext) -> Result<(), u32> {
        let raw = self.raw();
        if raw.is_null() {
            return Err(ERROR_NOT_FOUND);
        }
        if unsafe { CancelIoEx(raw, context.overlapped.get()) } == 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn watch(&self, context: &OverlappedContext, notify: oneshot::Sender<()>) -> Result<Wait, u32> {
        Wait::register(context.event, notify)
    }

    fn close(&self) {
        let raw = self.raw.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            unsafe {
                CloseHandle(raw);
            }
        }
    }
}

impl ComHandle {
    fn raw(&self) -> HANDLE {
        self.raw.load(Ordering::Acquire)
    }

    fn result(&self, context: &OverlappedContext, wait: bool) -> Result<usize, u32> {
        let mut outcome = context.outcome.lock();
        if let Some(result) = *outcome {
            return result;
        }
        let raw = self.raw();
        if raw.is_null() {
            return Err(ERROR_OPERATION_ABORTED);
        }

        let mut transferred = 0;
        let ok = unsafe {
            GetOverlappedResult(raw, context.overlapped.get(), &mut transferred, wait as i32)
        };
        let result = if ok == 0 {
            Err(last_error())
        } else {
            Ok(transferred as usize)
        };
        if result != Err(ERROR_IO_INCOMPLETE) {
            *outcome = Some(result);
        }
        result
    }
}

impl Drop for ComHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl Drop for OverlappedContext {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.event);
        }
    }
}
