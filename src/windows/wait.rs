//! Thread-pool waits on completion events.
//!
//! `RegisterWaitForSingleObject` parks the wait with the system thread pool,
//! which multiplexes many waits onto few threads, and runs a callback when the
//! event is signalled.

use std::ffi::c_void;
use std::ptr;

use futures::channel::oneshot;
use parking_lot::Mutex;

use windows_sys::Win32::Foundation::{GetLastError, BOOLEAN, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Threading::{
    RegisterWaitForSingleObject, UnregisterWaitEx, INFINITE, WT_EXECUTEONLYONCE,
};

type Slot = Mutex<Option<oneshot::Sender<()>>>;

/// A registered wait. Dropping it unregisters the wait and blocks until a
/// callback that is already running has returned.
pub struct Wait {
    handle: HANDLE,
    slot: *mut Slot,
}

// The slot is only touched by the callback and by drop, which waits for the callback.
unsafe impl Send for Wait {}

impl Wait {
    pub(crate) fn register(event: HANDLE, notify: oneshot::Sender<()>) -> Result<Wait, u32> {
        let slot: *mut Slot = Box::into_raw(Box::new(Mutex::new(Some(notify))));
        let mut handle: HANDLE = ptr::null_mut();
        let ok = unsafe {
            RegisterWaitForSingleObject(
                &mut handle,
                event,
                Some(signalled),
                slot as *const c_void,
                INFINITE,
                WT_EXECUTEONLYONCE,
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            drop(unsafe { Box::from_raw(slot) });
            return Err(code);
        }
        Ok(Wait { handle, slot })
    }
}

unsafe extern "system" fn signalled(context: *mut c_void, _timed_out: BOOLEAN) {
    let slot = &*(context as *const Slot);
    if let Some(notify) = slot.lock().take() {
        let _ = notify.send(());
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        unsafe {
            UnregisterWaitEx(self.handle, INVALID_HANDLE_VALUE);
            drop(Box::from_raw(self.slot));
        }
    }
}
