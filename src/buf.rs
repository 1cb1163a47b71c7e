//! Owned buffers that can be lent to the device for the length of an operation.
//!
//! Overlapped I/O hands a raw pointer to the operating system, which keeps
//! using it after the submitting call returns. A borrowed slice cannot promise
//! that: the future borrowing it could be forgotten while the device still
//! writes into it. Read and write therefore take the buffer by value and keep
//! it inside the (pinned) operation future until the device has let go of it,
//! handing it back together with the result.

/// A buffer the device may read from for the duration of an operation.
///
/// # Safety
///
/// The region returned by `as_ref` must stay valid and must not move for as
/// long as the value itself is neither moved nor dropped. This holds for any
/// owned `'static` type, which is the only blanket implementation provided.
pub unsafe trait IoBuf: Send + 'static {
    /// Start of the region.
    fn stable_ptr(&self) -> *const u8;

    /// Length of the region in bytes.
    fn bytes_total(&self) -> usize;
}

unsafe impl<T: AsRef<[u8]> + Send + 'static> IoBuf for T {
    fn stable_ptr(&self) -> *const u8 {
        self.as_ref().as_ptr()
    }

    fn bytes_total(&self) -> usize {
        self.as_ref().len()
    }
}

/// A buffer the device may write into for the duration of an operation.
///
/// # Safety
///
/// Same contract as [`IoBuf`], for the region returned by `as_mut`.
pub unsafe trait IoBufMut: IoBuf {
    /// Start of the writable region.
    fn stable_mut_ptr(&mut self) -> *mut u8;
}

unsafe impl<T: AsRef<[u8]> + AsMut<[u8]> + Send + 'static> IoBufMut for T {
    fn stable_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut().as_mut_ptr()
    }
}

/// Checks that `offset..offset + count` lies within a buffer of `len` bytes.
pub(crate) fn check_range(len: usize, offset: usize, count: usize) -> crate::Result<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(crate::Error::InvalidArgument("offset and count exceed the buffer")),
    }
}
