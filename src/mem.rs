//! Aligned buffer allocation and provider memory registration.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use rdma_sys::*;

use crate::error::{Error, ErrorKind, Result};

/// Cache-line alignment for internally allocated transfer buffers.
pub(crate) const BUFFER_ALIGNMENT: usize = 64;

/// Owned, 64-byte-aligned heap allocation backing an internal buffer pool
/// entry. Contents are intentionally left uninitialized, as the provider or
/// the application fills them before they are read.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The allocation is uniquely owned and only handed out as raw pointers under
// the owning queue's discipline.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), BUFFER_ALIGNMENT)
            .map_err(|_| Error::new(ErrorKind::InvalidSize))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| Error::new(ErrorKind::OutOfMemory))?;
        Ok(AlignedBuf { ptr, layout })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Registration token placed into work requests.
pub(crate) type MrToken = *mut ibv_mr;

/// Scoped registration of a contiguous buffer with a connection's protection
/// domain. The registration must outlive every work request that names its
/// token; the owning queue guarantees that by dropping regions only after
/// all of its buffers are quiesced.
pub(crate) struct MemoryRegion {
    mr: MrToken,
}

// The raw registration handle is only deregistered once, on drop.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Register `len` bytes at `addr` against the connection's protection
    /// domain with local-write access (all that message send/recv needs).
    ///
    /// # Safety
    ///
    /// `id` must be a valid CM identifier with a protection domain, and
    /// `addr..addr+len` must stay valid for the lifetime of the region.
    pub unsafe fn register(id: *mut rdma_cm_id, addr: *mut u8, len: usize) -> Result<Self> {
        let pd = (*id).pd;
        if pd.is_null() {
            return Err(Error::new(ErrorKind::NotConnected));
        }
        // SAFETY: FFI; pd checked non-null.
        let mr = ibv_reg_mr(
            pd,
            addr as *mut libc::c_void,
            len,
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as i32,
        );
        if mr.is_null() {
            return Err(Error::from_os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0)));
        }
        Ok(MemoryRegion { mr })
    }

    /// A region with no provider registration. Used by the mock endpoint in
    /// queue tests; its token is null and must never reach a real provider.
    #[cfg(test)]
    pub fn unregistered() -> Self {
        MemoryRegion {
            mr: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn token(&self) -> MrToken {
        self.mr
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if !self.mr.is_null() {
            // SAFETY: registered once in `register`, deregistered only here.
            unsafe { ibv_dereg_mr(self.mr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_allocation() {
        let buf = AlignedBuf::new(4096).unwrap();
        assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGNMENT, 0);
        // Must be writable across the whole span.
        unsafe {
            std::ptr::write_bytes(buf.as_ptr(), 0xA5, 4096);
            assert_eq!(*buf.as_ptr().add(4095), 0xA5);
        }
    }

    #[test]
    fn zero_size_rounds_up() {
        let buf = AlignedBuf::new(0).unwrap();
        assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGNMENT, 0);
    }
}
