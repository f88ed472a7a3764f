//! Fallible, page-aligned I/O buffers
//!
//! Cache-bypassing handles (`O_DIRECT`, `FILE_FLAG_NO_BUFFERING`) reject
//! buffers that are not aligned to the device sector size, so every block
//! buffer handed to a channel is aligned to a page. Allocation never aborts
//! the process: failure is reported as [`AllocError`] and turned into an
//! insufficient-memory trial state by the caller.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use rand::RngCore;

/// Alignment of block buffers, large enough for every common sector size
pub const BUFFER_ALIGNMENT: usize = 4096;

/// A buffer of the requested size could not be allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unable to allocate {requested} bytes")]
pub struct AllocError {
    pub requested: u64,
}

/// Heap buffer aligned to [`BUFFER_ALIGNMENT`]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer exclusively owns its allocation
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zero-filled buffer of `len` bytes
    pub fn zeroed(len: u64) -> Result<Self, AllocError> {
        let err = AllocError { requested: len };
        let size = usize::try_from(len).map_err(|_| err)?;
        let layout = Layout::from_size_align(size.max(1), BUFFER_ALIGNMENT).map_err(|_| err)?;

        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(err)?;
        Ok(Self {
            ptr,
            len: size,
            layout,
        })
    }

    /// Allocate a buffer of `len` pseudo-random bytes
    pub fn random<R: RngCore + ?Sized>(len: u64, rng: &mut R) -> Result<Self, AllocError> {
        let mut buffer = Self::zeroed(len)?;
        rng.fill_bytes(&mut buffer);
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

/// Allocate a zero-filled `Vec` without aborting on failure.
///
/// The zeros are written eagerly so the pages are resident once this
/// returns.
pub fn try_alloc_vec(len: u64) -> Result<Vec<u8>, AllocError> {
    let err = AllocError { requested: len };
    let size = usize::try_from(len).map_err(|_| err)?;
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| err)?;
    data.resize(size, 0);
    Ok(data)
}
