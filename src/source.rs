//! Where an arena's buffer comes from.
//!
//! An arena owns exactly one [`BufferSource`] and asks it for a single
//! contiguous region on the first allocation. The region lives until
//! `free_memory` (or the arena itself) drops it.

use std::alloc::Layout;
use std::ptr::{self, NonNull};

use crate::ArenaError;

/// Alignment every source guarantees for the region it returns.
///
/// Matches the strictest fundamental alignment; node types with larger
/// alignment requirements are not supported by the arenas.
pub const BUFFER_ALIGN: usize = 16;

/// A provider of one contiguous byte region.
pub trait BufferSource {
    /// Obtain a region of at least `bytes` bytes.
    ///
    /// Fails with [`ArenaError::OutOfMemory`] when the region cannot be
    /// provided. Must only be called while no region is held.
    fn acquire(&mut self, bytes: usize) -> Result<(), ArenaError>;

    /// Start of the held region, or null if none is held.
    fn base(&self) -> *mut u8;

    /// Drop the held region. No-op when none is held.
    fn release(&mut self);
}

/// Buffer source backed by the global allocator.
#[derive(Debug)]
pub struct HeapSource {
    block: *mut u8,
    bytes: usize,
}

impl Default for HeapSource {
    fn default() -> Self {
        HeapSource::new()
    }
}

impl HeapSource {
    /// A source that has not acquired anything yet.
    pub fn new() -> Self {
        HeapSource {
            block: ptr::null_mut(),
            bytes: 0,
        }
    }

    fn layout(bytes: usize) -> Layout {
        // Only called for sizes that were validated in acquire.
        debug_assert!(bytes > 0);
        Layout::from_size_align(bytes, BUFFER_ALIGN).expect("layout fit at acquisition time")
    }
}

impl BufferSource for HeapSource {
    fn acquire(&mut self, bytes: usize) -> Result<(), ArenaError> {
        debug_assert!(self.block.is_null(), "buffer already acquired");
        let layout =
            Layout::from_size_align(bytes, BUFFER_ALIGN).map_err(|_| ArenaError::OutOfMemory)?;
        let block = unsafe { std::alloc::alloc(layout) };
        if block.is_null() {
            return Err(ArenaError::OutOfMemory);
        }
        self.block = block;
        self.bytes = bytes;
        Ok(())
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.block
    }

    fn release(&mut self) {
        if !self.block.is_null() {
            unsafe { std::alloc::dealloc(self.block, Self::layout(self.bytes)) };
            self.block = ptr::null_mut();
            self.bytes = 0;
        }
    }
}

impl Drop for HeapSource {
    fn drop(&mut self) {
        self.release();
    }
}

// The block is owned: only this source ever frees it, and the arena
// serializes all access to the slots carved out of it.
unsafe impl Send for HeapSource {}
unsafe impl Sync for HeapSource {}

/// Buffer source over a caller-provided region.
///
/// `acquire` fails with [`ArenaError::OutOfMemory`] when the request
/// exceeds the region. The caller keeps ownership of the memory and must
/// keep it alive (and untouched) for as long as the arena uses it. The
/// region must be aligned for the node type stored in it — an arena slot
/// holds either a node or a handle-width free-list link, so a plain byte
/// array is usually not aligned enough; use an array of a wider type.
pub struct FixedSource {
    region: NonNull<u8>,
    len: usize,
    held: bool,
}

impl FixedSource {
    /// Wrap the `len` bytes starting at `region`.
    pub fn new(region: NonNull<u8>, len: usize) -> Self {
        FixedSource {
            region,
            len,
            held: false,
        }
    }

    /// Wrap a mutable byte slice. The slice contents are treated as
    /// uninitialized scratch space; the region must stay valid for the
    /// lifetime of the arena using this source.
    pub fn from_slice(region: &mut [u8]) -> Self {
        let ptr = unsafe { NonNull::new_unchecked(region.as_mut_ptr()) };
        FixedSource::new(ptr, region.len())
    }

    /// Size of the wrapped region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the wrapped region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl BufferSource for FixedSource {
    fn acquire(&mut self, bytes: usize) -> Result<(), ArenaError> {
        debug_assert!(!self.held, "buffer already acquired");
        if bytes > self.len {
            return Err(ArenaError::OutOfMemory);
        }
        self.held = true;
        Ok(())
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        if self.held {
            self.region.as_ptr()
        } else {
            ptr::null_mut()
        }
    }

    fn release(&mut self) {
        self.held = false;
    }
}

// Safe to move across threads as long as the caller upholds the liveness
// contract from the constructor; the arena never aliases the region with
// anything else.
unsafe impl Send for FixedSource {}
unsafe impl Sync for FixedSource {}

/// Buffer source backed by an anonymous memory mapping, in page granularity.
#[cfg(feature = "mmap")]
pub struct MmapSource {
    mapping: Option<memmap2::MmapMut>,
}

#[cfg(feature = "mmap")]
impl MmapSource {
    /// A source that has not mapped anything yet.
    pub fn new() -> Self {
        MmapSource { mapping: None }
    }

    #[cfg(unix)]
    fn page_size() -> usize {
        use once_cell::sync::OnceCell;
        static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
        *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
    }

    #[cfg(not(unix))]
    fn page_size() -> usize {
        4096
    }
}

#[cfg(feature = "mmap")]
impl Default for MmapSource {
    fn default() -> Self {
        MmapSource::new()
    }
}

#[cfg(feature = "mmap")]
impl BufferSource for MmapSource {
    fn acquire(&mut self, bytes: usize) -> Result<(), ArenaError> {
        debug_assert!(self.mapping.is_none(), "buffer already acquired");
        let page = Self::page_size();
        let rounded = bytes
            .checked_add(page - 1)
            .ok_or(ArenaError::OutOfMemory)?
            / page
            * page;
        let mapping = memmap2::MmapMut::map_anon(rounded).map_err(|_| ArenaError::OutOfMemory)?;
        self.mapping = Some(mapping);
        Ok(())
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        match &self.mapping {
            Some(mapping) => mapping.as_ptr() as *mut u8,
            None => ptr::null_mut(),
        }
    }

    fn release(&mut self) {
        self.mapping = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_acquire_release() {
        let mut source = HeapSource::new();
        assert!(source.base().is_null());
        source.acquire(4096).unwrap();
        assert!(!source.base().is_null());
        assert_eq!(source.base() as usize % BUFFER_ALIGN, 0);
        source.release();
        assert!(source.base().is_null());
        // Release again is a no-op.
        source.release();
    }

    #[test]
    fn fixed_rejects_oversized_request() {
        let mut backing = [0u8; 64];
        let mut source = FixedSource::from_slice(&mut backing);
        assert_eq!(source.acquire(65), Err(ArenaError::OutOfMemory));
        assert!(source.base().is_null());
        source.acquire(64).unwrap();
        assert!(!source.base().is_null());
    }

    #[cfg(feature = "mmap")]
    #[test]
    fn mmap_rounds_to_pages() {
        let mut source = MmapSource::new();
        source.acquire(10).unwrap();
        assert!(!source.base().is_null());
        source.release();
        assert!(source.base().is_null());
    }
}
