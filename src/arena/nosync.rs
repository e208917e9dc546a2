//! The single-threaded arena.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;

use slog::{debug, o, trace, warn, Discard, Logger};

use super::RawArena;
use crate::index::HandleIndex;
use crate::source::{BufferSource, HeapSource};
use crate::ArenaError;

/// Fixed-capacity slab arena assigning dense indices to fixed-size slots.
///
/// Not thread-safe; use [`super::SyncArena`] to share one arena between
/// threads. The handle width `I` bounds the capacity: a capacity of
/// `2^(W-1)` or more is refused so the top bit stays free for tagging.
/// One element size only, locked on the first allocation. The buffer is
/// acquired from the source on the first allocation for the whole
/// capacity at once and kept until [`Arena::free_memory`] or drop.
///
/// Freed slots are recycled through a free list written into the first
/// handle-width bytes of each free slot, which is why the element size
/// must be a multiple of the handle width.
///
/// When the live count returns to zero the arena resets itself: the free
/// list is discarded and the high-water mark rewinds, so a container that
/// was dropped wholesale leaves the arena ready to serve bump allocations
/// again. This is safe only while no stale handles are dereferenced
/// afterwards.
#[derive(Debug)]
pub struct Arena<I: HandleIndex, S: BufferSource = HeapSource> {
    source: RefCell<S>,
    base: Cell<*mut u8>,
    capacity: Cell<usize>,
    element_size: Cell<usize>,
    delete_enabled: Cell<bool>,
    free_head: Cell<I>,
    allocated_count: Cell<usize>,
    used_capacity: Cell<usize>,
    logger: Logger,
}

impl<I: HandleIndex, S: BufferSource + Default> Arena<I, S> {
    /// Create an arena with `capacity` slots, slot recycling enabled and a
    /// default-constructed source.
    pub fn new(capacity: usize) -> Result<Self, ArenaError> {
        Arena::with_source(capacity, true, S::default())
    }
}

impl<I: HandleIndex, S: BufferSource> Arena<I, S> {
    /// Create an arena with `capacity` slots backed by `source`.
    ///
    /// `delete_enabled` controls whether [`Arena::deallocate`] recycles
    /// slots, see [`Arena::enable_delete`].
    pub fn with_source(
        capacity: usize,
        delete_enabled: bool,
        source: S,
    ) -> Result<Self, ArenaError> {
        Arena::with_logger(capacity, delete_enabled, source, Logger::root(Discard, o!()))
    }

    /// Like [`Arena::with_source`], with lifecycle events logged to `logger`.
    pub fn with_logger(
        capacity: usize,
        delete_enabled: bool,
        source: S,
        logger: Logger,
    ) -> Result<Self, ArenaError> {
        let arena = Arena {
            source: RefCell::new(source),
            base: Cell::new(ptr::null_mut()),
            capacity: Cell::new(0),
            element_size: Cell::new(0),
            delete_enabled: Cell::new(delete_enabled),
            free_head: Cell::new(I::ZERO),
            allocated_count: Cell::new(0),
            used_capacity: Cell::new(0),
            logger,
        };
        arena.set_capacity(capacity)?;
        Ok(arena)
    }

    /// Slot capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// High-water mark of slots ever handed out.
    #[inline]
    pub fn used_capacity(&self) -> usize {
        self.used_capacity.get()
    }

    /// Number of live slots (allocated minus deallocated).
    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated_count.get()
    }

    /// Locked element size in bytes, or 0 before the first allocation.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size.get()
    }

    /// True when freed slots are recycled.
    #[inline]
    pub fn delete_is_enabled(&self) -> bool {
        self.delete_enabled.get()
    }

    /// Start of the buffer, or null before the first allocation.
    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.base.get()
    }

    /// One past the end of the buffer, or null before the first allocation.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        let base = self.base.get();
        if base.is_null() {
            return base;
        }
        unsafe { base.add(self.element_size.get() * self.capacity.get()) }
    }

    /// Enable or disable slot recycling.
    ///
    /// With recycling off, [`Arena::deallocate`] only maintains the live
    /// count; indices are never reused, allocation degenerates to a bump
    /// pointer and may need more capacity.
    pub fn enable_delete(&self, enable: bool) {
        self.delete_enabled.set(enable);
    }

    /// Change the capacity. Only possible while the buffer is not
    /// allocated, i.e. before the first allocation or after
    /// [`Arena::free_memory`].
    pub fn set_capacity(&self, capacity: usize) -> Result<(), ArenaError> {
        if capacity >= I::SIMPLE_CAPACITY_LIMIT {
            return Err(ArenaError::CapacityTooLarge {
                requested: capacity,
                limit: I::SIMPLE_CAPACITY_LIMIT,
            });
        }
        if !self.base.get().is_null() {
            return Err(ArenaError::AllocationInProgress);
        }
        self.capacity.set(capacity);
        Ok(())
    }

    /// Allocate one slot of `size` bytes.
    ///
    /// Pops the free list if possible, otherwise advances the high-water
    /// mark; fails with [`ArenaError::OutOfMemory`] when both are
    /// exhausted. The first successful call acquires the buffer and locks
    /// the element size, which must be a nonzero multiple of the handle
    /// width.
    pub fn allocate(&self, size: usize) -> Result<I, ArenaError> {
        debug_assert!(
            self.element_size.get() == size || self.element_size.get() == 0,
            "arena cannot serve mixed allocation sizes"
        );
        let head = self.free_head.get();
        let index = if head != I::ZERO {
            let slot = self.slot_ptr(head);
            self.free_head.set(unsafe { (slot as *const I).read() });
            head
        } else {
            if self.used_capacity.get() == self.capacity.get() {
                return Err(ArenaError::OutOfMemory);
            }
            if self.base.get().is_null() {
                self.acquire_buffer(size)?;
            }
            let next = self.used_capacity.get() + 1;
            self.used_capacity.set(next);
            I::from_usize(next)
        };
        self.allocated_count.set(self.allocated_count.get() + 1);
        Ok(index)
    }

    /// Return slot `index` to the arena.
    ///
    /// Brings the live count down; when it reaches zero the arena resets
    /// itself (see the type docs). Otherwise the slot is pushed onto the
    /// free list, unless recycling is disabled.
    pub fn deallocate(&self, index: I, size: usize) {
        debug_assert_eq!(size, self.element_size.get(), "deallocation size mismatch");
        debug_assert!(self.allocated_count.get() > 0);
        let live = self.allocated_count.get() - 1;
        self.allocated_count.set(live);
        if live == 0 {
            self.reset();
            return;
        }
        if self.delete_enabled.get() {
            let slot = self.slot_ptr(index);
            unsafe { (slot as *mut I).write(self.free_head.get()) };
            self.free_head.set(index);
        }
    }

    /// Address of slot `index`.
    #[inline]
    pub fn element(&self, index: I) -> *mut u8 {
        self.slot_ptr(index)
    }

    /// Index of the slot starting at `ptr`.
    ///
    /// `ptr` must point at the first byte of a slot; pointing inside a
    /// slot (e.g. at a field of the stored node) is a usage bug.
    pub fn index_of(&self, ptr: *const u8) -> I {
        let offset = ptr as usize - self.base.get() as usize;
        let element_size = self.element_size.get();
        let position = offset / element_size;
        debug_assert!(
            position * element_size == offset,
            "address points inside an allocated slot, not at its start"
        );
        I::from_usize(position + 1)
    }

    /// Return the arena to its post-construction state, keeping the buffer.
    ///
    /// Callers must guarantee there are no live slots, or that none of
    /// them will ever be used again.
    pub fn reset(&self) {
        if self.allocated_count.get() != 0 {
            warn!(
                self.logger, "arena reset with live objects";
                "allocated_count" => self.allocated_count.get(),
            );
        }
        trace!(self.logger, "arena reset"; "used_capacity" => self.used_capacity.get());
        self.free_head.set(I::ZERO);
        self.allocated_count.set(0);
        self.used_capacity.set(0);
    }

    /// Reset the arena and release its buffer. The element size unlocks;
    /// a later allocation acquires a fresh buffer.
    pub fn free_memory(&self) {
        self.reset();
        self.element_size.set(0);
        self.source.borrow_mut().release();
        self.base.set(ptr::null_mut());
        debug!(self.logger, "released arena buffer");
    }

    #[cold]
    fn acquire_buffer(&self, size: usize) -> Result<(), ArenaError> {
        debug_assert!(
            size > 0 && size % mem::size_of::<I>() == 0,
            "element size must be a nonzero multiple of the handle width"
        );
        let bytes = size
            .checked_mul(self.capacity.get())
            .ok_or(ArenaError::OutOfMemory)?;
        let mut source = self.source.borrow_mut();
        source.acquire(bytes)?;
        debug_assert!(
            source.base() as usize % mem::size_of::<I>() == 0,
            "buffer is not aligned for the free-list link words"
        );
        self.base.set(source.base());
        self.element_size.set(size);
        debug!(
            self.logger, "acquired arena buffer";
            "bytes" => bytes,
            "capacity" => self.capacity.get(),
            "element_size" => size,
        );
        Ok(())
    }

    #[inline]
    fn slot_ptr(&self, index: I) -> *mut u8 {
        debug_assert!(
            index != I::ZERO && index.as_usize() <= self.used_capacity.get(),
            "handle does not name a live arena slot"
        );
        unsafe {
            self.base
                .get()
                .add(self.element_size.get() * (index.as_usize() - 1))
        }
    }
}

impl<I: HandleIndex, S: BufferSource> RawArena for Arena<I, S> {
    type Index = I;

    const IS_SYNC: bool = false;

    #[inline]
    fn allocate(&self, size: usize) -> Result<I, ArenaError> {
        Arena::allocate(self, size)
    }
    #[inline]
    fn deallocate(&self, index: I, size: usize) {
        Arena::deallocate(self, index, size)
    }
    #[inline]
    fn element(&self, index: I) -> *mut u8 {
        Arena::element(self, index)
    }
    #[inline]
    fn index_of(&self, ptr: *const u8) -> I {
        Arena::index_of(self, ptr)
    }
    #[inline]
    fn begin(&self) -> *mut u8 {
        Arena::begin(self)
    }
    #[inline]
    fn end(&self) -> *mut u8 {
        Arena::end(self)
    }
    #[inline]
    fn capacity(&self) -> usize {
        Arena::capacity(self)
    }
    #[inline]
    fn element_size(&self) -> usize {
        Arena::element_size(self)
    }
}

impl<I: HandleIndex, S: BufferSource> Drop for Arena<I, S> {
    fn drop(&mut self) {
        if self.allocated_count.get() != 0 {
            warn!(
                self.logger, "arena dropped with live objects";
                "allocated_count" => self.allocated_count.get(),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    type TestArena = Arena<u32>;

    #[test]
    fn recycles_through_free_list() {
        let arena = TestArena::new(10).unwrap();
        let a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        let c = arena.allocate(8).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        arena.deallocate(b, 8);
        // The freed slot comes back before the high-water mark moves.
        assert_eq!(arena.allocate(8).unwrap(), 2);
        assert_eq!(arena.allocated_count(), 3);
        assert_eq!(arena.used_capacity(), 3);
    }

    #[test]
    fn element_round_trip() {
        let arena = TestArena::new(4).unwrap();
        let index = arena.allocate(16).unwrap();
        let ptr = arena.element(index);
        assert_eq!(arena.index_of(ptr), index);
        assert_eq!(ptr, arena.begin());
        assert!(arena.end() as usize - arena.begin() as usize == 16 * 4);
    }

    #[test]
    fn auto_reset_on_zero_live() {
        let arena = TestArena::new(4).unwrap();
        let handles: Vec<_> = (0..3).map(|_| arena.allocate(8).unwrap()).collect();
        assert_eq!(arena.used_capacity(), 3);
        for index in handles {
            arena.deallocate(index, 8);
        }
        assert_eq!(arena.used_capacity(), 0);
        assert_eq!(arena.allocate(8).unwrap(), 1);
    }

    #[test]
    fn delete_disabled_burns_capacity() {
        let arena: TestArena = Arena::with_source(4, false, HeapSource::new()).unwrap();
        let handles: Vec<_> = (0..4).map(|_| arena.allocate(8).unwrap()).collect();
        arena.deallocate(handles[1], 8);
        // Freed slot is not recycled and capacity is spent.
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
        assert_eq!(arena.used_capacity(), 4);
        // Keep the live count accurate for drop.
        for index in [handles[0], handles[2], handles[3]] {
            arena.deallocate(index, 8);
        }
    }

    #[test]
    fn capacity_exhaustion() {
        let arena = TestArena::new(2).unwrap();
        arena.allocate(4).unwrap();
        arena.allocate(4).unwrap();
        assert_eq!(arena.allocate(4), Err(ArenaError::OutOfMemory));
        arena.deallocate(1, 4);
        assert_eq!(arena.allocate(4).unwrap(), 1);
    }

    #[test]
    fn capacity_too_large_is_refused() {
        assert_eq!(
            Arena::<u16>::new(1 << 15).unwrap_err(),
            ArenaError::CapacityTooLarge {
                requested: 1 << 15,
                limit: 1 << 15,
            }
        );
        assert!(Arena::<u16>::new((1 << 15) - 1).is_ok());
    }

    #[test]
    fn set_capacity_locked_while_allocated() {
        let arena = TestArena::new(4).unwrap();
        let index = arena.allocate(8).unwrap();
        assert_eq!(
            arena.set_capacity(8),
            Err(ArenaError::AllocationInProgress)
        );
        arena.deallocate(index, 8);
        // Live count hit zero and auto-reset ran, but the buffer is kept.
        assert_eq!(
            arena.set_capacity(8),
            Err(ArenaError::AllocationInProgress)
        );
        arena.free_memory();
        arena.set_capacity(8).unwrap();
        assert_eq!(arena.capacity(), 8);
    }

    #[test]
    fn free_memory_unlocks_element_size() {
        let arena = TestArena::new(4).unwrap();
        arena.allocate(8).unwrap();
        assert_eq!(arena.element_size(), 8);
        arena.deallocate(1, 8);
        arena.free_memory();
        assert_eq!(arena.element_size(), 0);
        // A different element size is accepted after the buffer is gone.
        arena.allocate(16).unwrap();
        assert_eq!(arena.element_size(), 16);
        arena.deallocate(1, 16);
    }
}
