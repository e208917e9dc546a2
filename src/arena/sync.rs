//! The thread-safe arena.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use slog::{debug, o, trace, warn, Discard, Logger};

use super::RawArena;
use crate::index::{AtomicInt, HandleIndex};
use crate::source::{BufferSource, HeapSource};
use crate::ArenaError;

/// Lock-free LIFO of free slots with an ABA-proof tagged head.
///
/// The head is a double-width word `(stamp, handle)`. Every successful
/// push or pop bumps the stamp, so a CAS that raced against a
/// pop-pop-push of the same slot sees a stamp mismatch and retries
/// instead of corrupting the list.
///
/// Link words live in the first handle-width bytes of each free slot and
/// are read and written through per-slot atomics: a pop may load the
/// successor of a slot that a racing thread has already repurposed, and
/// the load must stay well-defined even though its value is then
/// discarded by the failing CAS.
struct TaggedFreeList<I: HandleIndex> {
    head: I::DoubleAtomic,
}

impl<I: HandleIndex> TaggedFreeList<I> {
    fn new() -> Self {
        TaggedFreeList {
            head: I::DoubleAtomic::default(),
        }
    }

    fn clear(&mut self) {
        *self.head.get_mut() = I::Double::default();
    }

    /// Push slot `index`, whose memory starts at `slot`.
    fn push(&self, index: I, slot: *mut u8) {
        let link = unsafe { &*(slot as *const I::Atomic) };
        let mut observed = self.head.load(Ordering::Acquire);
        loop {
            link.store(I::unpack_handle(observed), Ordering::Relaxed);
            let replacement = I::pack(I::unpack_stamp(observed).bump(), index);
            match self.head.compare_exchange(
                observed,
                replacement,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Pop the top slot, or return null when the list is empty.
    /// `resolve` maps an index to its slot address.
    fn pop(&self, resolve: impl Fn(I) -> *mut u8) -> I {
        let mut observed = self.head.load(Ordering::Acquire);
        loop {
            let top = I::unpack_handle(observed);
            if top == I::ZERO {
                return I::ZERO;
            }
            let link = unsafe { &*(resolve(top) as *const I::Atomic) };
            let successor = link.load(Ordering::Relaxed);
            let replacement = I::pack(I::unpack_stamp(observed).bump(), successor);
            match self.head.compare_exchange(
                observed,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return top,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Walk the list. Only meaningful while no other thread touches the
    /// arena.
    fn len(&self, resolve: impl Fn(I) -> *mut u8) -> usize {
        let mut length = 0;
        let mut next = I::unpack_handle(self.head.load(Ordering::Acquire));
        while next != I::ZERO {
            length += 1;
            let link = unsafe { &*(resolve(next) as *const I::Atomic) };
            next = link.load(Ordering::Relaxed);
        }
        length
    }
}

/// Thread-safe version of [`super::Arena`]: same contract, safe under
/// concurrent `allocate`/`deallocate` from any number of threads.
///
/// Differences from the single-threaded arena:
///
/// * the high-water mark is an atomic counter, advanced by fetch-add and
///   rolled back on overflow;
/// * the free list is lock-free with an ABA-defeating stamp in its head
///   word;
/// * buffer acquisition is serialized by a one-shot critical section that
///   latches failure, so once the source has refused memory every thread
///   fails fast without hammering it again;
/// * there is no live-object counter and therefore no auto-reset when a
///   container is dropped wholesale — counting would put another
///   contended atomic on the hot path. Call [`SyncArena::reset`] from a
///   quiescent point instead.
///
/// Methods that require external quiescence take `&mut self`.
///
/// The arena avoids fences on the element-access path: it assumes the
/// first use of a handle on thread B happens after the allocating thread
/// A's `allocate` has synchronized with B through whatever channel
/// published the handle. Containers that publish nodes through their own
/// synchronized state satisfy this for free.
pub struct SyncArena<I: HandleIndex, S: BufferSource = HeapSource> {
    source: Mutex<S>,
    base: AtomicPtr<u8>,
    capacity: usize,
    element_size: AtomicUsize,
    delete_enabled: AtomicBool,
    alloc_error: AtomicBool,
    free_list: CachePadded<TaggedFreeList<I>>,
    used_capacity: CachePadded<I::Atomic>,
    logger: Logger,
}

impl<I: HandleIndex, S: BufferSource + Default> SyncArena<I, S> {
    /// Create an arena with `capacity` slots, slot recycling enabled and a
    /// default-constructed source.
    pub fn new(capacity: usize) -> Result<Self, ArenaError> {
        SyncArena::with_source(capacity, true, S::default())
    }
}

impl<I: HandleIndex, S: BufferSource> SyncArena<I, S> {
    /// Create an arena with `capacity` slots backed by `source`.
    pub fn with_source(
        capacity: usize,
        delete_enabled: bool,
        source: S,
    ) -> Result<Self, ArenaError> {
        SyncArena::with_logger(capacity, delete_enabled, source, Logger::root(Discard, o!()))
    }

    /// Like [`SyncArena::with_source`], with lifecycle events logged to
    /// `logger`.
    pub fn with_logger(
        capacity: usize,
        delete_enabled: bool,
        source: S,
        logger: Logger,
    ) -> Result<Self, ArenaError> {
        let mut arena = SyncArena {
            source: Mutex::new(source),
            base: AtomicPtr::new(ptr::null_mut()),
            capacity: 0,
            element_size: AtomicUsize::new(0),
            delete_enabled: AtomicBool::new(delete_enabled),
            alloc_error: AtomicBool::new(false),
            free_list: CachePadded::new(TaggedFreeList::new()),
            used_capacity: CachePadded::new(I::Atomic::default()),
            logger,
        };
        arena.set_capacity(capacity)?;
        Ok(arena)
    }

    /// Slot capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// High-water mark of slots ever handed out. Racy by nature; exact
    /// only at quiescence.
    #[inline]
    pub fn used_capacity(&self) -> usize {
        self.used_capacity.load(Ordering::Relaxed).as_usize()
    }

    /// Locked element size in bytes, or 0 before the first allocation.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size.load(Ordering::Relaxed)
    }

    /// True when freed slots are recycled.
    #[inline]
    pub fn delete_is_enabled(&self) -> bool {
        self.delete_enabled.load(Ordering::Relaxed)
    }

    /// Start of the buffer, or null before the first allocation.
    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.base.load(Ordering::Relaxed)
    }

    /// One past the end of the buffer, or null before the first allocation.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        let base = self.begin();
        if base.is_null() {
            return base;
        }
        unsafe { base.add(self.element_size() * self.capacity) }
    }

    /// Enable or disable slot recycling (see [`super::Arena::enable_delete`]).
    pub fn enable_delete(&self, enable: bool) {
        self.delete_enabled.store(enable, Ordering::Relaxed);
    }

    /// Number of slots currently parked on the free list.
    ///
    /// Walks the list, so this is only meaningful while no other thread
    /// is using the arena.
    pub fn free_list_len(&self) -> usize {
        self.free_list.len(|index| self.slot_ptr(index))
    }

    /// Change the capacity. Only possible while the buffer is not
    /// allocated. Requires external quiescence, which the exclusive
    /// borrow enforces.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), ArenaError> {
        if capacity >= I::SIMPLE_CAPACITY_LIMIT {
            return Err(ArenaError::CapacityTooLarge {
                requested: capacity,
                limit: I::SIMPLE_CAPACITY_LIMIT,
            });
        }
        if !self.base.get_mut().is_null() {
            return Err(ArenaError::AllocationInProgress);
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Allocate one slot of `size` bytes. Safe to call from any thread.
    ///
    /// Tries the free list first, then advances the high-water mark,
    /// rolling the counter back when it overshoots the capacity. The
    /// first successful call acquires the buffer inside a one-shot
    /// critical section.
    pub fn allocate(&self, size: usize) -> Result<I, ArenaError> {
        debug_assert!(
            self.element_size() == size || self.element_size() == 0,
            "arena cannot serve mixed allocation sizes"
        );
        let recycled = self.free_list.pop(|index| self.slot_ptr(index));
        if recycled != I::ZERO {
            return Ok(recycled);
        }
        let one = I::from_usize(1);
        let claimed = self
            .used_capacity
            .fetch_add(one, Ordering::Relaxed)
            .as_usize()
            + 1;
        if claimed > self.capacity {
            self.used_capacity.fetch_sub(one, Ordering::Relaxed);
            return Err(ArenaError::OutOfMemory);
        }
        if self.begin().is_null() {
            if let Err(error) = self.acquire_buffer(size) {
                self.used_capacity.fetch_sub(one, Ordering::Relaxed);
                return Err(error);
            }
        }
        Ok(I::from_usize(claimed))
    }

    /// Return slot `index` to the arena. Safe to call from any thread.
    /// No-op when recycling is disabled.
    pub fn deallocate(&self, index: I, size: usize) {
        debug_assert_eq!(size, self.element_size(), "deallocation size mismatch");
        if self.delete_is_enabled() {
            self.free_list.push(index, self.slot_ptr(index));
        }
    }

    /// Address of slot `index`.
    #[inline]
    pub fn element(&self, index: I) -> *mut u8 {
        self.slot_ptr(index)
    }

    /// Index of the slot starting at `ptr` (see [`super::Arena::index_of`]).
    pub fn index_of(&self, ptr: *const u8) -> I {
        let offset = ptr as usize - self.begin() as usize;
        let element_size = self.element_size();
        let position = offset / element_size;
        debug_assert!(
            position * element_size == offset,
            "address points inside an allocated slot, not at its start"
        );
        I::from_usize(position + 1)
    }

    /// Return the arena to its post-construction state, keeping the
    /// buffer. Requires external quiescence, which the exclusive borrow
    /// enforces; the caller must also guarantee no live slots remain.
    pub fn reset(&mut self) {
        let used = self.used_capacity.load(Ordering::Relaxed).as_usize();
        if used != self.free_list_len() {
            warn!(
                self.logger, "arena reset with live objects";
                "used_capacity" => used,
                "free" => self.free_list_len(),
            );
        }
        trace!(self.logger, "arena reset"; "used_capacity" => used);
        self.free_list.clear();
        *self.used_capacity.get_mut() = I::ZERO;
    }

    /// Reset the arena and release its buffer, clearing any latched
    /// buffer-acquisition failure. Requires external quiescence.
    pub fn free_memory(&mut self) {
        self.reset();
        *self.element_size.get_mut() = 0;
        *self.alloc_error.get_mut() = false;
        self.source.get_mut().release();
        *self.base.get_mut() = ptr::null_mut();
        debug!(self.logger, "released arena buffer");
    }

    /// One-shot buffer acquisition. Whichever thread gets here first does
    /// the work under the lock; latecomers observe either the published
    /// base or the latched failure.
    #[cold]
    fn acquire_buffer(&self, size: usize) -> Result<(), ArenaError> {
        let mut source = self.source.lock();
        if self.alloc_error.load(Ordering::Relaxed) {
            return Err(ArenaError::OutOfMemory);
        }
        if !self.base.load(Ordering::Relaxed).is_null() {
            return Ok(());
        }
        debug_assert!(
            size > 0 && size % mem::size_of::<I>() == 0,
            "element size must be a nonzero multiple of the handle width"
        );
        let bytes = match size.checked_mul(self.capacity) {
            Some(bytes) => bytes,
            None => {
                self.alloc_error.store(true, Ordering::Relaxed);
                return Err(ArenaError::OutOfMemory);
            }
        };
        if let Err(error) = source.acquire(bytes) {
            self.alloc_error.store(true, Ordering::Relaxed);
            warn!(self.logger, "arena buffer acquisition failed"; "bytes" => bytes);
            return Err(error);
        }
        debug_assert!(
            source.base() as usize % mem::size_of::<I>() == 0,
            "buffer is not aligned for the free-list link words"
        );
        self.element_size.store(size, Ordering::Release);
        self.base.store(source.base(), Ordering::Release);
        debug!(
            self.logger, "acquired arena buffer";
            "bytes" => bytes,
            "capacity" => self.capacity,
            "element_size" => size,
        );
        Ok(())
    }

    #[inline]
    fn slot_ptr(&self, index: I) -> *mut u8 {
        debug_assert!(
            index != I::ZERO && index.as_usize() <= self.used_capacity(),
            "handle does not name a live arena slot"
        );
        unsafe { self.begin().add(self.element_size() * (index.as_usize() - 1)) }
    }
}

impl<I: HandleIndex, S: BufferSource> RawArena for SyncArena<I, S> {
    type Index = I;

    const IS_SYNC: bool = true;

    #[inline]
    fn allocate(&self, size: usize) -> Result<I, ArenaError> {
        SyncArena::allocate(self, size)
    }
    #[inline]
    fn deallocate(&self, index: I, size: usize) {
        SyncArena::deallocate(self, index, size)
    }
    #[inline]
    fn element(&self, index: I) -> *mut u8 {
        SyncArena::element(self, index)
    }
    #[inline]
    fn index_of(&self, ptr: *const u8) -> I {
        SyncArena::index_of(self, ptr)
    }
    #[inline]
    fn begin(&self) -> *mut u8 {
        SyncArena::begin(self)
    }
    #[inline]
    fn end(&self) -> *mut u8 {
        SyncArena::end(self)
    }
    #[inline]
    fn capacity(&self) -> usize {
        SyncArena::capacity(self)
    }
    #[inline]
    fn element_size(&self) -> usize {
        SyncArena::element_size(self)
    }
}

impl<I: HandleIndex, S: BufferSource> Drop for SyncArena<I, S> {
    fn drop(&mut self) {
        let used = self.used_capacity.load(Ordering::Relaxed).as_usize();
        if used != self.free_list_len() {
            warn!(
                self.logger, "arena dropped with live objects";
                "used_capacity" => used,
                "free" => self.free_list_len(),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    type TestArena = SyncArena<u32>;

    #[test]
    fn single_thread_contract_matches_nosync() {
        let arena = TestArena::new(10).unwrap();
        let a = arena.allocate(8).unwrap();
        let b = arena.allocate(8).unwrap();
        let c = arena.allocate(8).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        arena.deallocate(b, 8);
        assert_eq!(arena.free_list_len(), 1);
        assert_eq!(arena.allocate(8).unwrap(), 2);
        assert_eq!(arena.used_capacity(), 3);

        for index in [a, b, c] {
            arena.deallocate(index, 8);
        }
        assert_eq!(arena.free_list_len(), 3);
    }

    #[test]
    fn no_auto_reset() {
        let mut arena = TestArena::new(4).unwrap();
        let index = arena.allocate(8).unwrap();
        arena.deallocate(index, 8);
        // Unlike the single-threaded arena the high-water mark stays put;
        // the slot comes back through the free list instead.
        assert_eq!(arena.used_capacity(), 1);
        assert_eq!(arena.allocate(8).unwrap(), index);
        arena.deallocate(index, 8);
        arena.reset();
        assert_eq!(arena.used_capacity(), 0);
        assert_eq!(arena.allocate(8).unwrap(), 1);
        arena.deallocate(1, 8);
    }

    #[test]
    fn delete_disabled_is_noop() {
        let arena: TestArena = SyncArena::with_source(2, false, HeapSource::new()).unwrap();
        let index = arena.allocate(8).unwrap();
        arena.deallocate(index, 8);
        assert_eq!(arena.free_list_len(), 0);
        arena.allocate(8).unwrap();
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
    }

    #[test]
    fn overshoot_rolls_back() {
        let arena = TestArena::new(1).unwrap();
        arena.allocate(8).unwrap();
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
        // The failed attempts must not have leaked high-water slots.
        assert_eq!(arena.used_capacity(), 1);
        arena.deallocate(1, 8);
        assert_eq!(arena.allocate(8).unwrap(), 1);
        arena.deallocate(1, 8);
    }

    #[test]
    fn sticky_source_failure() {
        let mut backing = [0u64; 2];
        let source = crate::source::FixedSource::new(
            std::ptr::NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap(),
            16,
        );
        // Needs 8 * 4 = 32 bytes, the region only has 16.
        let arena: SyncArena<u32, _> = SyncArena::with_source(4, true, source).unwrap();
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
        // The failure latched: later attempts fail without touching the
        // source, and the high-water mark is rolled back every time.
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
        assert_eq!(arena.used_capacity(), 0);
    }

    #[test]
    fn free_memory_clears_latched_failure() {
        let mut backing = [0u64; 2];
        let source = crate::source::FixedSource::new(
            std::ptr::NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap(),
            16,
        );
        let mut arena: SyncArena<u32, _> = SyncArena::with_source(4, true, source).unwrap();
        assert_eq!(arena.allocate(8), Err(ArenaError::OutOfMemory));
        arena.free_memory();
        arena.set_capacity(2).unwrap();
        // 8 * 2 = 16 bytes now fits.
        assert_eq!(arena.allocate(8).unwrap(), 1);
        arena.deallocate(1, 8);
    }

    #[test]
    fn concurrent_churn_yields_unique_handles() {
        use std::sync::Arc;

        const THREADS: usize = 4;
        const CYCLES: usize = 10_000;

        let arena = Arc::new(SyncArena::<u32>::new(THREADS * 2).unwrap());
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    for _ in 0..CYCLES {
                        let index = arena.allocate(8).unwrap();
                        assert!(index >= 1 && index as usize <= THREADS * 2);
                        arena.deallocate(index, 8);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let arena = Arc::try_unwrap(arena).ok().unwrap();
        // Quiescent accounting: everything allocated was pushed back.
        assert_eq!(arena.free_list_len(), arena.used_capacity());
    }
}
