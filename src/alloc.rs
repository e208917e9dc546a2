//! The node allocator presented to host containers.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::arena::RawArena;
use crate::config::{ConfigArena, HandleConfig};
use crate::handle::Handle;
use crate::ArenaError;

/// A single-slot node allocator over an arena + config pair.
///
/// This is what a host container binds to: every node allocation turns
/// into one arena slot and comes back as a [`Handle`]. Array allocations
/// are not supported — a hash container's bucket array goes through
/// [`HandleAllocator::array_allocator`] instead, because bucket arrays
/// are resized wholesale and cannot live in fixed-size slots.
///
/// When the config's `ASSIGN_CONTAINER_TO_ALLOCATOR` policy is on, the
/// allocator registers its own address as the container base on
/// construction, clone and assignment. This matches containers that
/// embed their allocator (and their sentinel node) in their own object;
/// such containers must not move while nodes are live. Intrusive
/// containers keep the policy off and call
/// [`HandleConfig::set_container`] themselves.
///
/// Two allocators are equal iff they reference the same arena.
pub struct HandleAllocator<T, C: HandleConfig> {
    arena: NonNull<ConfigArena<C>>,
    _marker: PhantomData<(*mut T, fn() -> C)>,
}

impl<T, C: HandleConfig> std::fmt::Debug for HandleAllocator<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleAllocator")
            .field("arena", &self.arena)
            .finish()
    }
}

impl<T, C: HandleConfig> HandleAllocator<T, C> {
    /// Bind to the arena currently registered in the config's context.
    ///
    /// The context must already hold an arena.
    pub fn new() -> Self {
        let arena = C::arena();
        debug_assert!(!arena.is_null(), "no arena registered in the context");
        let allocator = HandleAllocator {
            arena: unsafe { NonNull::new_unchecked(arena) },
            _marker: PhantomData,
        };
        allocator.assign_container();
        allocator
    }

    /// Bind to a specific arena.
    ///
    /// The arena must outlive the allocator and every handle it mints.
    pub fn with_arena(arena: &ConfigArena<C>) -> Self {
        HandleAllocator {
            arena: NonNull::from(arena),
            _marker: PhantomData,
        }
    }

    /// Allocate one slot and return its handle.
    pub fn allocate(&self) -> Result<Handle<T, C>, ArenaError> {
        let index = self.arena_ref().allocate(mem::size_of::<T>())?;
        Ok(Handle::from_raw(index))
    }

    /// Return one slot to the arena.
    pub fn deallocate(&self, handle: Handle<T, C>) {
        self.arena_ref().deallocate(handle.raw(), mem::size_of::<T>());
    }

    /// The same allocator viewed at another node type.
    pub fn rebind<U>(&self) -> HandleAllocator<U, C> {
        let rebound = HandleAllocator {
            arena: self.arena,
            _marker: PhantomData,
        };
        rebound.assign_container();
        rebound
    }

    /// The heap allocator host containers use for bucket arrays.
    pub fn array_allocator(&self) -> C::ArrayAlloc {
        C::ArrayAlloc::default()
    }

    /// The arena this allocator draws from.
    #[inline]
    pub fn arena(&self) -> &ConfigArena<C> {
        self.arena_ref()
    }

    #[inline]
    fn arena_ref(&self) -> &ConfigArena<C> {
        unsafe { self.arena.as_ref() }
    }

    #[inline]
    fn assign_container(&self) {
        if C::ASSIGN_CONTAINER_TO_ALLOCATOR {
            C::set_container(self as *const Self as *mut u8);
        }
    }
}

impl<T, C: HandleConfig> Default for HandleAllocator<T, C> {
    fn default() -> Self {
        HandleAllocator::new()
    }
}

impl<T, C: HandleConfig> Clone for HandleAllocator<T, C> {
    fn clone(&self) -> Self {
        let cloned = HandleAllocator {
            arena: self.arena,
            _marker: PhantomData,
        };
        cloned.assign_container();
        cloned
    }

    fn clone_from(&mut self, source: &Self) {
        self.arena = source.arena;
        self.assign_container();
    }
}

impl<T, C: HandleConfig> PartialEq for HandleAllocator<T, C> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.arena == other.arena
    }
}
impl<T, C: HandleConfig> Eq for HandleAllocator<T, C> {}

/// Raw array allocator over the global heap.
///
/// The escape hatch for allocations the slab cannot serve: bucket arrays
/// of hash containers, which are resized wholesale. Hands out
/// uninitialized memory addressed by real pointers, not handles.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct HeapArrayAlloc;

impl HeapArrayAlloc {
    /// Allocate an uninitialized array of `len` elements.
    pub fn allocate<T>(&self, len: usize) -> Result<NonNull<T>, ArenaError> {
        let layout = Layout::array::<T>(len).map_err(|_| ArenaError::OutOfMemory)?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        NonNull::new(unsafe { std::alloc::alloc(layout) })
            .map(NonNull::cast)
            .ok_or(ArenaError::OutOfMemory)
    }

    /// Free an array previously returned by [`HeapArrayAlloc::allocate`]
    /// with the same `len`.
    ///
    /// ## Safety
    /// `array` must come from `allocate::<T>(len)` on this (or any —
    /// the type is stateless) `HeapArrayAlloc`, and must not be used
    /// afterwards.
    pub unsafe fn deallocate<T>(&self, array: NonNull<T>, len: usize) {
        let layout = Layout::array::<T>(len).expect("layout fit at allocation time");
        if layout.size() != 0 {
            std::alloc::dealloc(array.as_ptr() as *mut u8, layout);
        }
    }
}
