//! Slab arenas addressed by small integer handles.
//!
//! On 64-bit targets a node-based container spends a machine word on every
//! intra-container edge. This crate lets such containers store those edges
//! as 16- or 32-bit integers instead: an [`Arena`] (or its thread-safe
//! sibling [`SyncArena`]) hands out dense 1-based slot indices over a single
//! contiguous buffer, and a [`HandleConfig`] widens those indices into full
//! handles that can also name objects on the current thread's stack or
//! embedded inside the container object itself.
//!
//! ## Pieces
//!
//! * [`Arena`] / [`SyncArena`] — fixed-capacity, fixed-slot-size index
//!   allocators that recycle freed slots through a free list embedded in
//!   the slots themselves.
//! * [`BufferSource`] implementations ([`HeapSource`], [`FixedSource`] and,
//!   with the `mmap` feature, [`MmapSource`]) — where the buffer comes from.
//! * [`SimpleConfig`] / [`UniversalConfig`] — the handle ↔ address
//!   translation layer, backed by a [`ContextStore`] declared with
//!   [`static_arena_context!`] or [`thread_local_arena_context!`].
//! * [`Handle`] — an integer-sized typed pointer decoded through a config.
//! * [`HandleAllocator`] — presents an arena + config pair as a single-slot
//!   node allocator for host containers, with a heap fallback
//!   ([`HeapArrayAlloc`]) for hash-bucket arrays.
//! * [`thread_stack_top`] — the per-thread probe that seeds stack encoding.
//!
//! ## Caveats
//!
//! An arena serves exactly one element size, locked on the first
//! allocation, and its capacity is fixed once the buffer exists. Handles
//! are only meaningful together with the config that produced them;
//! mutating a config's context while handles minted under the old context
//! are still live is undefined.
#![deny(missing_docs)]

use thiserror::Error;

pub mod alloc;
pub mod arena;
pub mod config;
pub mod context;
pub mod handle;
pub mod index;
pub mod source;
pub mod stack;

pub use self::alloc::{HandleAllocator, HeapArrayAlloc};
pub use self::arena::Arena;
#[cfg(feature = "sync")]
pub use self::arena::SyncArena;
pub use self::arena::RawArena;
pub use self::config::{HandleConfig, SimpleConfig, UniversalConfig};
pub use self::context::ContextStore;
pub use self::handle::Handle;
pub use self::index::HandleIndex;
#[cfg(feature = "mmap")]
pub use self::source::MmapSource;
pub use self::source::{BufferSource, FixedSource, HeapSource};
pub use self::stack::thread_stack_top;

/// An error raised by arena configuration or allocation.
///
/// Anything else that can go wrong (mixed allocation sizes, a dangling
/// handle, a misaligned address handed to the translation layer) is a
/// usage bug, checked by `debug_assert!` rather than reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// The requested capacity does not fit in the handle's payload bits.
    #[error("arena capacity {requested} is too large for the handle width (limit {limit})")]
    CapacityTooLarge {
        /// The capacity that was asked for.
        requested: usize,
        /// The first capacity that no longer fits.
        limit: usize,
    },
    /// The capacity cannot change while the arena's buffer is allocated.
    ///
    /// Call [`Arena::free_memory`] (or [`SyncArena::free_memory`]) first.
    #[error("arena capacity cannot change while its buffer is allocated")]
    AllocationInProgress,
    /// Capacity is exhausted, or the buffer source failed to provide memory.
    #[error("arena is out of memory")]
    OutOfMemory,
}
