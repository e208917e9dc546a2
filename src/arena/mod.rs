//! The slab arenas.
//!
//! Both variants implement the same contract, [`RawArena`]: fixed
//! capacity, one element size locked on the first allocation, dense
//! 1-based slot indices, and a free list threaded through the first
//! handle-width bytes of freed slots. [`Arena`] is the single-threaded
//! variant; [`SyncArena`] (behind the `sync` feature) serves concurrent
//! allocate/deallocate with a lock-free tagged free list.

mod nosync;
#[cfg(feature = "sync")]
mod sync;

pub use self::nosync::Arena;
#[cfg(feature = "sync")]
pub use self::sync::SyncArena;

use crate::index::HandleIndex;
use crate::ArenaError;

/// The arena contract consumed by configs and allocators.
///
/// All methods take `&self`: arenas are shared between an allocator and
/// the config registry, and use interior mutability internally. Operations
/// that require external quiescence (`set_capacity`, `reset`,
/// `free_memory`) are inherent methods on the concrete types instead.
pub trait RawArena {
    /// The handle integer this arena hands out.
    type Index: HandleIndex;

    /// True for the thread-safe variant. Configs that cannot distinguish
    /// node locations without dereferencing the buffer refuse to pair
    /// with a sync arena (see [`crate::config::UniversalConfig`]).
    const IS_SYNC: bool;

    /// Allocate one slot of `size` bytes, returning its index in
    /// `[1, capacity]`.
    ///
    /// `size` locks the arena's element size on the first call and must
    /// match it on every later call.
    fn allocate(&self, size: usize) -> Result<Self::Index, ArenaError>;

    /// Return the slot `index` to the arena. `size` must match the
    /// element size.
    fn deallocate(&self, index: Self::Index, size: usize);

    /// Address of slot `index`. The index must come from [`RawArena::allocate`]
    /// and still be live.
    fn element(&self, index: Self::Index) -> *mut u8;

    /// Index of the slot starting at `ptr`, the inverse of
    /// [`RawArena::element`]. `ptr` must be slot-aligned.
    fn index_of(&self, ptr: *const u8) -> Self::Index;

    /// Start of the buffer, or null before the first allocation.
    fn begin(&self) -> *mut u8;

    /// One past the end of the buffer, or null before the first allocation.
    fn end(&self) -> *mut u8;

    /// Slot capacity.
    fn capacity(&self) -> usize;

    /// Locked element size in bytes, or 0 before the first allocation.
    fn element_size(&self) -> usize;
}
