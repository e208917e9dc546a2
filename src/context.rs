//! Per-config context storage.
//!
//! A [`crate::config::HandleConfig`] reads three pieces of ambient state:
//! the active arena, the owning thread's stack top, and (for the
//! universal encoding) the address of the container object whose body may
//! embed sentinel nodes. Handles are just integers, so this state cannot
//! travel with them — it lives in storage owned by the config type.
//!
//! Each config gets its own storage by declaring a fresh store type with
//! one of two macros:
//!
//! * [`static_arena_context!`] — process-wide slots. One arena, one stack
//!   top, one container for the whole process; the usual choice for
//!   single-threaded programs and for benchmarks.
//! * [`thread_local_arena_context!`] — thread-local slots. Every thread
//!   binds its own arena (or the same `SyncArena`) and must record its
//!   own stack top.
//!
//! Changing any slot while handles minted under the old value are still
//! live is undefined; the translation layer would decode them against the
//! wrong base.
//!
//! ```
//! use indexed_arena::{static_arena_context, Arena};
//!
//! static_arena_context! {
//!     /// Context for the example arena.
//!     pub struct ExampleContext for Arena<u32>
//! }
//! ```

use crate::arena::RawArena;

/// Storage slots read by a config: `(arena, stack_top, container)`.
///
/// Implementations are generated by [`static_arena_context!`] and
/// [`thread_local_arena_context!`]; the accessors are associated
/// functions because the store is a type-level capability, never a value.
pub trait ContextStore {
    /// The arena variant stored here.
    type Arena: RawArena;

    /// The registered arena, or null.
    fn arena() -> *mut Self::Arena;
    /// Register the arena used by handles and allocators of this config.
    fn set_arena(arena: *mut Self::Arena);
    /// Highest address of the relevant thread's stack, or null.
    fn stack_top() -> *mut u8;
    /// Record the stack top (see [`crate::thread_stack_top`]).
    fn set_stack_top(top: *mut u8);
    /// Base address of the registered container object, or null.
    fn container() -> *mut u8;
    /// Register the container object whose body may embed nodes.
    fn set_container(container: *mut u8);
}

/// Declare a [`ContextStore`] with process-wide storage.
///
/// ```
/// use indexed_arena::{static_arena_context, Arena};
///
/// static_arena_context! {
///     pub struct MapContext for Arena<u16>
/// }
/// ```
///
/// The generated type holds one `(arena, stack_top, container)` triple for
/// the whole process, in atomics, so it may be read from any thread —
/// but note the stack top is only meaningful on the thread that recorded
/// it.
#[macro_export]
macro_rules! static_arena_context {
    ($(#[$attr:meta])* $vis:vis struct $name:ident for $arena:ty) => {
        $(#[$attr])*
        $vis struct $name;

        impl $name {
            #[inline]
            fn arena_slot() -> &'static ::std::sync::atomic::AtomicPtr<$arena> {
                static SLOT: ::std::sync::atomic::AtomicPtr<$arena> =
                    ::std::sync::atomic::AtomicPtr::new(::std::ptr::null_mut());
                &SLOT
            }
            #[inline]
            fn stack_top_slot() -> &'static ::std::sync::atomic::AtomicPtr<u8> {
                static SLOT: ::std::sync::atomic::AtomicPtr<u8> =
                    ::std::sync::atomic::AtomicPtr::new(::std::ptr::null_mut());
                &SLOT
            }
            #[inline]
            fn container_slot() -> &'static ::std::sync::atomic::AtomicPtr<u8> {
                static SLOT: ::std::sync::atomic::AtomicPtr<u8> =
                    ::std::sync::atomic::AtomicPtr::new(::std::ptr::null_mut());
                &SLOT
            }
        }

        impl $crate::context::ContextStore for $name {
            type Arena = $arena;

            #[inline]
            fn arena() -> *mut $arena {
                Self::arena_slot().load(::std::sync::atomic::Ordering::Acquire)
            }
            #[inline]
            fn set_arena(arena: *mut $arena) {
                Self::arena_slot().store(arena, ::std::sync::atomic::Ordering::Release)
            }
            #[inline]
            fn stack_top() -> *mut u8 {
                Self::stack_top_slot().load(::std::sync::atomic::Ordering::Acquire)
            }
            #[inline]
            fn set_stack_top(top: *mut u8) {
                Self::stack_top_slot().store(top, ::std::sync::atomic::Ordering::Release)
            }
            #[inline]
            fn container() -> *mut u8 {
                Self::container_slot().load(::std::sync::atomic::Ordering::Acquire)
            }
            #[inline]
            fn set_container(container: *mut u8) {
                Self::container_slot().store(container, ::std::sync::atomic::Ordering::Release)
            }
        }
    };
}

/// Declare a [`ContextStore`] with thread-local storage.
///
/// ```
/// use indexed_arena::{thread_local_arena_context, SyncArena};
///
/// thread_local_arena_context! {
///     pub struct WorkerContext for SyncArena<u32>
/// }
/// ```
///
/// Every thread sees its own `(arena, stack_top, container)` triple.
/// Threads may all register the same [`crate::SyncArena`], or one
/// single-threaded [`crate::Arena`] each; either way each thread must
/// record its own stack top before its first handle operation.
#[macro_export]
macro_rules! thread_local_arena_context {
    ($(#[$attr:meta])* $vis:vis struct $name:ident for $arena:ty) => {
        $(#[$attr])*
        $vis struct $name;

        impl $name {
            #[inline]
            fn with_slots<R>(
                body: impl FnOnce(
                    &::std::cell::Cell<*mut $arena>,
                    &::std::cell::Cell<*mut u8>,
                    &::std::cell::Cell<*mut u8>,
                ) -> R,
            ) -> R {
                ::std::thread_local! {
                    static ARENA: ::std::cell::Cell<*mut $arena> =
                        ::std::cell::Cell::new(::std::ptr::null_mut());
                    static STACK_TOP: ::std::cell::Cell<*mut u8> =
                        ::std::cell::Cell::new(::std::ptr::null_mut());
                    static CONTAINER: ::std::cell::Cell<*mut u8> =
                        ::std::cell::Cell::new(::std::ptr::null_mut());
                }
                ARENA.with(|arena| {
                    STACK_TOP.with(|stack_top| {
                        CONTAINER.with(|container| body(arena, stack_top, container))
                    })
                })
            }
        }

        impl $crate::context::ContextStore for $name {
            type Arena = $arena;

            #[inline]
            fn arena() -> *mut $arena {
                Self::with_slots(|arena, _, _| arena.get())
            }
            #[inline]
            fn set_arena(arena: *mut $arena) {
                Self::with_slots(|slot, _, _| slot.set(arena))
            }
            #[inline]
            fn stack_top() -> *mut u8 {
                Self::with_slots(|_, stack_top, _| stack_top.get())
            }
            #[inline]
            fn set_stack_top(top: *mut u8) {
                Self::with_slots(|_, stack_top, _| stack_top.set(top))
            }
            #[inline]
            fn container() -> *mut u8 {
                Self::with_slots(|_, _, container| container.get())
            }
            #[inline]
            fn set_container(container: *mut u8) {
                Self::with_slots(|_, _, slot| slot.set(container))
            }
        }
    };
}
