//! The integer-sized pointer type.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::config::{ConfigIndex, HandleConfig};
use crate::index::HandleIndex;

/// A typed pointer stored as a small integer.
///
/// A `Handle` names an arena slot, a stack location or a spot inside the
/// registered container object, depending on its tag bits; decoding runs
/// through the config `C`. The raw value 0 is the null handle.
///
/// Handles are plain values: `Copy`, comparable, hashable. There is no
/// pointer arithmetic and no array indexing — a handle names exactly one
/// object.
///
/// Dereferencing is explicit and unsafe, in the style of
/// [`std::ptr::NonNull`]: the caller asserts the handle is live and was
/// minted under the current context.
pub struct Handle<T, C: HandleConfig> {
    raw: ConfigIndex<C>,
    _marker: PhantomData<(*mut T, fn() -> C)>,
}

impl<T, C: HandleConfig> Handle<T, C> {
    /// The null handle.
    #[inline]
    pub fn null() -> Self {
        Handle::from_raw(<ConfigIndex<C> as HandleIndex>::ZERO)
    }

    /// Wrap a raw index previously obtained from [`Handle::raw`] or from
    /// an arena.
    #[inline]
    pub fn from_raw(raw: ConfigIndex<C>) -> Self {
        Handle {
            raw,
            _marker: PhantomData,
        }
    }

    /// The handle for `value`, which must live in a region the config
    /// can encode: the arena, the recorded stack window, or the
    /// registered container body.
    #[inline]
    pub fn for_value(value: &T) -> Self {
        Handle::from_raw(C::index_of(value as *const T as *const u8))
    }

    /// The raw integer.
    #[inline]
    pub fn raw(self) -> ConfigIndex<C> {
        self.raw
    }

    /// Mutable access to the raw integer, for containers that update a
    /// link word in place (e.g. intrusive lists patching a stored next
    /// handle).
    #[inline]
    pub fn raw_slot(&mut self) -> &mut ConfigIndex<C> {
        &mut self.raw
    }

    /// True for the null handle.
    #[inline]
    pub fn is_null(self) -> bool {
        self.raw == <ConfigIndex<C> as HandleIndex>::ZERO
    }

    /// Decode to a raw pointer. The handle must not be null.
    #[inline]
    pub fn as_ptr(self) -> *mut T {
        debug_assert!(!self.is_null(), "dereferenced a null handle");
        C::element(self.raw) as *mut T
    }

    /// Decode to a shared reference.
    ///
    /// ## Safety
    /// The handle must be live, minted under the current context, and
    /// point at an initialized `T`; the usual aliasing rules apply for
    /// the lifetime the caller picks.
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        &*self.as_ptr()
    }

    /// Decode to an exclusive reference.
    ///
    /// ## Safety
    /// As [`Handle::as_ref`], plus the reference must be unique.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        &mut *self.as_ptr()
    }

    /// Reinterpret as a handle to another type at the same address.
    ///
    /// The integer does not change; only the decoded pointer type does.
    /// This is the explicit narrowing cast — going through
    /// [`Handle::erase`] and back is the typical round trip.
    #[inline]
    pub fn cast<U>(self) -> Handle<U, C> {
        Handle::from_raw(self.raw)
    }

    /// Widen to an untyped handle.
    #[inline]
    pub fn erase(self) -> Handle<(), C> {
        self.cast()
    }
}

impl<T, C: HandleConfig> Clone for Handle<T, C> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<T, C: HandleConfig> Copy for Handle<T, C> {}

impl<T, C: HandleConfig> Default for Handle<T, C> {
    #[inline]
    fn default() -> Self {
        Handle::null()
    }
}

impl<T, C: HandleConfig> PartialEq for Handle<T, C> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T, C: HandleConfig> Eq for Handle<T, C> {}

impl<T, C: HandleConfig> Hash for Handle<T, C> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state)
    }
}

impl<T, C: HandleConfig> fmt::Debug for Handle<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Handle(null)")
        } else {
            write!(f, "Handle({:?})", self.raw)
        }
    }
}
