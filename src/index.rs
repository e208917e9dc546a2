//! The integer types a handle can be stored in.
//!
//! A handle is an unsigned integer narrow enough to be worth trading a
//! pointer for: `u16` or `u32`. The top one or two bits are reserved for
//! location tags (see [`crate::config`]), which is why arena capacity is
//! bounded below the full integer range.

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::{BitAnd, BitOr, BitXor, Not};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

mod sealed {
    pub trait Sealed {}
}

/// An unsigned integer used as a pointer stand-in.
///
/// Implemented for `u16` and `u32` only. `u8` leaves no payload worth
/// having once a tag bit is spent, and `u64` defeats the purpose.
pub trait HandleIndex:
    sealed::Sealed
    + Copy
    + Eq
    + Ord
    + Hash
    + Debug
    + Default
    + Send
    + Sync
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
    + Not<Output = Self>
    + 'static
{
    /// Width of the handle in bits.
    const BITS: u32;
    /// The null handle.
    const ZERO: Self;
    /// Tag bit marking a handle that encodes a stack offset.
    const ON_STACK: Self;
    /// Tag bit marking a handle that encodes an offset into the container body.
    const IN_CONTAINER: Self;
    /// First capacity that no longer fits under one tag bit (`2^(W-1)`).
    const SIMPLE_CAPACITY_LIMIT: usize;
    /// First capacity that no longer fits under two tag bits (`2^(W-2)`).
    const UNIVERSAL_CAPACITY_LIMIT: usize;

    /// The double-width word holding a `(stamp, handle)` pair for the
    /// tagged free-list head.
    type Double: Copy + Eq + Debug + Default;
    /// Atomic cell for `Self`.
    type Atomic: AtomicInt<Self>;
    /// Atomic cell for [`Self::Double`].
    type DoubleAtomic: AtomicInt<Self::Double>;

    /// Narrow `value`, which the caller guarantees fits.
    fn from_usize(value: usize) -> Self;
    /// Widen to `usize`.
    fn as_usize(self) -> usize;
    /// Pack a `(stamp, handle)` pair into a double-width word.
    fn pack(stamp: Self, handle: Self) -> Self::Double;
    /// The handle half of a packed word.
    fn unpack_handle(word: Self::Double) -> Self;
    /// The stamp half of a packed word.
    fn unpack_stamp(word: Self::Double) -> Self;
    /// Stamp increment; wraps, which is fine since only inequality matters.
    fn bump(self) -> Self;
}

/// The subset of the std atomic-integer API the arenas need, so arena code
/// can stay generic over the handle width.
pub trait AtomicInt<V>: Default + Send + Sync {
    /// A cell holding `value`.
    fn new(value: V) -> Self;
    /// Atomic load.
    fn load(&self, order: Ordering) -> V;
    /// Atomic store.
    fn store(&self, value: V, order: Ordering);
    /// Atomic add, returning the previous value.
    fn fetch_add(&self, value: V, order: Ordering) -> V;
    /// Atomic subtract, returning the previous value.
    fn fetch_sub(&self, value: V, order: Ordering) -> V;
    /// Atomic compare-exchange.
    fn compare_exchange(
        &self,
        current: V,
        new: V,
        success: Ordering,
        failure: Ordering,
    ) -> Result<V, V>;
    /// Plain access through exclusive borrow.
    fn get_mut(&mut self) -> &mut V;
}

macro_rules! impl_atomic_int {
    ($value:ty, $atomic:ty) => {
        impl AtomicInt<$value> for $atomic {
            #[inline]
            fn new(value: $value) -> Self {
                <$atomic>::new(value)
            }
            #[inline]
            fn load(&self, order: Ordering) -> $value {
                <$atomic>::load(self, order)
            }
            #[inline]
            fn store(&self, value: $value, order: Ordering) {
                <$atomic>::store(self, value, order)
            }
            #[inline]
            fn fetch_add(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_add(self, value, order)
            }
            #[inline]
            fn fetch_sub(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_sub(self, value, order)
            }
            #[inline]
            fn compare_exchange(
                &self,
                current: $value,
                new: $value,
                success: Ordering,
                failure: Ordering,
            ) -> Result<$value, $value> {
                <$atomic>::compare_exchange(self, current, new, success, failure)
            }
            #[inline]
            fn get_mut(&mut self) -> &mut $value {
                <$atomic>::get_mut(self)
            }
        }
    };
}
impl_atomic_int!(u16, AtomicU16);
impl_atomic_int!(u32, AtomicU32);
impl_atomic_int!(u64, AtomicU64);

macro_rules! impl_handle_index {
    ($int:ty, $double:ty, $atomic:ty, $double_atomic:ty) => {
        impl sealed::Sealed for $int {}
        impl HandleIndex for $int {
            const BITS: u32 = <$int>::BITS;
            const ZERO: Self = 0;
            const ON_STACK: Self = 1 << (<$int>::BITS - 1);
            const IN_CONTAINER: Self = 1 << (<$int>::BITS - 2);
            const SIMPLE_CAPACITY_LIMIT: usize = 1 << (<$int>::BITS - 1);
            const UNIVERSAL_CAPACITY_LIMIT: usize = 1 << (<$int>::BITS - 2);

            type Double = $double;
            type Atomic = $atomic;
            type DoubleAtomic = $double_atomic;

            #[inline]
            fn from_usize(value: usize) -> Self {
                debug_assert!(value <= <$int>::MAX as usize);
                value as $int
            }
            #[inline]
            fn as_usize(self) -> usize {
                self as usize
            }
            #[inline]
            fn pack(stamp: Self, handle: Self) -> $double {
                ((stamp as $double) << <$int>::BITS) | handle as $double
            }
            #[inline]
            fn unpack_handle(word: $double) -> Self {
                word as $int
            }
            #[inline]
            fn unpack_stamp(word: $double) -> Self {
                (word >> <$int>::BITS) as $int
            }
            #[inline]
            fn bump(self) -> Self {
                self.wrapping_add(1)
            }
        }
    };
}
impl_handle_index!(u16, u32, AtomicU16, AtomicU32);
impl_handle_index!(u32, u64, AtomicU32, AtomicU64);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_bits() {
        assert_eq!(u16::ON_STACK, 0x8000);
        assert_eq!(u16::IN_CONTAINER, 0x4000);
        assert_eq!(u32::ON_STACK, 0x8000_0000);
        assert_eq!(u32::IN_CONTAINER, 0x4000_0000);
        assert_eq!(u16::SIMPLE_CAPACITY_LIMIT, 1 << 15);
        assert_eq!(u16::UNIVERSAL_CAPACITY_LIMIT, 1 << 14);
    }

    #[test]
    fn pack_round_trip() {
        let word = u16::pack(7, 0x1234);
        assert_eq!(u16::unpack_stamp(word), 7);
        assert_eq!(u16::unpack_handle(word), 0x1234);

        let word = u32::pack(u32::MAX, 42);
        assert_eq!(u32::unpack_stamp(word), u32::MAX);
        assert_eq!(u32::unpack_handle(word), 42);
        assert_eq!(u32::unpack_stamp(word).bump(), 0);
    }
}
