//! Utilities for aligning memory

use std::ops::{Add, Rem, Sub};

/// Align a size to a required alignment. Values that are already aligned are returned unchanged, and so is
/// every value when `alignment` is zero.
/// Does not align the base address.
pub fn align<T>(value: T, alignment: T) -> T
where
    T: Add<T, Output = T> + Sub<T, Output = T> + Rem<T, Output = T> + PartialEq + Default + Copy, {
    if alignment == T::default() {
        return value;
    }
    let unaligned_size = value % alignment;
    if unaligned_size == T::default() {
        value
    } else {
        value + (alignment - unaligned_size)
    }
}
