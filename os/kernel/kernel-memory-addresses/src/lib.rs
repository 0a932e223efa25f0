//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the frame
//! allocator, the page-table trees and the region bookkeeping.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | Physical memory or MMIO. |
//! | [`VirtualAddress`] | Page-table translated memory. |
//! | [`VirtualRange`] | A half-open `[start, end)` span of virtual memory. |
//!
//! All mapping operations work at [`FRAME_SIZE`] granularity. Mixing the two
//! address kinds is a type error:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x1234_5678);
//! assert_eq!(va.frame_base().as_u64(), 0x1234_5000);
//! assert_eq!(va.frame_offset(), 0x678);
//!
//! let range = VirtualRange::new(VirtualAddress::new(0x1000), 3 * FRAME_SIZE).unwrap();
//! assert_eq!(range.pages().count(), 3);
//! ```
//!
//! The types are `#[repr(transparent)]` over `u64` and implement `Copy`, `Eq`,
//! `Ord` and `Hash`, so they work as map keys.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;
mod virtual_range;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;
pub use virtual_range::{PageIter, VirtualRange};

/// Size of one physical frame / virtual page in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// `log2(FRAME_SIZE)`.
pub const FRAME_SHIFT: u32 = 12;

const _: () = assert!(1 << FRAME_SHIFT == FRAME_SIZE);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of frames needed to hold `bytes`, rounding up.
#[inline]
#[must_use]
pub const fn frames_for(bytes: u64) -> u64 {
    bytes.div_ceil(FRAME_SIZE)
}
