use crate::{FRAME_SIZE, align_down};
use core::fmt;
use core::ops::{Add, Sub};

/// Virtual memory address.
///
/// The translation to a [`PhysicalAddress`](crate::PhysicalAddress) is owned by
/// a page-table tree; this type only carries intent and frame arithmetic.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x1500);
/// assert_eq!(va.frame_base(), VirtualAddress::new(0x1000));
/// assert_eq!(va.frame_offset(), 0x500);
/// assert_eq!(VirtualAddress::new(0x3000) - VirtualAddress::new(0x1000), 0x2000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_frame_aligned(self) -> bool {
        self.0.is_multiple_of(FRAME_SIZE)
    }

    /// The base of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_base(self) -> Self {
        Self(align_down(self.0, FRAME_SIZE))
    }

    /// Byte offset of this address inside its page.
    #[inline]
    #[must_use]
    pub const fn frame_offset(self) -> u64 {
        self.0 & (FRAME_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Whether the address sits in the canonical upper half (bit 63 set).
    #[inline]
    #[must_use]
    pub const fn is_upper_half(self) -> bool {
        self.0 & (1 << 63) != 0
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub for VirtualAddress {
    type Output = u64;

    /// Distance in bytes between two addresses (`self` must not be below `rhs`).
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
