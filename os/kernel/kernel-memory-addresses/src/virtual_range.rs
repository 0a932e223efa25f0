use crate::{FRAME_SIZE, VirtualAddress};
use core::fmt;

/// Half-open span `[start, end)` of virtual memory.
///
/// ### Invariants
/// - `start <= end`.
/// - Ranges built by [`new`](Self::new) are frame aligned and non-empty.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtualRange {
    /// A frame-aligned, non-empty range of `length` bytes at `start`.
    ///
    /// Returns `None` if `start` or `length` is misaligned, `length` is zero
    /// or the range would wrap around the address space.
    #[must_use]
    pub const fn new(start: VirtualAddress, length: u64) -> Option<Self> {
        if length == 0 || !start.is_frame_aligned() || !length.is_multiple_of(FRAME_SIZE) {
            return None;
        }
        match start.checked_add(length) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    /// Build a range from raw bounds. No alignment checks are performed.
    ///
    /// ### Panics
    /// Panics if `end < start`.
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(start.as_u64() <= end.as_u64(), "inverted range");
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pages covered.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.len() / FRAME_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u64() <= va.as_u64() && va.as_u64() < self.end.as_u64()
    }

    /// Whether `other` lies entirely inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Iterate the base address of every page in the range.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> PageIter {
        PageIter {
            next: self.start.as_u64(),
            end: self.end.as_u64(),
        }
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start.as_u64(), self.end.as_u64())
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Iterator over the page bases of a [`VirtualRange`].
#[derive(Clone, Debug)]
pub struct PageIter {
    next: u64,
    end: u64,
}

impl Iterator for PageIter {
    type Item = VirtualAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let va = VirtualAddress::new(self.next);
        self.next = self.next.saturating_add(FRAME_SIZE);
        Some(va)
    }
}
