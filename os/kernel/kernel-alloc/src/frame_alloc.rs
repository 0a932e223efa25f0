//! # Physical frame allocator
//!
//! Tracks free 4 KiB frames in one bitmap per usable zone (bit set = free).
//! The bitmap lives on the kernel heap, so the allocator can be sized from
//! the firmware memory map at boot.
//!
//! The free set sits behind a [`TicketMutex`] that is held for the bitmap
//! update only. Zeroing and copying happen after the lock is dropped, so the
//! allocator lock is always the innermost lock in the system.

use crate::{PhysMapper, PhysicalFrame, TemporaryMapping};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use kernel_sync::TicketMutex;

/// No free physical frame was available.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfMemory;

/// Snapshot of the allocator counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames ever handed to [`FrameAllocator::add_usable_range`].
    pub total: u64,
    /// Frames currently free.
    pub free: u64,
    /// Successful allocations so far.
    pub allocations: u64,
    /// Frames returned so far.
    pub releases: u64,
}

/// One contiguous usable range of physical memory.
struct Zone {
    base: u64,
    frames: u64,
    free_bits: Vec<u64>,
}

impl Zone {
    fn new(base: u64, frames: u64) -> Self {
        let words = usize::try_from(frames.div_ceil(64)).unwrap_or(usize::MAX);
        let mut free_bits = vec![u64::MAX; words];
        // Clear the tail bits past the last frame.
        let tail = frames % 64;
        if tail != 0
            && let Some(last) = free_bits.last_mut()
        {
            *last = (1u64 << tail) - 1;
        }
        Self {
            base,
            frames,
            free_bits,
        }
    }

    const fn end(&self) -> u64 {
        self.base + self.frames * FRAME_SIZE
    }

    const fn contains(&self, pa: u64) -> bool {
        pa >= self.base && pa < self.end()
    }

    const fn overlaps(&self, base: u64, end: u64) -> bool {
        base < self.end() && self.base < end
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn slot(&self, pa: u64) -> (usize, u64) {
        let index = (pa - self.base) / FRAME_SIZE;
        ((index / 64) as usize, 1u64 << (index % 64))
    }

    fn take_first(&mut self) -> Option<u64> {
        let (word, bits) = self
            .free_bits
            .iter_mut()
            .enumerate()
            .find(|(_, bits)| **bits != 0)?;
        let bit = u64::from(bits.trailing_zeros());
        *bits &= !(1u64 << bit);
        Some(self.base + ((word as u64) * 64 + bit) * FRAME_SIZE)
    }

    /// Flip `pa` to used; `false` if it already was.
    fn take(&mut self, pa: u64) -> bool {
        let (word, mask) = self.slot(pa);
        let was_free = self.free_bits[word] & mask != 0;
        self.free_bits[word] &= !mask;
        was_free
    }

    /// Flip `pa` to free; `false` if it already was.
    fn put(&mut self, pa: u64) -> bool {
        let (word, mask) = self.slot(pa);
        let was_used = self.free_bits[word] & mask == 0;
        self.free_bits[word] |= mask;
        was_used
    }

    fn is_free(&self, pa: u64) -> bool {
        let (word, mask) = self.slot(pa);
        self.free_bits[word] & mask != 0
    }
}

#[derive(Default)]
struct FreeSet {
    zones: Vec<Zone>,
    stats: FrameStats,
}

impl FreeSet {
    fn zone_mut(&mut self, pa: u64) -> Option<&mut Zone> {
        self.zones.iter_mut().find(|z| z.contains(pa))
    }
}

/// The physical frame allocator.
///
/// Construct it once, wrap it in an [`Arc`], then feed it the usable ranges of
/// the memory map. Frames come back as [`PhysicalFrame`] handles that return
/// themselves when their last reference is dropped.
pub struct FrameAllocator {
    mapper: Arc<dyn PhysMapper>,
    free: TicketMutex<FreeSet>,
    live_mappings: AtomicUsize,
}

impl FrameAllocator {
    /// An allocator with no usable memory yet.
    #[must_use]
    pub fn new(mapper: Arc<dyn PhysMapper>) -> Self {
        Self {
            mapper,
            free: TicketMutex::new(FreeSet::default()),
            live_mappings: AtomicUsize::new(0),
        }
    }

    /// Hand `frames` frames starting at `base` to the allocator.
    ///
    /// # Panics
    /// Panics if `base` is misaligned, the range wraps, or it overlaps a range
    /// added earlier. The memory map is trusted boot input, so either is a bug.
    pub fn add_usable_range(&self, base: PhysicalAddress, frames: u64) {
        assert!(base.is_frame_aligned(), "misaligned usable range {base:?}");
        let Some(end) = frames
            .checked_mul(FRAME_SIZE)
            .and_then(|len| base.as_u64().checked_add(len))
        else {
            panic!("usable range at {base:?} wraps around");
        };
        if frames == 0 {
            return;
        }

        let mut free = self.free.lock();
        assert!(
            !free.zones.iter().any(|z| z.overlaps(base.as_u64(), end)),
            "usable range at {base:?} overlaps an existing zone"
        );
        free.zones.push(Zone::new(base.as_u64(), frames));
        free.stats.total += frames;
        free.stats.free += frames;
        log::debug!("frame zone {base:?}..PA({end:#x}): {frames} frames");
    }

    /// Take the frame at `pa` out of the free set for good.
    ///
    /// Returns `false` if the frame is not managed here or already in use.
    pub fn reserve(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.frame_base().as_u64();
        let mut free = self.free.lock();
        let taken = free.zone_mut(pa).is_some_and(|z| z.take(pa));
        if taken {
            free.stats.free -= 1;
            log::trace!("reserved frame PA({pa:#x})");
        }
        taken
    }

    /// Take one free frame. Its content is whatever the previous owner left.
    ///
    /// # Errors
    /// [`OutOfMemory`] if every zone is exhausted.
    pub fn allocate(self: &Arc<Self>) -> Result<PhysicalFrame, OutOfMemory> {
        let pa = {
            let mut free = self.free.lock();
            let found = free.zones.iter_mut().find_map(Zone::take_first);
            let Some(pa) = found else {
                drop(free);
                log::warn!("frame allocation failed: out of physical memory");
                return Err(OutOfMemory);
            };
            free.stats.free -= 1;
            free.stats.allocations += 1;
            pa
        };
        log::trace!("allocated frame PA({pa:#x})");
        Ok(PhysicalFrame::owned(PhysicalAddress::new(pa), Arc::clone(self)))
    }

    /// Take one free frame and clear it.
    ///
    /// # Errors
    /// [`OutOfMemory`] if every zone is exhausted.
    pub fn allocate_zeroed(self: &Arc<Self>) -> Result<PhysicalFrame, OutOfMemory> {
        let frame = self.allocate()?;
        self.zero(&frame);
        Ok(frame)
    }

    /// Return the frame at `pa` to the free set.
    ///
    /// Only called from the drop of the last [`PhysicalFrame`] reference.
    ///
    /// # Panics
    /// Releasing a frame that is already free means two handles believed they
    /// owned it; continuing would hand it out twice.
    pub(crate) fn release(&self, pa: PhysicalAddress) {
        let raw = pa.as_u64();
        let mut free = self.free.lock();
        let Some(zone) = free.zone_mut(raw) else {
            panic!("released {pa:?} which no zone manages");
        };
        assert!(zone.put(raw), "double release of {pa:?}");
        free.stats.free += 1;
        free.stats.releases += 1;
        drop(free);
        log::trace!("released frame {pa:?}");
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.free.lock().stats
    }

    /// Whether `pa` is managed here and currently free.
    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.frame_base().as_u64();
        self.free
            .lock()
            .zones
            .iter()
            .find(|z| z.contains(pa))
            .is_some_and(|z| z.is_free(pa))
    }

    #[must_use]
    pub fn mapper(&self) -> &Arc<dyn PhysMapper> {
        &self.mapper
    }

    /// Map `frame` for the lifetime of the returned guard.
    #[must_use]
    pub fn map_temporary<'a>(&'a self, frame: &'a PhysicalFrame) -> TemporaryMapping<'a> {
        TemporaryMapping::new(self.mapper.as_ref(), frame, &self.live_mappings)
    }

    /// Number of temporary mappings currently alive.
    #[must_use]
    pub fn live_temporary_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::Acquire)
    }

    /// Fill `frame` with zero bytes.
    pub fn zero(&self, frame: &PhysicalFrame) {
        self.map_temporary(frame).fill(0);
    }

    /// Copy the whole content of `src` into `dst`.
    pub fn copy(&self, dst: &PhysicalFrame, src: &PhysicalFrame) {
        let from = self.map_temporary(src);
        let mut to = self.map_temporary(dst);
        to.as_bytes_mut().copy_from_slice(from.as_bytes());
    }
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
