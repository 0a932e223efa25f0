use crate::PhysMapper;
use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};

/// A frame-aligned heap block posing as physical RAM.
///
/// Frame `i` of the arena has the physical address `base + i * FRAME_SIZE`.
/// Used to run the memory manager outside the kernel, where there is no
/// direct map to read physical memory through.
pub struct RamArena {
    base: PhysicalAddress,
    frames: u64,
    memory: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena is plain memory; who may write which frame is decided by
// frame ownership, not by the arena.
unsafe impl Send for RamArena {}
unsafe impl Sync for RamArena {}

impl RamArena {
    /// Allocate `frames` zeroed frames that claim to live at physical `base`.
    ///
    /// # Panics
    /// Panics if `frames` is zero, `base` is not frame aligned or the
    /// simulated range does not fit into the address width.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: u64) -> Self {
        assert!(frames > 0, "empty arena");
        assert!(base.is_frame_aligned(), "misaligned arena base {base:?}");
        let bytes = frames
            .checked_mul(FRAME_SIZE)
            .filter(|&b| base.checked_add(b).is_some())
            .and_then(|b| usize::try_from(b).ok());
        let Some(bytes) = bytes else {
            panic!("arena of {frames} frames at {base:?} does not fit");
        };
        #[allow(clippy::cast_possible_truncation)]
        let Ok(layout) = Layout::from_size_align(bytes, FRAME_SIZE as usize) else {
            panic!("arena of {frames} frames at {base:?} does not fit");
        };

        // SAFETY: the layout has a non-zero size.
        let memory = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));
        log::debug!("RAM arena: {frames} frames at {base:?}");
        Self {
            base,
            frames,
            memory,
            layout,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Whether `pa` lies inside the arena.
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.as_u64();
        pa >= self.base.as_u64() && pa - self.base.as_u64() < self.frames * FRAME_SIZE
    }
}

impl PhysMapper for RamArena {
    unsafe fn map_frame(&self, pa: PhysicalAddress) -> NonNull<u8> {
        assert!(self.contains(pa), "{pa:?} is outside the RAM arena");
        #[allow(clippy::cast_possible_truncation)]
        let offset = (pa.frame_base().as_u64() - self.base.as_u64()) as usize;
        // SAFETY: offset is in bounds of the allocation.
        unsafe { self.memory.add(offset) }
    }
}

impl Drop for RamArena {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.memory.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for RamArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamArena")
            .field("base", &self.base)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}
