//! # Physical frame access
//!
//! Kernel code can only dereference virtual addresses. A [`PhysMapper`] turns
//! the physical address of a frame into a pointer the current address space
//! can touch: page-table walkers use it to edit table frames, the allocator
//! uses it to zero and copy frames.
//!
//! - [`HhdmPhysMapper`]: every physical address is visible at `HHDM_BASE + pa`.
//! - [`RamArena`](crate::RamArena): a heap block standing in for RAM in hosted
//!   runs.

use core::ptr::NonNull;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;

/// Maps physical frames into the kernel's view of memory.
pub trait PhysMapper: Send + Sync {
    /// Pointer to the first byte of the frame at `pa`.
    ///
    /// # Safety
    /// `pa` must be a frame-aligned address of memory this mapper covers. The
    /// pointer is only valid until the matching [`unmap_frame`](Self::unmap_frame).
    unsafe fn map_frame(&self, pa: PhysicalAddress) -> NonNull<u8>;

    /// Tear down a mapping returned by [`map_frame`](Self::map_frame).
    ///
    /// Direct-map implementations have nothing to undo.
    ///
    /// # Safety
    /// `ptr` must come from `map_frame` on this mapper and must not be used
    /// afterwards.
    unsafe fn unmap_frame(&self, _ptr: NonNull<u8>) {}
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// The HHDM must be installed and cover every frame handed to it.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn map_frame(&self, pa: PhysicalAddress) -> NonNull<u8> {
        #[allow(clippy::cast_possible_truncation)]
        let va = HHDM_BASE.wrapping_add(pa.as_u64()) as usize;
        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(va);
        // SAFETY: HHDM_BASE is non-zero and physical memory is far below the
        // wrap-around point, so the sum is never null.
        unsafe { NonNull::new_unchecked(ptr) }
    }
}
