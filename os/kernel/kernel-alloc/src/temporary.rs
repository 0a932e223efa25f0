use crate::{PhysMapper, PhysicalFrame};
use core::ptr::NonNull;
use core::slice;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};

#[allow(clippy::cast_possible_truncation)]
const FRAME_BYTES: usize = FRAME_SIZE as usize;

/// Scoped kernel view of one physical frame.
///
/// The frame stays borrowed, and therefore alive, for as long as the mapping
/// exists. The mapping is torn down when the guard drops, which includes
/// unwinding out of the code that used it.
pub struct TemporaryMapping<'a> {
    mapper: &'a dyn PhysMapper,
    frame: &'a PhysicalFrame,
    ptr: NonNull<u8>,
    live: &'a AtomicUsize,
}

impl<'a> TemporaryMapping<'a> {
    pub(crate) fn new(
        mapper: &'a dyn PhysMapper,
        frame: &'a PhysicalFrame,
        live: &'a AtomicUsize,
    ) -> Self {
        // SAFETY: frame handles are always aligned and the mapper covers every
        // frame the allocator or a memory object hands out.
        let ptr = unsafe { mapper.map_frame(frame.address()) };
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            mapper,
            frame,
            ptr,
            live,
        }
    }

    #[must_use]
    pub fn address(&self) -> PhysicalAddress {
        self.frame.address()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapper returned a pointer to a whole frame.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), FRAME_BYTES) }
    }

    /// Writable view of the frame.
    ///
    /// The frame may also be mapped into an address space; the bytes are
    /// plain data, so a racing user-space writer cannot break kernel state.
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` rules out a second view through this guard.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), FRAME_BYTES) }
    }

    pub fn fill(&mut self, byte: u8) {
        self.as_bytes_mut().fill(byte);
    }
}

impl Drop for TemporaryMapping<'_> {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from this mapper and dies with the guard.
        unsafe { self.mapper.unmap_frame(self.ptr) };
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
