//! # Memory objects
//!
//! The content behind a region: one slot per page, each either empty (not
//! backed yet) or holding a [`PhysicalFrame`] reference.
//!
//! | Kind | Slots | Frames |
//! |------|-------|--------|
//! | [`Anonymous`](ObjectKind::Anonymous) | empty until first touch (or all filled when committed) | owned, zeroed |
//! | [`PhysicalRange`](ObjectKind::PhysicalRange) | pre-filled | not owned, cacheable |
//! | [`Device`](ObjectKind::Device) | pre-filled | not owned, uncached |
//!
//! The slot table sits behind the object's own lock. It nests inside the
//! address-space lock and outside the frame allocator's lock.

use crate::VmError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::{FrameAllocator, OutOfMemory, PhysicalFrame};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use kernel_sync::{MutexGuard, RawSpin, SpinMutex};

pub(crate) type Slots = Vec<Option<PhysicalFrame>>;
pub(crate) type SlotGuard<'a> = MutexGuard<'a, Slots, RawSpin>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjectKind {
    /// Zero-filled memory owned by the object.
    Anonymous,
    /// A view of memory the allocator does not manage (firmware tables, DMA
    /// buffers set up elsewhere).
    PhysicalRange,
    /// Device registers.
    Device,
}

pub struct MemoryObject {
    kind: ObjectKind,
    lazy: bool,
    frames: Option<Arc<FrameAllocator>>,
    slots: SpinMutex<Slots>,
}

fn page_count(length: u64) -> Result<usize, VmError> {
    if length == 0 || !length.is_multiple_of(FRAME_SIZE) {
        return Err(VmError::InvalidLength(length));
    }
    usize::try_from(length / FRAME_SIZE).map_err(|_| VmError::InvalidLength(length))
}

impl MemoryObject {
    fn with_slots(
        kind: ObjectKind,
        lazy: bool,
        frames: Option<Arc<FrameAllocator>>,
        slots: Slots,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            lazy,
            frames,
            slots: SpinMutex::new(slots),
        })
    }

    /// Anonymous memory of `length` bytes, backed page by page on first
    /// touch.
    ///
    /// # Errors
    /// [`VmError::InvalidLength`] unless `length` is a non-zero multiple of
    /// the frame size.
    pub fn create_anonymous(
        frames: &Arc<FrameAllocator>,
        length: u64,
    ) -> Result<Arc<Self>, VmError> {
        let pages = page_count(length)?;
        let mut slots = Vec::with_capacity(pages);
        slots.resize_with(pages, || None);
        Ok(Self::with_slots(
            ObjectKind::Anonymous,
            true,
            Some(Arc::clone(frames)),
            slots,
        ))
    }

    /// Anonymous memory with every page allocated and zeroed up front.
    ///
    /// # Errors
    /// - [`VmError::InvalidLength`] as for [`create_anonymous`](Self::create_anonymous).
    /// - [`VmError::OutOfMemory`]; frames taken so far are returned.
    pub fn create_anonymous_committed(
        frames: &Arc<FrameAllocator>,
        length: u64,
    ) -> Result<Arc<Self>, VmError> {
        let pages = page_count(length)?;
        let slots = (0..pages)
            .map(|_| frames.allocate_zeroed().map(Some))
            .collect::<Result<Slots, _>>()?;
        Ok(Self::with_slots(
            ObjectKind::Anonymous,
            false,
            Some(Arc::clone(frames)),
            slots,
        ))
    }

    /// A cacheable view of `length` bytes of physical memory at `base`.
    ///
    /// # Errors
    /// [`VmError::InvalidLength`], or [`VmError::InvalidOffset`] for a
    /// misaligned `base`.
    pub fn create_for_physical_range(
        base: PhysicalAddress,
        length: u64,
    ) -> Result<Arc<Self>, VmError> {
        Self::unowned(ObjectKind::PhysicalRange, base, length)
    }

    /// Like [`create_for_physical_range`](Self::create_for_physical_range),
    /// but mapped uncached.
    ///
    /// # Errors
    /// As for `create_for_physical_range`.
    pub fn create_for_device(base: PhysicalAddress, length: u64) -> Result<Arc<Self>, VmError> {
        Self::unowned(ObjectKind::Device, base, length)
    }

    fn unowned(kind: ObjectKind, base: PhysicalAddress, length: u64) -> Result<Arc<Self>, VmError> {
        let pages = page_count(length)?;
        if !base.is_frame_aligned() {
            return Err(VmError::InvalidOffset(base.as_u64()));
        }
        if base.checked_add(length).is_none() {
            return Err(VmError::InvalidLength(length));
        }
        let slots = (0..pages as u64)
            .map(|i| Some(PhysicalFrame::unowned(base + i * FRAME_SIZE)))
            .collect();
        Ok(Self::with_slots(kind, false, None, slots))
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Whether the object allocates (and frees) its own frames.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self.kind, ObjectKind::Anonymous)
    }

    /// Whether empty slots are backed on first touch.
    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        self.lazy
    }

    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        !matches!(self.kind, ObjectKind::Device)
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.page_count() as u64 * FRAME_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.page_count() == 0
    }

    /// The frame backing `offset`, if any.
    #[must_use]
    pub fn frame_at(&self, offset: u64) -> Option<PhysicalFrame> {
        let index = slot_index(offset)?;
        self.slots.lock().get(index)?.clone()
    }

    /// The frame backing `offset`, allocating a zeroed one for an empty slot
    /// of a lazy object. Idempotent: later calls return the same frame.
    ///
    /// # Errors
    /// - [`VmError::InvalidOffset`] past the end of the object.
    /// - [`VmError::OutOfMemory`]; the slot stays empty.
    pub fn ensure_backed_at(&self, offset: u64) -> Result<PhysicalFrame, VmError> {
        let mut slots = self.slots.lock();
        let index = slot_index(offset)
            .filter(|&i| i < slots.len())
            .ok_or(VmError::InvalidOffset(offset))?;
        Ok(self.back_slot(&mut slots, index)?.clone())
    }

    /// A new object with its own slot table referencing the same frames.
    ///
    /// Used when an address space is duplicated: both sides then see the
    /// same content and every shared frame has one more holder.
    #[must_use]
    pub fn clone_for_cow(&self) -> Arc<Self> {
        let slots = self.slots.lock().clone();
        Self::with_slots(self.kind, self.lazy, self.frames.clone(), slots)
    }

    /// Number of slots that hold a frame.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    pub(crate) fn lock_slots(&self) -> SlotGuard<'_> {
        self.slots.lock()
    }

    pub(crate) fn allocator(&self) -> Option<&Arc<FrameAllocator>> {
        self.frames.as_ref()
    }

    /// Fill slot `index` if it is empty; the caller holds the slot lock.
    pub(crate) fn back_slot<'s>(
        &self,
        slots: &'s mut SlotGuard<'_>,
        index: usize,
    ) -> Result<&'s PhysicalFrame, OutOfMemory> {
        let slot = &mut slots[index];
        let frame = match slot.take() {
            Some(frame) => frame,
            None => {
                let frames = match &self.frames {
                    Some(frames) if self.lazy => frames,
                    _ => panic!("empty slot {index} in a {:?} object that cannot back it", self.kind),
                };
                frames.allocate_zeroed()?
            }
        };
        Ok(slot.insert(frame))
    }
}

fn slot_index(offset: u64) -> Option<usize> {
    if !offset.is_multiple_of(FRAME_SIZE) {
        return None;
    }
    usize::try_from(offset / FRAME_SIZE).ok()
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObject")
            .field("kind", &self.kind)
            .field("lazy", &self.lazy)
            .field("pages", &self.page_count())
            .field("resident", &self.resident_pages())
            .finish()
    }
}
