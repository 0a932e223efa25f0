//! # Regions
//!
//! A region binds a page-aligned virtual range of one address space to a
//! window of a [`MemoryObject`]. The object's slot table is the source of
//! truth; the leaf entries in the page-table tree are a cache of it.
//!
//! Copy-on-write regions install every page read-only. A write fault then
//! either upgrades the page in place, when this region's slot is the frame's
//! only holder, or gives the slot a private copy.

use crate::{Access, AddressSpaceId, FaultError, FaultKind, FaultOutcome, MemoryObject, SpaceKind, VmError};
use crate::memory_object::SlotGuard;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use kernel_alloc::PhysicalFrame;
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, VirtualRange};
use kernel_vmem::{PageFlags, PageTableTree, Translation};

#[derive(Clone)]
pub struct Region {
    range: VirtualRange,
    object: Arc<MemoryObject>,
    offset: u64,
    access: Access,
    copy_on_write: bool,
    shared: bool,
    name: String,
    space: Option<AddressSpaceId>,
    global: bool,
}

impl Region {
    /// Bind `range` to `object` starting at byte `offset`.
    ///
    /// The region is private: duplicating its address space makes it
    /// copy-on-write. See [`into_shared`](Self::into_shared).
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for an empty or misaligned range.
    /// - [`VmError::InvalidOffset`] if `offset` is misaligned or the range
    ///   runs past the end of the object.
    pub fn new(
        range: VirtualRange,
        object: Arc<MemoryObject>,
        offset: u64,
        access: Access,
        name: impl Into<String>,
    ) -> Result<Self, VmError> {
        if range.is_empty() || !range.start().is_frame_aligned() || !range.len().is_multiple_of(FRAME_SIZE) {
            return Err(VmError::InvalidRange(range));
        }
        let fits = offset
            .checked_add(range.len())
            .is_some_and(|end| end <= object.len());
        if !offset.is_multiple_of(FRAME_SIZE) || !fits {
            return Err(VmError::InvalidOffset(offset));
        }
        Ok(Self {
            range,
            object,
            offset,
            access,
            copy_on_write: false,
            shared: false,
            name: name.into(),
            space: None,
            global: false,
        })
    }

    /// Mark the region as intentionally shared: a duplicated address space
    /// maps the same object instead of a copy-on-write snapshot.
    #[must_use]
    pub fn into_shared(mut self) -> Self {
        self.shared = true;
        self
    }

    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.range.start()
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.range.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    #[must_use]
    pub const fn object(&self) -> &Arc<MemoryObject> {
        &self.object
    }

    /// Byte offset of the region's first page within the object.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub const fn is_copy_on_write(&self) -> bool {
        self.copy_on_write
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address space this region was added to.
    #[must_use]
    pub const fn address_space(&self) -> Option<AddressSpaceId> {
        self.space
    }

    /// Kernel-space translations are global so they survive address-space
    /// switches.
    pub(crate) fn attach(&mut self, space: AddressSpaceId, kind: SpaceKind) {
        self.space = Some(space);
        self.global = kind == SpaceKind::Kernel;
    }

    pub(crate) const fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    pub(crate) fn with_object(&self, object: Arc<MemoryObject>, copy_on_write: bool) -> Self {
        Self {
            object,
            copy_on_write,
            space: None,
            global: false,
            ..self.clone()
        }
    }

    pub(crate) const fn set_copy_on_write(&mut self, copy_on_write: bool) {
        self.copy_on_write = copy_on_write;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot_index(&self, page: VirtualAddress) -> usize {
        ((self.offset + (page - self.range.start())) / FRAME_SIZE) as usize
    }

    fn page_flags(&self, writable: bool) -> PageFlags {
        PageFlags::new()
            .with_writable(writable)
            .with_user(self.access.user())
            .with_executable(self.access.executable())
            .with_cache_disabled(!self.object.is_cacheable())
            .with_global(self.global)
    }

    /// Install every backed page. Empty slots stay unmapped so the first
    /// touch faults them in.
    ///
    /// On failure the pages installed by this call are removed again.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a page table cannot be allocated, or the
    /// tree's refusal to map the range.
    pub fn map_into<T: PageTableTree>(&self, tree: &mut T) -> Result<(), VmError> {
        if self.access.is_inaccessible() {
            return Ok(());
        }
        let flags = self.page_flags(self.access.writable() && !self.copy_on_write);
        let slots = self.object.lock_slots();
        for (i, page) in self.range.pages().enumerate() {
            let Some(frame) = &slots[self.slot_index(page)] else {
                continue;
            };
            if let Err(e) = tree.install(page, frame.address(), flags) {
                for undo in self.range.pages().take(i) {
                    tree.clear(undo);
                }
                log::warn!("mapping {} at {} failed: {e}", self.name, self.range);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Clear every leaf entry of the range; returns how many were present.
    ///
    /// Frames stay with the memory object.
    pub fn unmap_from<T: PageTableTree>(&self, tree: &mut T) -> usize {
        self.range
            .pages()
            .filter(|&page| tree.clear(page).is_some())
            .count()
    }

    /// Resolve a fault at `va` inside this region.
    #[must_use]
    pub fn handle_fault<T: PageTableTree>(
        &self,
        tree: &mut T,
        va: VirtualAddress,
        kind: FaultKind,
    ) -> FaultOutcome {
        if !self.range.contains(va) {
            return FaultOutcome::Unrecoverable(FaultError::NoRegion);
        }
        if !self.access.permits(kind) {
            log::trace!("{}: {kind:?} at {va} violates {:?}", self.name, self.access);
            return FaultOutcome::Unrecoverable(FaultError::AccessViolation);
        }

        let page = va.frame_base();
        let resolved = if kind.write() && self.copy_on_write {
            self.resolve_copy_on_write(tree, page)
        } else {
            self.resolve_missing(tree, page)
        };
        match resolved {
            Ok(outcome) => {
                log::trace!("{}: {kind:?} at {va} -> {outcome:?}", self.name);
                outcome
            }
            Err(e) => FaultOutcome::Unrecoverable(e),
        }
    }

    fn resolve_missing<T: PageTableTree>(
        &self,
        tree: &mut T,
        page: VirtualAddress,
    ) -> Result<FaultOutcome, FaultError> {
        let index = self.slot_index(page);
        let mut slots = self.object.lock_slots();
        self.check_entry(tree.lookup(page), slots[index].as_ref(), page);

        let frame = self.object.back_slot(&mut slots, index)?;
        let flags = self.page_flags(self.access.writable() && !self.copy_on_write);
        tree.install(page, frame.address(), flags)?;
        Ok(FaultOutcome::Resolved)
    }

    /// The slot lock is held from the sharer check until the slot holds the
    /// private copy, so concurrent writers of this slot copy at most once.
    fn resolve_copy_on_write<T: PageTableTree>(
        &self,
        tree: &mut T,
        page: VirtualAddress,
    ) -> Result<FaultOutcome, FaultError> {
        let Some(frames) = self.object.allocator() else {
            return self.resolve_missing(tree, page);
        };
        let index = self.slot_index(page);
        let writable = self.page_flags(true);
        let mut slots: SlotGuard<'_> = self.object.lock_slots();
        self.check_entry(tree.lookup(page), slots[index].as_ref(), page);

        let current = self.object.back_slot(&mut slots, index)?;
        if current.ref_count() == 1 {
            tree.install(page, current.address(), writable)?;
            return Ok(FaultOutcome::Resolved);
        }

        let copy = frames.allocate()?;
        frames.copy(&copy, current);
        // Map the copy before the old frame can lose its last holder.
        tree.install(page, copy.address(), writable)?;
        let previous = slots[index].replace(copy);
        drop(previous);
        Ok(FaultOutcome::CopyOnWriteResolved)
    }

    /// A present entry must map exactly the frame in its slot.
    fn check_entry(
        &self,
        installed: Option<Translation>,
        slot: Option<&PhysicalFrame>,
        page: VirtualAddress,
    ) {
        let Some(entry) = installed else {
            return;
        };
        match slot {
            Some(frame) if frame.address() == entry.address => {}
            Some(frame) => self.corrupt(
                page,
                format_args!("entry maps {} but the slot holds {}", entry.address, frame.address()),
            ),
            None => self.corrupt(page, format_args!("entry maps {} over an empty slot", entry.address)),
        }
    }

    fn corrupt(&self, page: VirtualAddress, what: fmt::Arguments<'_>) -> ! {
        log::error!("corrupted mapping in {:?}, region {} at {page}: {what}", self.space, self.name);
        panic!("address space corruption in {:?} at {page} ({}): {what}", self.space, self.name);
    }

    /// Check every present page against the slot table.
    pub(crate) fn audit<T: PageTableTree>(&self, tree: &T) {
        let slots = self.object.lock_slots();
        for page in self.range.pages() {
            let entry = tree.lookup(page);
            let slot = slots[self.slot_index(page)].as_ref();
            self.check_entry(entry, slot, page);
        }
    }

    /// `(present pages, present pages whose frame has other holders)`.
    pub(crate) fn residency<T: PageTableTree>(&self, tree: &T) -> (u64, u64) {
        let slots = self.object.lock_slots();
        let mut resident = 0;
        let mut shared = 0;
        for page in self.range.pages() {
            if tree.lookup(page).is_none() {
                continue;
            }
            resident += 1;
            if slots[self.slot_index(page)]
                .as_ref()
                .is_some_and(|f| f.ref_count() > 1)
            {
                shared += 1;
            }
        }
        (resident, shared)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("range", &self.range)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("access", &self.access)
            .field("copy_on_write", &self.copy_on_write)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}
