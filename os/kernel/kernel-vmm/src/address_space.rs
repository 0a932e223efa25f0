//! # Address spaces
//!
//! One page-table tree plus the sorted, non-overlapping set of regions
//! installed in it. The whole structure sits behind one spin lock; every
//! public operation takes it exactly once, including the fault path.
//!
//! Lock order: address space → memory object slots → frame allocator.

use crate::{
    Access, FaultError, FaultKind, FaultOutcome, MemoryObject, Region, VmError,
};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_alloc::FrameAllocator;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::SpinMutex;
use kernel_vmem::{PageTableTree, Translation};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an address space in logs and fault reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Where a new region goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Placement {
    /// Lowest free gap in the address space's window.
    Anywhere,
    /// Exactly here, or fail.
    Fixed(VirtualAddress),
}

struct Inner<T> {
    tree: T,
    regions: BTreeMap<VirtualAddress, Region>,
}

impl<T> Inner<T> {
    fn containing(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.range().contains(va))
    }

    /// Only the last region starting before `range` ends can overlap it.
    fn overlaps(&self, range: VirtualRange) -> bool {
        self.regions
            .range(..range.end())
            .next_back()
            .is_some_and(|(_, r)| r.range().overlaps(&range))
    }
}

pub struct AddressSpace<T: PageTableTree> {
    id: AddressSpaceId,
    kind: SpaceKind,
    window: VirtualRange,
    frames: Arc<FrameAllocator>,
    inner: SpinMutex<Inner<T>>,
}

impl<T: PageTableTree> AddressSpace<T> {
    fn with_tree(
        kind: SpaceKind,
        frames: &Arc<FrameAllocator>,
        window: VirtualRange,
        tree: T,
    ) -> Self {
        let space = Self {
            id: AddressSpaceId::next(),
            kind,
            window,
            frames: Arc::clone(frames),
            inner: SpinMutex::new(Inner {
                tree,
                regions: BTreeMap::new(),
            }),
        };
        log::debug!("{}: created {kind:?} space over {window}", space.id);
        space
    }

    /// The kernel address space. Regions are placed inside `window`.
    ///
    /// With `preallocate`, the top-level tables covering `window` are built
    /// right away, so user spaces created later share every kernel mapping.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`].
    pub fn create_for_kernel(
        frames: &Arc<FrameAllocator>,
        window: VirtualRange,
        preallocate: bool,
    ) -> Result<Self, VmError> {
        let mut tree = T::new_kernel(frames)?;
        if preallocate {
            tree.preallocate_top_level(window)?;
        }
        Ok(Self::with_tree(SpaceKind::Kernel, frames, window, tree))
    }

    /// An empty user address space.
    ///
    /// # Errors
    /// - [`VmError::KernelSpace`] if `window` reaches into the upper half.
    /// - [`VmError::OutOfMemory`].
    pub fn create_for_user(
        frames: &Arc<FrameAllocator>,
        kernel: &Self,
        window: VirtualRange,
    ) -> Result<Self, VmError> {
        debug_assert_eq!(kernel.kind, SpaceKind::Kernel);
        if window.is_empty()
            || window.start().is_upper_half()
            || VirtualAddress::new(window.end().as_u64() - 1).is_upper_half()
        {
            return Err(VmError::KernelSpace);
        }
        let tree = T::new_user(frames, &kernel.inner.lock().tree)?;
        Ok(Self::with_tree(SpaceKind::User, frames, window, tree))
    }

    /// Duplicate `parent` for a forked process.
    ///
    /// Private regions over owned memory become copy-on-write on both sides.
    /// Each side gets its own slot table sharing the original frames, so a
    /// later copy never rewrites a table that another private mapping of the
    /// same object reads. Shared regions and views of physical memory are
    /// mapped as they are.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; the parent stays usable, with its private
    /// regions left copy-on-write.
    pub fn clone_from(parent: &Self, kernel: &Self) -> Result<Self, VmError> {
        let mut child = Self::create_for_user(&parent.frames, kernel, parent.window)?;
        let child_id = child.id;
        let child_inner = child.inner.get_mut();

        let mut guard = parent.inner.lock();
        let Inner { tree, regions } = &mut *guard;
        for region in regions.values_mut() {
            let mut copy = if region.object().is_owned() && !region.is_shared() {
                let mut own = region.with_object(region.object().clone_for_cow(), true);
                own.attach(parent.id, parent.kind);
                *region = own;
                // Re-install read-only so the parent's next write faults too.
                region.map_into(tree)?;
                region.with_object(region.object().clone_for_cow(), true)
            } else {
                region.with_object(Arc::clone(region.object()), false)
            };
            copy.attach(child_id, SpaceKind::User);
            copy.map_into(&mut child_inner.tree)?;
            child_inner.regions.insert(copy.start(), copy);
        }
        drop(guard);

        log::debug!(
            "{}: cloned from {} ({} regions)",
            child.id,
            parent.id,
            child.inner.get_mut().regions.len()
        );
        Ok(child)
    }

    #[must_use]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[must_use]
    pub const fn window(&self) -> VirtualRange {
        self.window
    }

    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        self.inner.lock().tree.root()
    }

    /// Add `region`, installing its backed pages.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] if the range leaves the window or overlaps
    ///   an existing region. Nothing is changed.
    /// - [`VmError::OutOfMemory`] if page tables cannot be allocated.
    pub fn add_region(&self, region: Region) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        self.insert(&mut inner, region).map(|_| ())
    }

    fn insert(&self, inner: &mut Inner<T>, mut region: Region) -> Result<VirtualAddress, VmError> {
        let range = region.range();
        if !self.window.contains_range(&range) || inner.overlaps(range) {
            return Err(VmError::InvalidRange(range));
        }
        region.attach(self.id, self.kind);
        region.map_into(&mut inner.tree)?;
        log::debug!(
            "{}: + {} {range} {:?} ({:?})",
            self.id,
            region.name(),
            region.access(),
            region.object().kind()
        );
        inner.regions.insert(range.start(), region);
        Ok(range.start())
    }

    /// Remove `region` and its mappings.
    ///
    /// # Errors
    /// [`VmError::NoRegion`] if no region with that exact range is installed.
    pub fn remove_region(&self, region: &Region) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        match inner.regions.get(&region.start()) {
            Some(r) if r.range() == region.range() => {}
            _ => return Err(VmError::NoRegion(region.start())),
        }
        self.take(&mut inner, region.start());
        Ok(())
    }

    /// Remove the region starting at `start`.
    ///
    /// # Errors
    /// [`VmError::NoRegion`] if no region starts there.
    pub fn unmap_region(&self, start: VirtualAddress) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        self.take(&mut inner, start)
            .map(|_| ())
            .ok_or(VmError::NoRegion(start))
    }

    fn take(&self, inner: &mut Inner<T>, start: VirtualAddress) -> Option<()> {
        let region = inner.regions.remove(&start)?;
        let cleared = region.unmap_from(&mut inner.tree);
        log::debug!("{}: - {} {} ({cleared} pages)", self.id, region.name(), region.range());
        Some(())
    }

    /// Snapshot of the region containing `va`.
    #[must_use]
    pub fn find_region_containing(&self, va: VirtualAddress) -> Option<Region> {
        self.inner.lock().containing(va).cloned()
    }

    /// Snapshot of all regions, in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<Region> {
        self.inner.lock().regions.values().cloned().collect()
    }

    /// Fresh anonymous memory, backed on first touch.
    ///
    /// # Errors
    /// [`VmError::InvalidLength`], [`VmError::Misaligned`],
    /// [`VmError::InvalidRange`] or [`VmError::OutOfMemory`].
    pub fn allocate_region(
        &self,
        placement: Placement,
        length: u64,
        access: Access,
        name: impl Into<String>,
    ) -> Result<VirtualAddress, VmError> {
        let object = MemoryObject::create_anonymous(&self.frames, length)?;
        let mut inner = self.inner.lock();
        let range = self.place(&inner, placement, length)?;
        let region = Region::new(range, object, 0, access, name)?;
        self.insert(&mut inner, region)
    }

    /// Map `length` bytes of a caller-supplied object, starting at byte
    /// `offset` of it. The region is shared across duplication.
    ///
    /// # Errors
    /// As for [`allocate_region`](Self::allocate_region), plus
    /// [`VmError::InvalidOffset`].
    pub fn allocate_region_with_object(
        &self,
        placement: Placement,
        object: Arc<MemoryObject>,
        offset: u64,
        length: u64,
        access: Access,
        name: impl Into<String>,
    ) -> Result<VirtualAddress, VmError> {
        let mut inner = self.inner.lock();
        let range = self.place(&inner, placement, length)?;
        let region = Region::new(range, object, offset, access, name)?.into_shared();
        self.insert(&mut inner, region)
    }

    fn place(
        &self,
        inner: &Inner<T>,
        placement: Placement,
        length: u64,
    ) -> Result<VirtualRange, VmError> {
        if length == 0 || !length.is_multiple_of(FRAME_SIZE) {
            return Err(VmError::InvalidLength(length));
        }
        match placement {
            Placement::Fixed(at) => {
                if !at.is_frame_aligned() {
                    return Err(VmError::Misaligned(at));
                }
                VirtualRange::new(at, length).ok_or(VmError::InvalidLength(length))
            }
            Placement::Anywhere => {
                let mut candidate = self.window.start();
                for region in inner.regions.values() {
                    if region.start().as_u64() >= candidate.as_u64()
                        && region.start() - candidate >= length
                    {
                        break;
                    }
                    if region.range().end().as_u64() > candidate.as_u64() {
                        candidate = region.range().end();
                    }
                }
                VirtualRange::new(candidate, length)
                    .filter(|r| self.window.contains_range(r))
                    .ok_or(VmError::OutOfMemory)
            }
        }
    }

    /// Change the access rights of the region starting at `start` and
    /// rewrite its mappings. Copy-on-write pages stay read-only until their
    /// next write fault.
    ///
    /// # Errors
    /// [`VmError::NoRegion`], or [`VmError::OutOfMemory`] while rebuilding
    /// the mappings (the region is then left unmapped and faults back in).
    pub fn protect_region(&self, start: VirtualAddress, access: Access) -> Result<(), VmError> {
        let mut guard = self.inner.lock();
        let Inner { tree, regions } = &mut *guard;
        let region = regions.get_mut(&start).ok_or(VmError::NoRegion(start))?;
        region.set_access(access);
        region.unmap_from(tree);
        region.map_into(tree)?;
        log::debug!("{}: {} now {access:?}", self.id, region.name());
        Ok(())
    }

    /// Current translation of `va`.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        self.inner.lock().tree.lookup(va)
    }

    /// Resolve a page fault at `va`.
    #[must_use]
    pub fn handle_fault(&self, va: VirtualAddress, kind: FaultKind) -> FaultOutcome {
        let mut guard = self.inner.lock();
        let Inner { tree, regions } = &mut *guard;
        let region = regions
            .range(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.range().contains(va));
        match region {
            Some(region) => region.handle_fault(tree, va, kind),
            None => FaultOutcome::Unrecoverable(FaultError::NoRegion),
        }
    }

    /// Bytes covered by regions.
    #[must_use]
    pub fn amount_virtual(&self) -> u64 {
        self.inner.lock().regions.values().map(Region::len).sum()
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn amount_resident(&self) -> u64 {
        self.residency().0 * FRAME_SIZE
    }

    /// Bytes mapped through frames that have other holders.
    #[must_use]
    pub fn amount_shared(&self) -> u64 {
        self.residency().1 * FRAME_SIZE
    }

    fn residency(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        inner
            .regions
            .values()
            .map(|r| r.residency(&inner.tree))
            .fold((0, 0), |(a, b), (c, d)| (a + c, b + d))
    }

    /// Number of frames held by the page-table tree itself.
    #[must_use]
    pub fn table_frames(&self) -> usize {
        self.inner.lock().tree.table_frames()
    }

    /// Check the structural invariants.
    ///
    /// # Panics
    /// On any violation: overlapping regions, regions outside the window, or
    /// a present entry that disagrees with its memory object.
    pub fn verify(&self) {
        let inner = self.inner.lock();
        let mut previous_end = self.window.start();
        for (start, region) in &inner.regions {
            assert_eq!(*start, region.start(), "{}: region keyed at wrong address", self.id);
            assert!(
                self.window.contains_range(&region.range()),
                "{}: {region:?} outside {}",
                self.id,
                self.window
            );
            assert!(
                region.start().as_u64() >= previous_end.as_u64(),
                "{}: {region:?} overlaps its predecessor",
                self.id
            );
            assert_eq!(region.address_space(), Some(self.id));
            region.audit(&inner.tree);
            previous_end = region.range().end();
        }
    }

    /// Tear the address space down: unmap and drop every region, then return
    /// all page-table frames.
    pub fn destroy(self) {
        debug_assert_eq!(self.kind, SpaceKind::User, "the kernel space is never destroyed");
        drop(self);
    }
}

impl<T: PageTableTree> Drop for AddressSpace<T> {
    fn drop(&mut self) {
        let Inner { tree, regions } = self.inner.get_mut();
        let regions = core::mem::take(regions);
        let cleared: usize = regions.values().map(|r| r.unmap_from(tree)).sum();
        let count = regions.len();
        drop(regions);
        log::debug!(
            "{}: destroyed ({count} regions, {cleared} pages, {} table frames)",
            self.id,
            tree.table_frames()
        );
    }
}

impl<T: PageTableTree> fmt::Debug for AddressSpace<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("window", &self.window)
            .field("regions", &inner.regions.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::RamArena;
    use kernel_info::memory::{kernel_window, user_window};
    use kernel_vmem::X86PageTable;

    type Space = AddressSpace<X86PageTable>;

    fn setup(count: u64) -> (Arc<FrameAllocator>, Space, Space) {
        let base = PhysicalAddress::new(0x100_0000);
        let frames = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, count))));
        frames.add_usable_range(base, count);
        let kernel = Space::create_for_kernel(&frames, kernel_window(), false).unwrap();
        let user = Space::create_for_user(&frames, &kernel, user_window()).unwrap();
        (frames, kernel, user)
    }

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn rw() -> Access {
        Access::read_write().with_user(true)
    }

    #[test]
    fn anywhere_takes_lowest_gap() {
        let (_f, _k, space) = setup(32);
        let a = space.allocate_region(Placement::Anywhere, 2 * FRAME_SIZE, rw(), "a").unwrap();
        assert_eq!(a, va(0x1000));
        let b = space.allocate_region(Placement::Anywhere, FRAME_SIZE, rw(), "b").unwrap();
        assert_eq!(b, va(0x3000));
        space.unmap_region(a).unwrap();
        let c = space.allocate_region(Placement::Anywhere, FRAME_SIZE, rw(), "c").unwrap();
        assert_eq!(c, va(0x1000));
        let d = space.allocate_region(Placement::Anywhere, 2 * FRAME_SIZE, rw(), "d").unwrap();
        assert_eq!(d, va(0x4000));
        space.verify();
    }

    #[test]
    fn overlap_is_rejected_without_change() {
        let (_f, _k, space) = setup(32);
        space
            .allocate_region(Placement::Fixed(va(0x10_000)), 4 * FRAME_SIZE, rw(), "a")
            .unwrap();
        let before = space.amount_virtual();

        for (start, len) in [(0xe000, 3 * FRAME_SIZE), (0x13_000, FRAME_SIZE), (0xf000, 8 * FRAME_SIZE)] {
            let err = space
                .allocate_region(Placement::Fixed(va(start)), len, rw(), "b")
                .unwrap_err();
            assert_eq!(err, VmError::InvalidRange(VirtualRange::new(va(start), len).unwrap()));
        }
        assert_eq!(space.amount_virtual(), before);
        assert_eq!(space.regions().len(), 1);

        // Adjacent is fine.
        space
            .allocate_region(Placement::Fixed(va(0x14_000)), FRAME_SIZE, rw(), "c")
            .unwrap();
        space.verify();
    }

    #[test]
    fn placement_errors() {
        let (_f, _k, space) = setup(16);
        assert_eq!(
            space.allocate_region(Placement::Anywhere, 0, rw(), "x").unwrap_err(),
            VmError::InvalidLength(0)
        );
        assert_eq!(
            space
                .allocate_region(Placement::Fixed(va(0x1800)), FRAME_SIZE, rw(), "x")
                .unwrap_err(),
            VmError::Misaligned(va(0x1800))
        );
        // The null page is outside the user window.
        assert!(matches!(
            space.allocate_region(Placement::Fixed(va(0)), FRAME_SIZE, rw(), "x"),
            Err(VmError::InvalidRange(_))
        ));
    }

    #[test]
    fn find_and_remove() {
        let (_f, _k, space) = setup(16);
        let start = space
            .allocate_region(Placement::Fixed(va(0x40_0000)), 2 * FRAME_SIZE, rw(), "heap")
            .unwrap();
        let region = space.find_region_containing(va(0x40_1fff)).unwrap();
        assert_eq!(region.name(), "heap");
        assert_eq!(region.address_space(), Some(space.id()));
        assert!(space.find_region_containing(va(0x40_2000)).is_none());
        assert!(space.find_region_containing(va(0x3f_ffff)).is_none());

        space.remove_region(&region).unwrap();
        assert_eq!(space.remove_region(&region), Err(VmError::NoRegion(start)));
        assert_eq!(space.unmap_region(start), Err(VmError::NoRegion(start)));
    }

    #[test]
    fn lazy_regions_fault_in_zeroed_pages() {
        let (frames, _k, space) = setup(16);
        let start = space
            .allocate_region(Placement::Anywhere, 2 * FRAME_SIZE, rw(), "bss")
            .unwrap();
        assert_eq!(space.translate(start), None);
        assert_eq!(space.amount_resident(), 0);

        let kind = FaultKind::write_access().with_user(true);
        assert_eq!(space.handle_fault(start + 8, kind), FaultOutcome::Resolved);
        let t = space.translate(start).unwrap();
        assert!(t.flags.writable() && t.flags.user() && !t.flags.executable());
        assert_eq!(space.amount_resident(), FRAME_SIZE);

        // Fault again on the same page: nothing new is allocated.
        let allocations = frames.stats().allocations;
        assert_eq!(space.handle_fault(start, kind), FaultOutcome::Resolved);
        assert_eq!(frames.stats().allocations, allocations);
        space.verify();
    }

    #[test]
    fn access_violations_are_unrecoverable() {
        let (_f, _k, space) = setup(16);
        let ro = space
            .allocate_region(Placement::Anywhere, FRAME_SIZE, Access::read_only().with_user(true), "ro")
            .unwrap();
        let guard = space
            .allocate_region(Placement::Anywhere, FRAME_SIZE, Access::new().with_user(true), "guard")
            .unwrap();
        let violation = FaultOutcome::Unrecoverable(FaultError::AccessViolation);

        assert_eq!(space.handle_fault(ro, FaultKind::write_access().with_user(true)), violation);
        assert_eq!(space.handle_fault(ro, FaultKind::fetch().with_user(true)), violation);
        assert_eq!(space.handle_fault(guard, FaultKind::read_access().with_user(true)), violation);
        assert_eq!(
            space.handle_fault(va(0x7000_0000), FaultKind::read_access()),
            FaultOutcome::Unrecoverable(FaultError::NoRegion)
        );
        assert_eq!(
            space.handle_fault(ro, FaultKind::read_access().with_user(true)),
            FaultOutcome::Resolved
        );
    }

    #[test]
    fn protect_rewrites_entries() {
        let (_f, _k, space) = setup(16);
        let start = space
            .allocate_region(Placement::Anywhere, FRAME_SIZE, rw(), "data")
            .unwrap();
        assert!(space.handle_fault(start, FaultKind::write_access().with_user(true)).is_resolved());
        assert!(space.translate(start).unwrap().flags.writable());

        space.protect_region(start, Access::read_only().with_user(true)).unwrap();
        assert!(!space.translate(start).unwrap().flags.writable());

        space.protect_region(start, Access::new().with_user(true)).unwrap();
        assert_eq!(space.translate(start), None);
        assert_eq!(
            space.protect_region(va(0x9000_0000), rw()),
            Err(VmError::NoRegion(va(0x9000_0000)))
        );
        space.verify();
    }

    #[test]
    fn only_kernel_space_translations_are_global() {
        let (_f, kernel, user) = setup(32);
        let supervisor = Access::read_write();
        let kind = FaultKind::write_access();

        let private = user
            .allocate_region(Placement::Anywhere, FRAME_SIZE, supervisor, "kstack")
            .unwrap();
        assert!(user.handle_fault(private, kind).is_resolved());
        let t = user.translate(private).unwrap();
        assert!(!t.flags.user());
        assert!(!t.flags.global());

        let shared = kernel
            .allocate_region(Placement::Anywhere, FRAME_SIZE, supervisor, "heap")
            .unwrap();
        assert!(kernel.handle_fault(shared, kind).is_resolved());
        assert!(kernel.translate(shared).unwrap().flags.global());
        user.verify();
        kernel.verify();
    }

    #[test]
    fn user_window_must_stay_low() {
        let (frames, kernel, _u) = setup(8);
        assert_eq!(
            Space::create_for_user(&frames, &kernel, kernel_window()).unwrap_err(),
            VmError::KernelSpace
        );
    }
}
