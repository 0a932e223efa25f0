//! # Generic 4-level radix walker
//!
//! Both supported architectures use the same tree shape with a 4 KiB granule:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L3   |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! Each level is one frame of 512 eight-byte entries. Only the entry
//! encoding differs, which is what [`EntryFormat`] abstracts.
//!
//! Intermediate tables are allocated on first use and kept until the tree is
//! dropped. A tree never frees a table it did not allocate: on formats that
//! share the kernel half, a user tree's upper top-level entries point at the
//! kernel tree's tables.

use crate::{MapError, PageFlags, PageTableTree, Translation};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;
use kernel_alloc::{FrameAllocator, PhysicalFrame};
use kernel_memory_addresses::{FRAME_SHIFT, PhysicalAddress, VirtualAddress, VirtualRange};

const LEVELS: u32 = 4;
const TOP: u32 = LEVELS - 1;
const INDEX_BITS: u32 = 9;
const ENTRIES: usize = 1 << INDEX_BITS;

/// First top-level slot of the upper (kernel) half.
const KERNEL_HALF_FIRST_SLOT: usize = ENTRIES / 2;

/// Binary layout of one architecture's table entries.
pub trait EntryFormat: Send + Sync + 'static {
    /// Whether user trees alias the kernel tree's upper-half top-level
    /// entries. `false` where the kernel half has its own root register.
    const SHARES_KERNEL_HALF: bool;

    /// A non-leaf entry pointing at the table in frame `pa`.
    fn table(pa: PhysicalAddress, user: bool) -> u64;

    /// The next-level table of a non-leaf entry, if present.
    fn next_table(raw: u64) -> Option<PhysicalAddress>;

    /// A present 4 KiB leaf entry.
    fn leaf(pa: PhysicalAddress, flags: PageFlags) -> u64;

    fn decode_leaf(raw: u64) -> Option<Translation>;

    /// Drop any cached translation for the page at `va` on this CPU.
    fn invalidate(va: VirtualAddress);
}

#[allow(clippy::cast_possible_truncation)]
const fn index(va: VirtualAddress, level: u32) -> usize {
    ((va.as_u64() >> (FRAME_SHIFT + INDEX_BITS * level)) as usize) & (ENTRIES - 1)
}

/// [`PageTableTree`] over any [`EntryFormat`].
pub struct RadixPageTable<F: EntryFormat> {
    frames: Arc<FrameAllocator>,
    root: PhysicalFrame,
    subtables: Vec<PhysicalFrame>,
    user: bool,
    _format: PhantomData<fn() -> F>,
}

impl<F: EntryFormat> RadixPageTable<F> {
    fn with_root(frames: &Arc<FrameAllocator>, user: bool) -> Result<Self, MapError> {
        Ok(Self {
            frames: Arc::clone(frames),
            root: frames.allocate_zeroed()?,
            subtables: Vec::new(),
            user,
            _format: PhantomData,
        })
    }

    fn read(&self, table: PhysicalAddress, slot: usize) -> u64 {
        debug_assert!(slot < ENTRIES);
        let mapper = self.frames.mapper();
        // SAFETY: `table` is a table frame reachable from this root; a table
        // frame holds exactly ENTRIES aligned u64 entries.
        unsafe {
            let base = mapper.map_frame(table);
            let raw = base.cast::<u64>().add(slot).read_volatile();
            mapper.unmap_frame(base);
            raw
        }
    }

    fn write(&mut self, table: PhysicalAddress, slot: usize, raw: u64) {
        debug_assert!(slot < ENTRIES);
        let mapper = self.frames.mapper();
        // SAFETY: as in `read`; `&mut self` serializes writers of this tree.
        unsafe {
            let base = mapper.map_frame(table);
            base.cast::<u64>().add(slot).write_volatile(raw);
            mapper.unmap_frame(base);
        }
    }

    const fn check_half(&self, va: VirtualAddress) -> Result<(), MapError> {
        if self.user && va.is_upper_half() {
            Err(MapError::KernelHalf(va))
        } else {
            Ok(())
        }
    }

    /// The leaf table covering `va`, without allocating.
    fn leaf_table(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root.address();
        for level in (1..LEVELS).rev() {
            table = F::next_table(self.read(table, index(va, level)))?;
        }
        Some(table)
    }

    fn ensure_leaf_table(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        self.check_half(va)?;
        let user = !va.is_upper_half();
        let mut table = self.root.address();
        for level in (1..LEVELS).rev() {
            let slot = index(va, level);
            table = match F::next_table(self.read(table, slot)) {
                Some(next) => next,
                None => self.link_new_table(table, slot, user)?,
            };
        }
        Ok(table)
    }

    fn link_new_table(
        &mut self,
        parent: PhysicalAddress,
        slot: usize,
        user: bool,
    ) -> Result<PhysicalAddress, MapError> {
        let frame = self.frames.allocate_zeroed()?;
        let pa = frame.address();
        self.write(parent, slot, F::table(pa, user));
        self.subtables.push(frame);
        log::trace!("linked table {pa:?} into {parent:?}[{slot}]");
        Ok(pa)
    }
}

impl<F: EntryFormat> PageTableTree for RadixPageTable<F> {
    fn new_kernel(frames: &Arc<FrameAllocator>) -> Result<Self, MapError> {
        Self::with_root(frames, false)
    }

    fn new_user(frames: &Arc<FrameAllocator>, kernel: &Self) -> Result<Self, MapError> {
        let mut tree = Self::with_root(frames, true)?;
        if F::SHARES_KERNEL_HALF {
            let (root, kernel_root) = (tree.root.address(), kernel.root.address());
            for slot in KERNEL_HALF_FIRST_SLOT..ENTRIES {
                let raw = kernel.read(kernel_root, slot);
                if raw != 0 {
                    tree.write(root, slot, raw);
                }
            }
        }
        Ok(tree)
    }

    fn root(&self) -> PhysicalAddress {
        self.root.address()
    }

    fn lookup(&self, va: VirtualAddress) -> Option<Translation> {
        let table = self.leaf_table(va)?;
        F::decode_leaf(self.read(table, index(va, 0)))
    }

    fn install(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !va.is_frame_aligned() || !pa.is_frame_aligned() {
            return Err(MapError::Misaligned(va));
        }
        let table = self.ensure_leaf_table(va)?;
        let slot = index(va, 0);
        let previous = self.read(table, slot);
        self.write(table, slot, F::leaf(pa, flags));
        if F::decode_leaf(previous).is_some() {
            F::invalidate(va);
        }
        log::trace!("map {va} -> {pa} {flags:?}");
        Ok(())
    }

    fn clear(&mut self, va: VirtualAddress) -> Option<Translation> {
        let va = va.frame_base();
        self.check_half(va).ok()?;
        let table = self.leaf_table(va)?;
        let slot = index(va, 0);
        let old = F::decode_leaf(self.read(table, slot))?;
        self.write(table, slot, 0);
        F::invalidate(va);
        log::trace!("unmap {va} (was {})", old.address);
        Some(old)
    }

    fn allocate_subtable(&mut self, va: VirtualAddress) -> Result<(), MapError> {
        self.ensure_leaf_table(va.frame_base()).map(|_| ())
    }

    fn preallocate_top_level(&mut self, range: VirtualRange) -> Result<(), MapError> {
        if range.is_empty() {
            return Ok(());
        }
        self.check_half(range.start())?;
        let user = !range.start().is_upper_half();
        let last = VirtualAddress::new(range.end().as_u64() - 1);
        let root = self.root.address();
        for slot in index(range.start(), TOP)..=index(last, TOP) {
            if F::next_table(self.read(root, slot)).is_none() {
                self.link_new_table(root, slot, user)?;
            }
        }
        Ok(())
    }

    fn table_frames(&self) -> usize {
        1 + self.subtables.len()
    }
}

impl<F: EntryFormat> fmt::Debug for RadixPageTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixPageTable")
            .field("root", &self.root.address())
            .field("tables", &self.table_frames())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Aarch64PageTable, X86PageTable};
    use kernel_alloc::RamArena;
    use kernel_memory_addresses::FRAME_SIZE;

    const RAM: u64 = 0x100_0000;

    fn frames(count: u64) -> Arc<FrameAllocator> {
        let base = PhysicalAddress::new(RAM);
        let alloc = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, count))));
        alloc.add_usable_range(base, count);
        alloc
    }

    fn rw_user() -> PageFlags {
        PageFlags::new().with_writable(true).with_user(true)
    }

    fn install_lookup_clear<T: PageTableTree>() {
        let alloc = frames(16);
        let mut tree = T::new_kernel(&alloc).unwrap();
        let va = VirtualAddress::new(0x0000_7fff_0000_3000);
        let pa = PhysicalAddress::new(0x4000_0000);

        assert_eq!(tree.lookup(va), None);
        tree.install(va, pa, rw_user()).unwrap();
        let t = tree.lookup(va + 0x123).unwrap();
        assert_eq!(t.address, pa);
        assert_eq!(t.flags, rw_user());
        assert_eq!(tree.table_frames(), 4);

        // Neighbour shares the leaf table.
        tree.install(va + FRAME_SIZE, pa + FRAME_SIZE, PageFlags::new())
            .unwrap();
        assert_eq!(tree.table_frames(), 4);

        assert_eq!(tree.clear(va).map(|t| t.address), Some(pa));
        assert_eq!(tree.lookup(va), None);
        assert_eq!(tree.clear(va), None);
        assert!(tree.lookup(va + FRAME_SIZE).is_some());
    }

    #[test]
    fn x86_install_lookup_clear() {
        install_lookup_clear::<X86PageTable>();
    }

    #[test]
    fn aarch64_install_lookup_clear() {
        install_lookup_clear::<Aarch64PageTable>();
    }

    #[test]
    fn flags_survive_encoding() {
        fn check<T: PageTableTree>() {
            let alloc = frames(16);
            let mut tree = T::new_kernel(&alloc).unwrap();
            let samples = [
                PageFlags::new(),
                PageFlags::new().with_writable(true),
                PageFlags::new().with_executable(true),
                rw_user(),
                PageFlags::new().with_user(true).with_executable(true),
                PageFlags::new().with_writable(true).with_cache_disabled(true),
                PageFlags::new().with_global(true).with_executable(true),
            ];
            for (i, flags) in samples.into_iter().enumerate() {
                let va = VirtualAddress::new(0x10_0000 + i as u64 * FRAME_SIZE);
                tree.install(va, PhysicalAddress::new(0x9000), flags).unwrap();
                assert_eq!(tree.lookup(va).unwrap().flags, flags, "{flags:?}");
            }
        }
        check::<X86PageTable>();
        check::<Aarch64PageTable>();
    }

    #[test]
    fn misaligned_install_is_rejected() {
        let alloc = frames(8);
        let mut tree = X86PageTable::new_kernel(&alloc).unwrap();
        let va = VirtualAddress::new(0x1001);
        assert_eq!(
            tree.install(va, PhysicalAddress::new(0x2000), PageFlags::new()),
            Err(MapError::Misaligned(va))
        );
        let va = VirtualAddress::new(0x1000);
        assert_eq!(
            tree.install(va, PhysicalAddress::new(0x2010), PageFlags::new()),
            Err(MapError::Misaligned(va))
        );
        assert_eq!(tree.table_frames(), 1);
    }

    #[test]
    fn user_tree_rejects_kernel_half() {
        let alloc = frames(8);
        let kernel = X86PageTable::new_kernel(&alloc).unwrap();
        let mut user = X86PageTable::new_user(&alloc, &kernel).unwrap();
        let va = VirtualAddress::new(0xffff_c000_0000_0000);
        assert_eq!(
            user.install(va, PhysicalAddress::new(0x1000), PageFlags::new()),
            Err(MapError::KernelHalf(va))
        );
        assert_eq!(user.allocate_subtable(va), Err(MapError::KernelHalf(va)));
    }

    #[test]
    fn x86_user_trees_see_preallocated_kernel_half() {
        let alloc = frames(32);
        let mut kernel = X86PageTable::new_kernel(&alloc).unwrap();
        let window = VirtualRange::new(VirtualAddress::new(0xffff_c000_0000_0000), 1 << 40)
            .unwrap();
        kernel.preallocate_top_level(window).unwrap();
        assert_eq!(kernel.table_frames(), 3);

        let user = X86PageTable::new_user(&alloc, &kernel).unwrap();
        assert_eq!(user.table_frames(), 1);

        // A kernel mapping added after the user tree exists is still visible.
        let va = VirtualAddress::new(0xffff_c080_0000_0000);
        kernel
            .install(va, PhysicalAddress::new(0x7000), PageFlags::new())
            .unwrap();
        assert_eq!(user.lookup(va).unwrap().address.as_u64(), 0x7000);

        // Dropping the user tree leaves the kernel's tables alone.
        let before = alloc.stats().free;
        drop(user);
        assert_eq!(alloc.stats().free, before + 1);
        assert!(kernel.lookup(va).is_some());
    }

    #[test]
    fn aarch64_user_trees_do_not_alias_kernel() {
        let alloc = frames(32);
        let mut kernel = Aarch64PageTable::new_kernel(&alloc).unwrap();
        let va = VirtualAddress::new(0xffff_c000_0000_0000);
        kernel
            .install(va, PhysicalAddress::new(0x7000), PageFlags::new())
            .unwrap();
        let user = Aarch64PageTable::new_user(&alloc, &kernel).unwrap();
        assert_eq!(user.lookup(va), None);
    }

    #[test]
    fn dropping_a_tree_returns_every_table() {
        let alloc = frames(32);
        let free = alloc.stats().free;
        {
            let mut tree = X86PageTable::new_kernel(&alloc).unwrap();
            for gib in 0..3u64 {
                tree.allocate_subtable(VirtualAddress::new(gib << 30)).unwrap();
            }
            // root + PDPT + 3 × (PD + PT)
            assert_eq!(tree.table_frames(), 8);
            assert_eq!(alloc.stats().free, free - 8);
        }
        assert_eq!(alloc.stats().free, free);
    }

    #[test]
    fn running_out_of_table_frames_leaves_no_mapping() {
        let alloc = frames(2);
        let mut tree = X86PageTable::new_kernel(&alloc).unwrap();
        let va = VirtualAddress::new(0x4000);
        assert_eq!(
            tree.install(va, PhysicalAddress::new(0x1000), PageFlags::new()),
            Err(MapError::OutOfMemory)
        );
        assert_eq!(tree.lookup(va), None);
    }
}
