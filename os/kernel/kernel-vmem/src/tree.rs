use crate::{MapError, PageFlags, Translation};
use alloc::sync::Arc;
use kernel_alloc::FrameAllocator;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualRange};

/// One address space's multi-level translation structure.
///
/// The tree owns the frames holding its own tables. Leaf entries are only a
/// view: they name the mapped frames but hold no reference to them, so the
/// caller keeps mapped frames alive for as long as they are installed.
///
/// Changes to a tree that is active on some CPU take effect after the
/// implementation's TLB maintenance; callers need not flush themselves.
pub trait PageTableTree: Sized + Send + Sync {
    /// Root tree of the kernel address space.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the root table cannot be allocated.
    fn new_kernel(frames: &Arc<FrameAllocator>) -> Result<Self, MapError>;

    /// A user tree that sees `kernel`'s mappings in the upper half, where the
    /// architecture requires that.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the root table cannot be allocated.
    fn new_user(frames: &Arc<FrameAllocator>, kernel: &Self) -> Result<Self, MapError>;

    /// Physical address of the root table (CR3 / TTBR value).
    fn root(&self) -> PhysicalAddress;

    /// The leaf mapping of the page containing `va`, if present.
    fn lookup(&self, va: VirtualAddress) -> Option<Translation>;

    /// Map the page at `va` to the frame at `pa`, replacing any previous
    /// leaf. Missing intermediate tables are allocated.
    ///
    /// # Errors
    /// - [`MapError::Misaligned`] for unaligned `va` or `pa`.
    /// - [`MapError::KernelHalf`] if a user tree is asked for an upper-half page.
    /// - [`MapError::OutOfMemory`] if an intermediate table cannot be allocated.
    fn install(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError>;

    /// Remove the leaf for the page containing `va`, returning what it mapped.
    fn clear(&mut self, va: VirtualAddress) -> Option<Translation>;

    /// Make sure every table down to the leaf level exists for `va`.
    ///
    /// # Errors
    /// As for [`install`](Self::install), minus misalignment.
    fn allocate_subtable(&mut self, va: VirtualAddress) -> Result<(), MapError>;

    /// Allocate the top-level subtables that cover `range`, so trees created
    /// later share them.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`].
    fn preallocate_top_level(&mut self, range: VirtualRange) -> Result<(), MapError>;

    /// Number of table frames this tree owns (root included).
    fn table_frames(&self) -> usize;
}
