use kernel_alloc::OutOfMemory;
use kernel_memory_addresses::VirtualAddress;

/// Why a page-table update was refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame for a missing intermediate table.
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    /// Virtual or physical address not frame aligned.
    #[error("misaligned mapping at {0}")]
    Misaligned(VirtualAddress),
    /// A user tree was asked to map kernel-half addresses.
    #[error("{0} belongs to the kernel half")]
    KernelHalf(VirtualAddress),
}

impl From<OutOfMemory> for MapError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}
