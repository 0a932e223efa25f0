use kernel_alloc::OutOfMemory;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::MapError;

/// Errors of mapping requests.
///
/// All of them are reported before any state is changed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    /// The range is outside the address space's window or overlaps a region.
    #[error("invalid range {0}")]
    InvalidRange(VirtualRange),
    /// Zero or not a multiple of the frame size.
    #[error("invalid length {0:#x}")]
    InvalidLength(u64),
    /// Misaligned, or past the end of the memory object.
    #[error("invalid object offset {0:#x}")]
    InvalidOffset(u64),
    #[error("misaligned address {0}")]
    Misaligned(VirtualAddress),
    #[error("no region at {0}")]
    NoRegion(VirtualAddress),
    /// A user address space was asked to map kernel memory.
    #[error("kernel address space is off limits")]
    KernelSpace,
}

impl From<OutOfMemory> for VmError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for VmError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::Misaligned(va) => Self::Misaligned(va),
            MapError::KernelHalf(_) => Self::KernelSpace,
        }
    }
}
