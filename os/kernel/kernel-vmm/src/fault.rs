use crate::AddressSpaceId;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_alloc::OutOfMemory;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MapError;

/// What the faulting access was.
///
/// Bit-compatible with the low byte of the x86-64 page-fault error code, so
/// the trap handler can pass `FaultKind::from_bits(code as u8)`. Other
/// architectures build it from their syndrome register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct FaultKind {
    /// The page was present (protection fault) rather than missing.
    ///
    /// Informational: resolution is decided from the page tables, since
    /// another CPU may have resolved the fault in the meantime.
    pub present: bool,
    /// A store caused the fault.
    pub write: bool,
    /// The CPU was in user mode.
    pub user: bool,
    /// A reserved bit was set in some entry.
    pub reserved_bit: bool,
    /// An instruction fetch caused the fault.
    pub instruction_fetch: bool,
    #[bits(3)]
    __: u8,
}

impl FaultKind {
    #[must_use]
    pub const fn read_access() -> Self {
        Self::new()
    }

    #[must_use]
    pub const fn write_access() -> Self {
        Self::new().with_write(true)
    }

    #[must_use]
    pub const fn fetch() -> Self {
        Self::new().with_instruction_fetch(true)
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("access violation")]
    AccessViolation,
    #[error("no region")]
    NoRegion,
}

impl From<OutOfMemory> for FaultError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for FaultError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::Misaligned(_) | MapError::KernelHalf(_) => Self::AccessViolation,
        }
    }
}

/// Result of page-fault handling.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// Mapping installed or upgraded; retry the access.
    Resolved,
    /// A private copy of a shared page was made; retry the access.
    CopyOnWriteResolved,
    /// The access cannot succeed. The faulting process must go.
    Unrecoverable(FaultError),
}

impl FaultOutcome {
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Unrecoverable(_))
    }
}

/// Everything the process layer is told about an unrecoverable fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultReport {
    pub address_space: AddressSpaceId,
    pub address: VirtualAddress,
    pub kind: FaultKind,
    pub error: FaultError,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} at {} ({:?})",
            self.error, self.address_space, self.address, self.kind
        )
    }
}

/// Implemented by the process layer to kill whatever faulted.
pub trait TerminationHandler: Send + Sync {
    /// Called with interrupts disabled; must not sleep.
    fn terminate(&self, report: &FaultReport);
}
