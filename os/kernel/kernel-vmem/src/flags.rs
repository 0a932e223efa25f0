use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Architecture-neutral permissions and attributes of one leaf mapping.
///
/// Readability is implied by presence; every format encodes these bits its
/// own way.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    /// Stores are allowed.
    pub writable: bool,
    /// Accessible from user mode.
    pub user: bool,
    /// Instruction fetch is allowed.
    pub executable: bool,
    /// Device memory: uncached, strongly ordered.
    pub cache_disabled: bool,
    /// Survives address-space switches in the TLB.
    pub global: bool,
    #[bits(3)]
    __: u8,
}

/// What a present leaf entry maps to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    pub address: PhysicalAddress,
    pub flags: PageFlags,
}
