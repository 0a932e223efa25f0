//! # x86-64 paging entries
//!
//! PML4 → PDPT → PD → PT, 512 entries per level. The same bit layout serves
//! every level; the walker never creates huge pages, so `PS` stays 0.
//!
//! Permissions intersect along the walk, so intermediate entries are always
//! present + writable, with `U/S` set for lower-half (user) subtrees. The leaf
//! decides the effective rights.
//!
//! The upper-half PML4 entries of every user tree are copied from the kernel
//! tree, which is why the kernel's top-level tables must exist before the
//! first user tree is created (see
//! [`preallocate_top_level`](crate::PageTableTree::preallocate_top_level)).

use crate::{EntryFormat, PageFlags, Translation};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{FRAME_SHIFT, PhysicalAddress, VirtualAddress};

/// Raw x86-64 page-table entry (any level, 4 KiB granule).
///
/// Reference: AMD APM Vol. 2 §5.3, Intel SDM Vol. 3A §4.5.
#[bitfield(u64)]
pub struct X86Entry {
    /// **Present** (bit 0).
    pub present: bool,
    /// **Read/Write** (bit 1).
    pub writable: bool,
    /// **User/Supervisor** (bit 2).
    pub user: bool,
    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,
    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,
    /// **Accessed** (bit 5), set by the CPU.
    pub accessed: bool,
    /// **Dirty** (bit 6), set by the CPU on leaf entries.
    pub dirty: bool,
    /// **Page Size** (bit 7) in PDPTE/PDE; PAT in PTE.
    pub huge: bool,
    /// **Global** (bit 8).
    pub global: bool,
    /// Bits 9..11, ignored by hardware.
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame number (bits 12..51).
    #[bits(40)]
    pub frame_number: u64,
    /// Bits 52..62, ignored by hardware (no protection keys).
    #[bits(11)]
    pub os_available_high: u16,
    /// **No-Execute** (bit 63), honoured with `EFER.NXE`.
    pub no_execute: bool,
}

/// [`EntryFormat`] for x86-64 4-level paging.
#[derive(Debug)]
pub enum X86Format {}

impl EntryFormat for X86Format {
    const SHARES_KERNEL_HALF: bool = true;

    fn table(pa: PhysicalAddress, user: bool) -> u64 {
        X86Entry::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame_number(pa.frame_number())
            .into_bits()
    }

    fn next_table(raw: u64) -> Option<PhysicalAddress> {
        let e = X86Entry::from_bits(raw);
        (e.present() && !e.huge()).then(|| PhysicalAddress::new(e.frame_number() << FRAME_SHIFT))
    }

    fn leaf(pa: PhysicalAddress, flags: PageFlags) -> u64 {
        X86Entry::new()
            .with_present(true)
            .with_writable(flags.writable())
            .with_user(flags.user())
            .with_write_through(flags.cache_disabled())
            .with_cache_disable(flags.cache_disabled())
            .with_global(flags.global())
            .with_frame_number(pa.frame_number())
            .with_no_execute(!flags.executable())
            .into_bits()
    }

    fn decode_leaf(raw: u64) -> Option<Translation> {
        let e = X86Entry::from_bits(raw);
        e.present().then(|| Translation {
            address: PhysicalAddress::new(e.frame_number() << FRAME_SHIFT),
            flags: PageFlags::new()
                .with_writable(e.writable())
                .with_user(e.user())
                .with_executable(!e.no_execute())
                .with_cache_disabled(e.cache_disable())
                .with_global(e.global()),
        })
    }

    #[allow(unused_variables)]
    fn invalidate(va: VirtualAddress) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}
