//! # AArch64 translation descriptors (4 KiB granule, 48-bit VA)
//!
//! Levels 0–2 hold table descriptors, level 3 holds page descriptors; both
//! carry `0b11` in bits 1:0. Block descriptors are never produced.
//!
//! User and kernel halves have separate roots (`TTBR0_EL1` and `TTBR1_EL1`),
//! so user trees never alias the kernel tree.
//!
//! Memory attributes index into `MAIR_EL1`, which boot code programs as
//! attribute 0 = normal write-back, attribute 1 = `Device-nGnRE`.

use crate::{EntryFormat, PageFlags, Translation};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{FRAME_SHIFT, PhysicalAddress, VirtualAddress};

const ATTR_NORMAL: u8 = 0;
const ATTR_DEVICE: u8 = 1;
const INNER_SHAREABLE: u8 = 0b11;

/// Raw VMSAv8-64 stage 1 descriptor.
#[bitfield(u64)]
pub struct Aarch64Descriptor {
    /// Bit 0.
    pub valid: bool,
    /// Bit 1: table (levels 0–2) or page (level 3).
    pub table_or_page: bool,
    /// `AttrIndx` (bits 2..4) into `MAIR_EL1`.
    #[bits(3)]
    pub attr_index: u8,
    /// `NS` (bit 5).
    pub non_secure: bool,
    /// `AP[1]` (bit 6): EL0 access.
    pub el0_access: bool,
    /// `AP[2]` (bit 7): read-only.
    pub read_only: bool,
    /// `SH` (bits 8..9).
    #[bits(2)]
    pub shareability: u8,
    /// `AF` (bit 10); a clear flag faults on first access.
    pub access_flag: bool,
    /// `nG` (bit 11): translation is tagged with the ASID.
    pub not_global: bool,
    /// Output address bits 47..12.
    #[bits(36)]
    pub frame_number: u64,
    #[bits(4)]
    __res0: u8,
    /// Bit 52.
    pub contiguous: bool,
    /// `PXN` (bit 53).
    pub privileged_execute_never: bool,
    /// `UXN` (bit 54).
    pub user_execute_never: bool,
    /// Bits 55..58, software use.
    #[bits(4)]
    pub software: u8,
    #[bits(5)]
    __ignored: u8,
}

/// [`EntryFormat`] for AArch64 with a 4 KiB granule.
#[derive(Debug)]
pub enum Aarch64Format {}

impl EntryFormat for Aarch64Format {
    const SHARES_KERNEL_HALF: bool = false;

    fn table(pa: PhysicalAddress, _user: bool) -> u64 {
        Aarch64Descriptor::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_frame_number(pa.frame_number())
            .into_bits()
    }

    fn next_table(raw: u64) -> Option<PhysicalAddress> {
        let d = Aarch64Descriptor::from_bits(raw);
        (d.valid() && d.table_or_page())
            .then(|| PhysicalAddress::new(d.frame_number() << FRAME_SHIFT))
    }

    fn leaf(pa: PhysicalAddress, flags: PageFlags) -> u64 {
        let device = flags.cache_disabled();
        let user = flags.user();
        let exec = flags.executable();
        Aarch64Descriptor::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_attr_index(if device { ATTR_DEVICE } else { ATTR_NORMAL })
            .with_el0_access(user)
            .with_read_only(!flags.writable())
            .with_shareability(if device { 0 } else { INNER_SHAREABLE })
            .with_access_flag(true)
            .with_not_global(!flags.global())
            .with_frame_number(pa.frame_number())
            // The kernel never executes user pages.
            .with_privileged_execute_never(user || !exec)
            .with_user_execute_never(!user || !exec)
            .into_bits()
    }

    fn decode_leaf(raw: u64) -> Option<Translation> {
        let d = Aarch64Descriptor::from_bits(raw);
        if !(d.valid() && d.table_or_page()) {
            return None;
        }
        let user = d.el0_access();
        let exec = if user {
            !d.user_execute_never()
        } else {
            !d.privileged_execute_never()
        };
        Some(Translation {
            address: PhysicalAddress::new(d.frame_number() << FRAME_SHIFT),
            flags: PageFlags::new()
                .with_writable(!d.read_only())
                .with_user(user)
                .with_executable(exec)
                .with_cache_disabled(d.attr_index() == ATTR_DEVICE)
                .with_global(!d.not_global()),
        })
    }

    #[allow(unused_variables)]
    fn invalidate(va: VirtualAddress) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vaae1is, {}",
                "dsb ish",
                "isb",
                in(reg) va.as_u64() >> FRAME_SHIFT,
                options(nostack, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_page() {
        let raw = Aarch64Format::leaf(
            PhysicalAddress::new(0x8000_0000),
            PageFlags::new().with_writable(true).with_user(true),
        );
        let d = Aarch64Descriptor::from_bits(raw);
        assert_eq!(raw & 0b11, 0b11);
        assert!(d.access_flag());
        assert!(d.el0_access());
        assert!(!d.read_only());
        assert!(d.not_global());
        assert!(d.privileged_execute_never());
        assert!(d.user_execute_never());
        assert_eq!(d.shareability(), INNER_SHAREABLE);
        assert_eq!(raw & 0x0000_ffff_ffff_f000, 0x8000_0000);
    }

    #[test]
    fn kernel_text_page() {
        let raw = Aarch64Format::leaf(
            PhysicalAddress::new(0x4000_0000),
            PageFlags::new().with_executable(true).with_global(true),
        );
        let d = Aarch64Descriptor::from_bits(raw);
        assert!(d.read_only());
        assert!(!d.el0_access());
        assert!(!d.privileged_execute_never());
        assert!(d.user_execute_never());
        assert!(!d.not_global());
    }

    #[test]
    fn device_page_uses_device_attribute() {
        let raw = Aarch64Format::leaf(
            PhysicalAddress::new(0x0900_0000),
            PageFlags::new().with_writable(true).with_cache_disabled(true),
        );
        assert_eq!(Aarch64Descriptor::from_bits(raw).attr_index(), ATTR_DEVICE);
    }

    #[test]
    fn block_descriptors_are_not_tables() {
        assert_eq!(Aarch64Format::next_table(0x4000_0001), None);
        assert_eq!(Aarch64Format::decode_leaf(0x4000_0001), None);
    }
}
