//! # Memory Layout

use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, VirtualRange};

/// Lowest user-space address handed out. The page at zero stays unmapped so
/// null dereferences fault.
pub const USER_SPACE_START: u64 = 0x0000_0000_0000_1000;

/// Exclusive end of the user-space window (end of the canonical lower half).
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// First kernel-space address (start of the canonical upper half).
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window kernel regions are allocated from.
pub const KERNEL_REGIONS_START: u64 = 0xffff_c000_0000_0000;

/// Exclusive end of the kernel region window.
pub const KERNEL_REGIONS_END: u64 = 0xffff_e000_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// The window user regions must lie in.
#[must_use]
pub const fn user_window() -> VirtualRange {
    VirtualRange::from_bounds(
        VirtualAddress::new(USER_SPACE_START),
        VirtualAddress::new(USER_SPACE_END),
    )
}

/// The window kernel regions are placed in.
#[must_use]
pub const fn kernel_window() -> VirtualRange {
    VirtualRange::from_bounds(
        VirtualAddress::new(KERNEL_REGIONS_START),
        VirtualAddress::new(KERNEL_REGIONS_END),
    )
}

const _: () = {
    assert!(USER_SPACE_START.is_multiple_of(FRAME_SIZE));
    assert!(USER_SPACE_END.is_multiple_of(FRAME_SIZE));
    assert!(USER_SPACE_END <= KERNEL_SPACE_START);
    assert!(HHDM_BASE >= KERNEL_SPACE_START);
    assert!(KERNEL_REGIONS_START > HHDM_BASE);
    assert!(KERNEL_REGIONS_END <= KERNEL_BASE);
    assert!(KERNEL_REGIONS_START.is_multiple_of(FRAME_SIZE));
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_do_not_overlap() {
        let user = user_window();
        let kernel = kernel_window();
        assert!(!user.overlaps(&kernel));
        assert!(user.contains(VirtualAddress::new(0x1000)));
        assert!(!user.contains(VirtualAddress::new(0)));
        assert!(kernel.contains(VirtualAddress::new(KERNEL_REGIONS_START)));
        assert!(!kernel.contains(VirtualAddress::new(KERNEL_REGIONS_END)));
    }
}
