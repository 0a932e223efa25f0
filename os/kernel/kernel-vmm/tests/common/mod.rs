//! A tiny simulated CPU: loads and stores walk the page tables and take a
//! page fault whenever the walk fails, the way the MMU would.

#![allow(dead_code)]

use kernel_alloc::{FrameAllocator, PhysicalFrame, RamArena};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::X86PageTable;
use kernel_vmm::{
    Access, AddressSpace, FaultKind, FaultOutcome, MemoryManager, MemoryManagerConfig,
};
use std::sync::Arc;

pub type Space = AddressSpace<X86PageTable>;
pub type Manager = MemoryManager<X86PageTable>;

pub const RAM_BASE: u64 = 0x100_0000;

pub fn manager(frames: u64) -> Manager {
    manager_with(frames, MemoryManagerConfig::default())
}

pub fn manager_with(frames: u64, config: MemoryManagerConfig) -> Manager {
    let base = PhysicalAddress::new(RAM_BASE);
    let alloc = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, frames))));
    alloc.add_usable_range(base, frames);
    Manager::new(alloc, config).expect("boot")
}

pub fn user_rw() -> Access {
    Access::read_write().with_user(true)
}

pub fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn access<R>(mm: &Manager, pa: PhysicalAddress, f: impl FnOnce(&mut [u8]) -> R) -> R {
    mm.with_temporary_mapping(&PhysicalFrame::unowned(pa.frame_base()), f)
}

/// User-mode byte load. Faults at most once.
pub fn load(mm: &Manager, space: &Space, at: VirtualAddress) -> Result<u8, FaultOutcome> {
    if space.translate(at).is_none() {
        let outcome = mm.handle_page_fault(space, at, FaultKind::read_access().with_user(true));
        if !outcome.is_resolved() {
            return Err(outcome);
        }
    }
    let t = space.translate(at).expect("resolved fault left no mapping");
    let offset = at.frame_offset() as usize;
    Ok(access(mm, t.address, |bytes| bytes[offset]))
}

/// User-mode byte store. Returns the outcome of the fault it took, if any.
pub fn store(
    mm: &Manager,
    space: &Space,
    at: VirtualAddress,
    byte: u8,
) -> Result<Option<FaultOutcome>, FaultOutcome> {
    let mut taken = None;
    let current = space.translate(at);
    if !current.is_some_and(|t| t.flags.writable()) {
        let kind = FaultKind::write_access()
            .with_user(true)
            .with_present(current.is_some());
        let outcome = mm.handle_page_fault(space, at, kind);
        if !outcome.is_resolved() {
            return Err(outcome);
        }
        taken = Some(outcome);
    }
    let t = space.translate(at).expect("resolved fault left no mapping");
    assert!(t.flags.writable(), "resolved write fault left {at} read-only");
    let offset = at.frame_offset() as usize;
    access(mm, t.address, |bytes| bytes[offset] = byte);
    Ok(taken)
}

pub fn frame_of(space: &Space, at: VirtualAddress) -> PhysicalAddress {
    space.translate(at).expect("page not mapped").address
}
