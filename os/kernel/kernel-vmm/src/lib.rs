//! # Virtual memory
//!
//! Address spaces, the regions in them and the memory objects behind those
//! regions, on top of [`kernel_alloc`] frames and [`kernel_vmem`] page tables.
//!
//! ```text
//! MemoryManager ── kernel AddressSpace, fault entry, temporary mappings
//!      │
//! AddressSpace ── PageTableTree + sorted, non-overlapping Regions
//!      │
//! Region ── range, Access, copy-on-write flag ──► Arc<MemoryObject>
//!                                                      │
//!                                         slots: Option<PhysicalFrame>
//! ```
//!
//! Memory objects own their frames; page-table entries only cache what the
//! slots say. Duplicating an address space shares the frames of private
//! regions copy-on-write; the first write to a shared page gives the writer a
//! private copy.
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::{FrameAllocator, RamArena};
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::X86PageTable;
//! use kernel_vmm::{Access, FaultKind, FaultOutcome, MemoryManager, MemoryManagerConfig, Placement};
//!
//! let base = PhysicalAddress::new(0x100_0000);
//! let frames = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, 256))));
//! frames.add_usable_range(base, 256);
//! let mm = MemoryManager::<X86PageTable>::new(frames, MemoryManagerConfig::default()).unwrap();
//!
//! let space = mm.create_user_space().unwrap();
//! let va = space
//!     .allocate_region(Placement::Anywhere, 0x2000, Access::read_write().with_user(true), "heap")
//!     .unwrap();
//! assert!(space.translate(va).is_none());
//!
//! let fault = FaultKind::write_access().with_user(true);
//! assert_eq!(mm.handle_page_fault(&space, va, fault), FaultOutcome::Resolved);
//! assert!(space.translate(va).unwrap().flags.writable());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod access;
mod address_space;
mod error;
mod fault;
pub mod global;
mod manager;
mod memory_object;
mod region;

pub use access::Access;
pub use address_space::{AddressSpace, AddressSpaceId, Placement, SpaceKind};
pub use error::VmError;
pub use fault::{FaultError, FaultKind, FaultOutcome, FaultReport, TerminationHandler};
pub use manager::{KernelFaultPolicy, MemoryManager, MemoryManagerConfig};
pub use memory_object::{MemoryObject, ObjectKind};
pub use region::Region;
