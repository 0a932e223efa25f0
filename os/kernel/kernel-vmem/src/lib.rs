//! # Page-table trees
//!
//! The architecture-specific half of virtual memory. Everything above this
//! crate talks to page tables through [`PageTableTree`] only:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | [`lookup`](PageTableTree::lookup) | Translate one page. |
//! | [`install`](PageTableTree::install) | Map one page, allocating missing tables. |
//! | [`clear`](PageTableTree::clear) | Unmap one page. |
//! | [`allocate_subtable`](PageTableTree::allocate_subtable) | Build the table chain for a page. |
//!
//! Two formats ship: [`X86PageTable`] (PML4) and [`Aarch64PageTable`]
//! (4 KiB granule). [`NativePageTable`] picks the one for the build target,
//! falling back to x86-64 on hosts that are neither.
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::{FrameAllocator, RamArena};
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! use kernel_vmem::{PageFlags, PageTableTree, X86PageTable};
//!
//! let base = PhysicalAddress::new(0x10_0000);
//! let frames = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, 8))));
//! frames.add_usable_range(base, 8);
//!
//! let mut tree = X86PageTable::new_kernel(&frames).unwrap();
//! let va = VirtualAddress::new(0x40_0000);
//! tree.install(va, PhysicalAddress::new(0x20_0000), PageFlags::new().with_writable(true)).unwrap();
//! assert_eq!(tree.lookup(va).unwrap().address, PhysicalAddress::new(0x20_0000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod aarch64;
mod error;
mod flags;
mod radix;
mod tree;
mod x86_64;

pub use aarch64::{Aarch64Descriptor, Aarch64Format};
pub use error::MapError;
pub use flags::{PageFlags, Translation};
pub use radix::{EntryFormat, RadixPageTable};
pub use tree::PageTableTree;
pub use x86_64::{X86Entry, X86Format};

pub type X86PageTable = RadixPageTable<X86Format>;
pub type Aarch64PageTable = RadixPageTable<Aarch64Format>;

#[cfg(target_arch = "aarch64")]
pub type NativePageTable = Aarch64PageTable;

#[cfg(not(target_arch = "aarch64"))]
pub type NativePageTable = X86PageTable;
