//! # Kernel Memory Layout
//!
//! Compile-time constants describing how the virtual address space is carved
//! up between user space, the higher-half direct map (HHDM) and the windows the
//! memory manager hands out kernel regions from.
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Null guard (never mapped)      │
//! USER_SPACE_START      ├─────────────────────────────────┤ 0x0000_0000_0000_1000
//!                       │  User Space                     │
//!                       │  (per-process regions)          │
//! USER_SPACE_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  Non-canonical hole             │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  Higher Half Direct Map         │
//! KERNEL_REGIONS_START  ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Kernel regions (allocations,   │
//!                       │  device mappings)               │
//! KERNEL_REGIONS_END    ├─────────────────────────────────┤ 0xffff_e000_0000_0000
//!                       │  Kernel image                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything at or above [`KERNEL_SPACE_START`](memory::KERNEL_SPACE_START)
//! belongs to the kernel address space. On x86-64 the upper-level tables that
//! cover it are shared by every user address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
