//! # Physical memory
//!
//! Everything below the page tables:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ FrameAllocator                               │
//! │  • per-zone bitmaps behind a ticket lock     │
//! │  • allocate / allocate_zeroed / release      │
//! └───────────────┬──────────────────────────────┘
//!                 │ hands out
//! ┌───────────────▼──────────────────────────────┐
//! │ PhysicalFrame (Arc-counted, Eq by address)   │
//! └───────────────┬──────────────────────────────┘
//!                 │ accessed through
//! ┌───────────────▼──────────────────────────────┐
//! │ PhysMapper → TemporaryMapping                │
//! │  • HHDM in the kernel, RamArena when hosted  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::{FrameAllocator, RamArena};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let base = PhysicalAddress::new(0x10_0000);
//! let frames = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, 16))));
//! frames.add_usable_range(base, 16);
//!
//! let frame = frames.allocate_zeroed().unwrap();
//! assert!(frames.map_temporary(&frame).as_bytes().iter().all(|&b| b == 0));
//! drop(frame);
//! assert_eq!(frames.stats().free, 16);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod frame;
mod frame_alloc;
mod phys_mapper;
mod ram_arena;
mod temporary;

pub use frame::PhysicalFrame;
pub use frame_alloc::{FrameAllocator, FrameStats, OutOfMemory};
pub use phys_mapper::{HhdmPhysMapper, PhysMapper};
pub use ram_arena::RamArena;
pub use temporary::TemporaryMapping;
