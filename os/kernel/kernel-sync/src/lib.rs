//! # Kernel synchronization primitives
//!
//! Busy-waiting locks for code that may run with interrupts disabled and
//! therefore must never sleep.
//!
//! - [`SpinMutex`]: test-and-test-and-set lock, used for per-object state
//!   (address spaces, memory-object slot tables).
//! - [`TicketMutex`]: FIFO-fair ticket lock, used for the frame allocator's
//!   free set, which every CPU hammers.
//! - [`SyncOnceCell`]: write-once cell for the boot-time memory manager handle.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
