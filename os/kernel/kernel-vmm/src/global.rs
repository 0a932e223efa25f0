//! The boot-time handle to the one [`MemoryManager`].
//!
//! Boot code builds the manager and calls [`init`] once; fault handlers and
//! other late code reach it through [`get`].

use crate::MemoryManager;
use kernel_sync::SyncOnceCell;

static MANAGER: SyncOnceCell<MemoryManager> = SyncOnceCell::new();

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("memory manager already initialized")]
pub struct AlreadyInitialized;

/// Publish `manager`.
///
/// # Errors
/// [`AlreadyInitialized`] on every call after the first; the rejected manager
/// is dropped.
pub fn init(manager: MemoryManager) -> Result<&'static MemoryManager, AlreadyInitialized> {
    MANAGER.set(manager).map_err(|rejected| {
        log::warn!("memory manager initialized twice");
        drop(rejected);
        AlreadyInitialized
    })
}

/// The published manager, if [`init`] has run.
#[must_use]
pub fn get() -> Option<&'static MemoryManager> {
    MANAGER.get()
}
