use crate::{
    Access, AddressSpace, FaultKind, FaultOutcome, FaultReport, MemoryObject, Placement,
    TerminationHandler, VmError,
};
use alloc::string::String;
use alloc::sync::Arc;
use kernel_alloc::{FrameAllocator, PhysicalFrame};
use kernel_info::memory::{kernel_window, user_window};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_vmem::{NativePageTable, PageTableTree};

/// What to do when code running in kernel mode takes a fault nothing can
/// resolve.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KernelFaultPolicy {
    /// Halt with a diagnostic. The kernel's own memory is not trustworthy any
    /// more.
    Panic,
    /// Treat it like a user fault: report to the termination handler.
    Terminate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryManagerConfig {
    /// Where user regions may be placed.
    pub user_window: VirtualRange,
    /// Where kernel regions are placed.
    pub kernel_window: VirtualRange,
    /// Build the kernel's top-level tables at boot so every user space
    /// created later sees all kernel regions.
    pub preallocate_kernel_tables: bool,
    pub kernel_fault_policy: KernelFaultPolicy,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            user_window: user_window(),
            kernel_window: kernel_window(),
            preallocate_kernel_tables: true,
            kernel_fault_policy: KernelFaultPolicy::Panic,
        }
    }
}

/// The boot-time context of the memory subsystem: frame allocator, kernel
/// address space and the page-fault entry point.
pub struct MemoryManager<T: PageTableTree = NativePageTable> {
    frames: Arc<FrameAllocator>,
    kernel: AddressSpace<T>,
    config: MemoryManagerConfig,
    terminate: Option<Arc<dyn TerminationHandler>>,
}

impl<T: PageTableTree> MemoryManager<T> {
    /// Create the kernel address space over `frames`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the kernel's tables cannot be built.
    pub fn new(frames: Arc<FrameAllocator>, config: MemoryManagerConfig) -> Result<Self, VmError> {
        let kernel = AddressSpace::create_for_kernel(
            &frames,
            config.kernel_window,
            config.preallocate_kernel_tables,
        )?;
        log::info!(
            "memory manager up: {} free frames, kernel space {} (root {})",
            frames.stats().free,
            kernel.id(),
            kernel.root()
        );
        Ok(Self {
            frames,
            kernel,
            config,
            terminate: None,
        })
    }

    /// Install the process layer's hook for unrecoverable faults.
    #[must_use]
    pub fn with_termination_handler(mut self, handler: Arc<dyn TerminationHandler>) -> Self {
        self.terminate = Some(handler);
        self
    }

    #[must_use]
    pub const fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace<T> {
        &self.kernel
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    /// # Errors
    /// [`VmError::OutOfMemory`].
    pub fn create_user_space(&self) -> Result<AddressSpace<T>, VmError> {
        AddressSpace::create_for_user(&self.frames, &self.kernel, self.config.user_window)
    }

    /// Duplicate `parent` copy-on-write, as for `fork`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`].
    pub fn clone_user_space(&self, parent: &AddressSpace<T>) -> Result<AddressSpace<T>, VmError> {
        AddressSpace::clone_from(parent, &self.kernel)
    }

    /// Entry point of the architecture's page-fault handler.
    ///
    /// Unrecoverable faults are handed to the termination handler; the caller
    /// must not resume the faulting context.
    ///
    /// # Panics
    /// On an unrecoverable fault in kernel mode under
    /// [`KernelFaultPolicy::Panic`].
    #[must_use]
    pub fn handle_page_fault(
        &self,
        space: &AddressSpace<T>,
        address: VirtualAddress,
        kind: FaultKind,
    ) -> FaultOutcome {
        let outcome = space.handle_fault(address, kind);
        let FaultOutcome::Unrecoverable(error) = outcome else {
            return outcome;
        };

        let report = FaultReport {
            address_space: space.id(),
            address,
            kind,
            error,
        };
        if !kind.user() && self.config.kernel_fault_policy == KernelFaultPolicy::Panic {
            log::error!("kernel page fault: {report}");
            panic!("kernel page fault: {report}");
        }

        log::warn!("unrecoverable page fault: {report}");
        match &self.terminate {
            Some(handler) => handler.terminate(&report),
            None => log::warn!("no termination handler installed"),
        }
        outcome
    }

    /// Run `f` over the content of `frame`. The mapping is gone when this
    /// returns or unwinds.
    pub fn with_temporary_mapping<R>(
        &self,
        frame: &PhysicalFrame,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let mut mapping = self.frames.map_temporary(frame);
        f(mapping.as_bytes_mut())
    }

    #[must_use]
    pub fn active_temporary_mappings(&self) -> usize {
        self.frames.live_temporary_mappings()
    }

    /// Committed, zeroed memory in the kernel address space. The region is
    /// never reachable from user mode.
    ///
    /// # Errors
    /// [`VmError::InvalidLength`] or [`VmError::OutOfMemory`].
    pub fn allocate_kernel_region(
        &self,
        length: u64,
        access: Access,
        name: impl Into<String>,
    ) -> Result<VirtualAddress, VmError> {
        let object = MemoryObject::create_anonymous_committed(&self.frames, length)?;
        self.kernel.allocate_region_with_object(
            Placement::Anywhere,
            object,
            0,
            length,
            access.with_user(false),
            name,
        )
    }

    /// Map `length` bytes of device registers at `base` into `space`,
    /// uncached.
    ///
    /// # Errors
    /// As for [`MemoryObject::create_for_device`] and
    /// [`AddressSpace::allocate_region_with_object`].
    pub fn map_device(
        &self,
        space: &AddressSpace<T>,
        base: PhysicalAddress,
        length: u64,
        access: Access,
        name: impl Into<String>,
    ) -> Result<VirtualAddress, VmError> {
        let object = MemoryObject::create_for_device(base, length)?;
        space.allocate_region_with_object(Placement::Anywhere, object, 0, length, access, name)
    }
}
