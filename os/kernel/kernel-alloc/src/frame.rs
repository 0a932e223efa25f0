use crate::FrameAllocator;
use alloc::sync::Arc;
use core::fmt;
use core::hash::{Hash, Hasher};
use kernel_memory_addresses::PhysicalAddress;

/// Reference-counted handle to one physical frame.
///
/// Cloning bumps an atomic count; dropping the last clone gives the frame back
/// to the allocator it came from. Two handles are equal if they name the same
/// physical address.
///
/// Frames created with [`unowned`](Self::unowned) describe memory the
/// allocator does not manage (device registers, firmware tables); dropping
/// them releases nothing.
#[derive(Clone)]
pub struct PhysicalFrame(Arc<FrameInner>);

struct FrameInner {
    address: PhysicalAddress,
    owner: Option<Arc<FrameAllocator>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(self.address);
        }
    }
}

impl PhysicalFrame {
    pub(crate) fn owned(address: PhysicalAddress, owner: Arc<FrameAllocator>) -> Self {
        Self(Arc::new(FrameInner {
            address,
            owner: Some(owner),
        }))
    }

    /// A handle for memory outside the allocator's zones.
    ///
    /// # Panics
    /// Panics if `address` is not frame aligned.
    #[must_use]
    pub fn unowned(address: PhysicalAddress) -> Self {
        assert!(address.is_frame_aligned(), "misaligned frame {address:?}");
        Self(Arc::new(FrameInner {
            address,
            owner: None,
        }))
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> PhysicalAddress {
        self.0.address
    }

    /// Number of live handles to this frame.
    ///
    /// Only stable while every holder is serialized by the caller (for
    /// copy-on-write that is the memory object's slot lock).
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether dropping the last handle returns the frame to an allocator.
    #[inline]
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.0.owner.is_some()
    }
}

impl PartialEq for PhysicalFrame {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for PhysicalFrame {}

impl Hash for PhysicalFrame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?}, refs={})", self.address(), self.ref_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamArena;

    fn allocator() -> Arc<FrameAllocator> {
        let base = PhysicalAddress::new(0x4000_0000);
        let alloc = Arc::new(FrameAllocator::new(Arc::new(RamArena::new(base, 2))));
        alloc.add_usable_range(base, 2);
        alloc
    }

    #[test]
    fn released_only_after_last_drop() {
        let alloc = allocator();
        let a = alloc.allocate().unwrap();
        let pa = a.address();
        let b = a.clone();
        let c = b.clone();
        assert_eq!(a.ref_count(), 3);

        drop(a);
        drop(b);
        assert!(!alloc.is_free(pa));
        assert_eq!(c.ref_count(), 1);

        drop(c);
        assert!(alloc.is_free(pa));
        assert_eq!(alloc.stats().releases, 1);
    }

    #[test]
    fn unowned_frames_are_never_released() {
        let alloc = allocator();
        let before = alloc.stats();
        let mmio = PhysicalFrame::unowned(PhysicalAddress::new(0xfee0_0000));
        assert!(!mmio.is_owned());
        drop(mmio.clone());
        drop(mmio);
        assert_eq!(alloc.stats(), before);
    }

    #[test]
    fn equality_is_by_address() {
        let alloc = allocator();
        let a = alloc.allocate().unwrap();
        let view = PhysicalFrame::unowned(a.address());
        assert_eq!(a, view);
        assert_ne!(a, alloc.allocate().unwrap());
    }
}
