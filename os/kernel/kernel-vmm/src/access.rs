use crate::FaultKind;
use bitfield_struct::bitfield;

/// Access rights of a region.
///
/// An all-clear value makes a guard region: it reserves address space but is
/// never mapped.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Access {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Reachable from user mode.
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl Access {
    #[must_use]
    pub const fn read_only() -> Self {
        Self::new().with_readable(true)
    }

    #[must_use]
    pub const fn read_write() -> Self {
        Self::new().with_readable(true).with_writable(true)
    }

    #[must_use]
    pub const fn read_execute() -> Self {
        Self::new().with_readable(true).with_executable(true)
    }

    #[must_use]
    pub const fn is_inaccessible(self) -> bool {
        !(self.readable() || self.writable() || self.executable())
    }

    /// Whether an access of `kind` is allowed at all, regardless of the
    /// current page-table state.
    #[must_use]
    pub const fn permits(self, kind: FaultKind) -> bool {
        if kind.user() && !self.user() {
            return false;
        }
        if kind.instruction_fetch() {
            return self.executable();
        }
        if kind.write() {
            return self.writable();
        }
        self.readable() || self.writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits() {
        let rw_user = Access::read_write().with_user(true);
        assert!(rw_user.permits(FaultKind::write_access().with_user(true)));
        assert!(rw_user.permits(FaultKind::read_access()));
        assert!(!rw_user.permits(FaultKind::fetch().with_user(true)));

        let kernel_rw = Access::read_write();
        assert!(!kernel_rw.permits(FaultKind::read_access().with_user(true)));
        assert!(kernel_rw.permits(FaultKind::write_access()));

        assert!(!Access::read_only().permits(FaultKind::write_access()));
        assert!(Access::read_execute().permits(FaultKind::fetch()));
        assert!(!Access::new().permits(FaultKind::read_access()));
        assert!(Access::new().is_inaccessible());
    }
}
