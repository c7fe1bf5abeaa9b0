//! Address types for the two sides of the shared-memory boundary.
//!
//! Every address carried inside a ring entry or a buffer descriptor is a
//! [`HostAddr`]: it belongs to the host's address space and means nothing to
//! the guest until it has been passed through an
//! [`AddressTranslator`](crate::translate::AddressTranslator). Only a
//! [`LocalAddr`] may be dereferenced, and only through
//! [`GuestMemory`](crate::memory::GuestMemory).

use core::fmt;

/// An address in the host (peer) address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HostAddr(u64);

impl HostAddr {
    /// The null address, used to terminate buffer chains.
    pub const NULL: HostAddr = HostAddr(0);

    /// Create a new host address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Map the null address to `None`
    pub const fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{:#x}", self.0)
    }
}

/// An address in the guest's own (local) address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LocalAddr(u64);

impl LocalAddr {
    /// Create a new local address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Check alignment
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{:#x}", self.0)
    }
}

/// A packet buffer resolved into both domains.
///
/// The host address is what goes back onto a ring; the local address is what
/// gets dereferenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRef {
    /// Address as published by the host
    pub host: HostAddr,
    /// Translated guest-local address
    pub local: LocalAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handling() {
        assert!(HostAddr::NULL.is_null());
        assert_eq!(HostAddr::NULL.non_null(), None);
        assert_eq!(HostAddr::new(0x40).non_null(), Some(HostAddr::new(0x40)));
    }

    #[test]
    fn test_alignment() {
        assert!(LocalAddr::new(0x1000).is_aligned(8));
        assert!(!LocalAddr::new(0x1004).is_aligned(8));
        assert_eq!(LocalAddr::new(0x1000).add(0x10).as_u64(), 0x1010);
    }
}
