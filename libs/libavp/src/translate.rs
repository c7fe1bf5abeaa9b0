//! Host-to-guest address translation.
//!
//! A translator is a small table of registered ranges, each mapped with a
//! fixed offset: `local = local_base + (addr - host_base)`. It is not a page
//! table. Every range is assumed to be contiguously mapped on both sides.
//!
//! A device carries two tables:
//!
//! - [`Domain::DeviceMemory`]: built from the memory-map block, used for the
//!   rings and the control scratch buffer.
//! - [`Domain::Mempool`]: built from the memory-pool descriptors in the
//!   device-info block, used for packet buffers and their data areas.

use crate::addr::{HostAddr, LocalAddr};
use crate::error::{AvpError, Result};

/// Maximum number of memory pools the host may publish
pub const MAX_MEMPOOLS: usize = 8;

/// Maximum number of memory-map entries
pub const MAX_MAPS: usize = 64;

/// One registered range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryPoolDescriptor {
    /// Base address on the host side
    pub host_base: HostAddr,
    /// Base address on the guest side
    pub local_base: LocalAddr,
    /// Length in bytes
    pub len: u64,
}

impl MemoryPoolDescriptor {
    pub const fn new(host_base: HostAddr, local_base: LocalAddr, len: u64) -> Self {
        Self {
            host_base,
            local_base,
            len,
        }
    }

    /// Check whether `addr` falls inside `[host_base, host_base + len)`.
    pub fn contains(&self, addr: HostAddr) -> bool {
        let start = self.host_base.as_u64();
        addr.as_u64() >= start && addr.as_u64() - start < self.len
    }

    fn overlaps(&self, other: &MemoryPoolDescriptor) -> bool {
        let a_start = self.host_base.as_u64();
        let a_end = a_start.saturating_add(self.len);
        let b_start = other.host_base.as_u64();
        let b_end = b_start.saturating_add(other.len);
        a_start < b_end && b_start < a_end
    }
}

/// Which table a translation goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    /// Rings and scratch buffer
    DeviceMemory,
    /// Packet buffers
    Mempool,
}

/// A fixed-capacity table of non-overlapping ranges.
#[derive(Clone, Debug, Default)]
pub struct AddressTranslator<const N: usize> {
    pools: heapless::Vec<MemoryPoolDescriptor, N>,
}

impl<const N: usize> AddressTranslator<N> {
    pub fn new() -> Self {
        Self {
            pools: heapless::Vec::new(),
        }
    }

    /// Register a range. Zero-length and overlapping ranges are rejected.
    pub fn register(&mut self, desc: MemoryPoolDescriptor) -> Result<()> {
        if desc.len == 0 {
            return Err(AvpError::InvalidDeviceInfo(format!(
                "zero-length pool at {}",
                desc.host_base
            )));
        }
        if self.pools.iter().any(|p| p.overlaps(&desc)) {
            return Err(AvpError::PoolOverlap(desc.host_base));
        }
        self.pools
            .push(desc)
            .map_err(|_| AvpError::TooManyPools(N))
    }

    /// Translate a host address.
    ///
    /// An address outside every registered range is a protocol violation:
    /// it can only come from a corrupted ring or a desynchronized peer.
    pub fn translate(&self, addr: HostAddr) -> Result<LocalAddr> {
        self.pools
            .iter()
            .find(|p| p.contains(addr))
            .map(|p| p.local_base.add(addr.as_u64() - p.host_base.as_u64()))
            .ok_or(AvpError::Untranslatable(addr))
    }

    /// Translate `[addr, addr + len)`, which must sit inside a single range.
    pub fn translate_range(&self, addr: HostAddr, len: u64) -> Result<LocalAddr> {
        let pool = self
            .pools
            .iter()
            .find(|p| p.contains(addr))
            .ok_or(AvpError::Untranslatable(addr))?;
        let offset = addr.as_u64() - pool.host_base.as_u64();
        if offset.saturating_add(len) > pool.len {
            return Err(AvpError::Untranslatable(addr.add(len)));
        }
        Ok(pool.local_base.add(offset))
    }

    /// Registered ranges
    pub fn pools(&self) -> &[MemoryPoolDescriptor] {
        &self.pools
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Memory-map table (rings, scratch buffer)
pub type MemMapTranslator = AddressTranslator<MAX_MAPS>;

/// Memory-pool table (packet buffers)
pub type MempoolTranslator = AddressTranslator<MAX_MEMPOOLS>;

/// Both translation tables of a device.
#[derive(Clone, Debug, Default)]
pub struct Translators {
    pub memmap: MemMapTranslator,
    pub mempool: MempoolTranslator,
}

impl Translators {
    pub fn translate(&self, domain: Domain, addr: HostAddr) -> Result<LocalAddr> {
        match domain {
            Domain::DeviceMemory => self.memmap.translate(addr),
            Domain::Mempool => self.mempool.translate(addr),
        }
    }

    pub fn translate_range(&self, domain: Domain, addr: HostAddr, len: u64) -> Result<LocalAddr> {
        match domain {
            Domain::DeviceMemory => self.memmap.translate_range(addr, len),
            Domain::Mempool => self.mempool.translate_range(addr, len),
        }
    }
}
