//! Shared-memory FIFO rings.
//!
//! A ring is a fixed-capacity circular array of host addresses living in
//! memory shared with the host:
//!
//! ```text
//! +0   write      u32   producer counter (free running)
//! +4   read       u32   consumer counter (free running)
//! +8   len        u32   capacity, power of two
//! +12  elem_size  u32   always 8
//! +16  entries    u64[len]
//! ```
//!
//! Each ring has exactly one producer role and one consumer role for its
//! whole life. Bulk operations never block: `get`/`put` move as many entries
//! as are available and report how many that was.

use crate::addr::{HostAddr, LocalAddr};
use crate::error::{AvpError, Result};
use crate::memory::SharedRegion;
use core::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

/// Size of the ring header in bytes
pub const FIFO_HEADER_LEN: usize = 16;

/// Size of one ring entry in bytes
pub const FIFO_ENTRY_LEN: usize = 8;

/// Largest ring capacity accepted from the host
pub const MAX_FIFO_CAPACITY: u32 = 1 << 16;

const OFF_WRITE: u64 = 0;
const OFF_READ: u64 = 4;
const OFF_LEN: u64 = 8;
const OFF_ELEM_SIZE: u64 = 12;

/// A handle onto a ring in shared memory.
#[derive(Clone)]
pub struct Fifo {
    region: Arc<SharedRegion>,
    addr: LocalAddr,
    capacity: u32,
    mask: u32,
}

impl Fifo {
    /// Number of bytes a ring of `capacity` entries occupies.
    pub const fn bytes_for(capacity: u32) -> usize {
        FIFO_HEADER_LEN + capacity as usize * FIFO_ENTRY_LEN
    }

    /// Format an empty ring at `addr`.
    ///
    /// Only the side that owns the ring memory (the host, or a test acting
    /// as the host) formats rings; the guest attaches to them.
    pub fn init(region: Arc<SharedRegion>, addr: LocalAddr, capacity: u32) -> Result<Self> {
        validate_capacity(capacity)?;
        if !region.contains(addr, Self::bytes_for(capacity)) {
            return Err(AvpError::OutOfBounds {
                addr,
                len: Self::bytes_for(capacity),
            });
        }
        region.write_u32(addr.add(OFF_WRITE), 0)?;
        region.write_u32(addr.add(OFF_READ), 0)?;
        region.write_u32(addr.add(OFF_LEN), capacity)?;
        region.write_u32(addr.add(OFF_ELEM_SIZE), FIFO_ENTRY_LEN as u32)?;
        Self::attach(region, addr)
    }

    /// Attach to a ring the host has already formatted.
    pub fn attach(region: Arc<SharedRegion>, addr: LocalAddr) -> Result<Self> {
        if !addr.is_aligned(8) {
            return Err(AvpError::Misaligned(addr));
        }
        let capacity = region.read_u32(addr.add(OFF_LEN))?;
        validate_capacity(capacity)?;
        let elem_size = region.read_u32(addr.add(OFF_ELEM_SIZE))?;
        if elem_size as usize != FIFO_ENTRY_LEN {
            return Err(AvpError::CorruptRing {
                addr,
                reason: "unexpected element size",
            });
        }
        if !region.contains(addr, Self::bytes_for(capacity)) {
            return Err(AvpError::OutOfBounds {
                addr,
                len: Self::bytes_for(capacity),
            });
        }

        let fifo = Self {
            region,
            addr,
            capacity,
            mask: capacity - 1,
        };
        if fifo.count() > capacity {
            return Err(AvpError::CorruptRing {
                addr,
                reason: "write index ahead of read index by more than capacity",
            });
        }
        Ok(fifo)
    }

    /// Local address of the ring header
    pub fn addr(&self) -> LocalAddr {
        self.addr
    }

    /// Ring capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write_index(&self) -> &AtomicU32 {
        // Offsets were validated in `attach`.
        self.region
            .atomic_u32(self.addr.add(OFF_WRITE))
            .unwrap_or_else(|_| unreachable!("ring header validated at attach"))
    }

    fn read_index(&self) -> &AtomicU32 {
        self.region
            .atomic_u32(self.addr.add(OFF_READ))
            .unwrap_or_else(|_| unreachable!("ring header validated at attach"))
    }

    fn slot(&self, index: u32) -> LocalAddr {
        let slot = (index & self.mask) as u64;
        self.addr
            .add(FIFO_HEADER_LEN as u64 + slot * FIFO_ENTRY_LEN as u64)
    }

    /// Number of entries currently queued.
    pub fn count(&self) -> u32 {
        let write = self.write_index().load(Ordering::Acquire);
        let read = self.read_index().load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Number of entries that can be inserted.
    pub fn free_count(&self) -> u32 {
        self.capacity.saturating_sub(self.count())
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Dequeue up to `out.len()` entries (consumer side).
    ///
    /// Returns the number of entries written to `out`.
    pub fn get(&self, out: &mut [HostAddr]) -> usize {
        let read = self.read_index().load(Ordering::Relaxed);
        let write = self.write_index().load(Ordering::Acquire);
        let available = write.wrapping_sub(read).min(self.capacity) as usize;
        let n = available.min(out.len());

        for (i, entry) in out.iter_mut().take(n).enumerate() {
            let raw = self
                .region
                .read_u64(self.slot(read.wrapping_add(i as u32)))
                .unwrap_or_else(|_| unreachable!("slot inside validated ring"));
            *entry = HostAddr::new(raw);
        }

        // Entries must be read before the slots are handed back.
        fence(Ordering::Release);
        self.read_index()
            .store(read.wrapping_add(n as u32), Ordering::Release);
        n
    }

    /// Enqueue up to `entries.len()` entries (producer side).
    ///
    /// Returns the number of entries inserted.
    pub fn put(&self, entries: &[HostAddr]) -> usize {
        let write = self.write_index().load(Ordering::Relaxed);
        let read = self.read_index().load(Ordering::Acquire);
        let used = write.wrapping_sub(read);
        let free = self.capacity.saturating_sub(used) as usize;
        let n = free.min(entries.len());

        for (i, entry) in entries.iter().take(n).enumerate() {
            self.region
                .write_u64(self.slot(write.wrapping_add(i as u32)), entry.as_u64())
                .unwrap_or_else(|_| unreachable!("slot inside validated ring"));
        }

        // Entries must be visible before the producer index moves.
        fence(Ordering::Release);
        self.write_index()
            .store(write.wrapping_add(n as u32), Ordering::Release);
        n
    }

    /// Dequeue and discard everything currently queued.
    pub fn drain(&self) -> usize {
        let mut scratch = [HostAddr::NULL; 32];
        let mut total = 0;
        loop {
            let n = self.get(&mut scratch);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }
}

impl core::fmt::Debug for Fifo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fifo")
            .field("addr", &self.addr)
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .finish()
    }
}

fn validate_capacity(capacity: u32) -> Result<()> {
    if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_FIFO_CAPACITY {
        return Err(AvpError::InvalidRingCapacity(capacity));
    }
    Ok(())
}
