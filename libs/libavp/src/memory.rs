//! Shared memory regions.
//!
//! The PCI collaborator hands the driver a handful of memory-mapped regions
//! (device info, memory map, MMIO registers, and the data region that holds
//! rings and packet buffers). Each is wrapped in a [`SharedRegion`], which is
//! the only place libavp touches raw memory. Accesses are bounds-checked
//! against the region and addressed by [`LocalAddr`].
//!
//! The host writes the same bytes concurrently. Exclusive access to any
//! given range is guaranteed by the ring protocol (ownership transfers at
//! dequeue), not by this type, which is why accessors take `&self`.

use crate::addr::LocalAddr;
use crate::error::{AvpError, Result};
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A contiguous region of memory shared with the host.
pub struct SharedRegion {
    base: LocalAddr,
    len: usize,
    data_ptr: *mut u8,
    // Backing storage for heap-allocated regions; `None` when the region
    // wraps an externally mapped BAR.
    _storage: Option<Box<[u64]>>,
}

// SAFETY: all access goes through bounds-checked raw copies or atomics; the
// ring protocol serializes ownership of any byte range between the two sides.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a zeroed, 8-byte aligned region mapped at `base`.
    pub fn new_zeroed(base: LocalAddr, len: usize) -> Self {
        assert!(len > 0);
        assert!(base.is_aligned(8));
        let words = len.div_ceil(8);
        let mut storage = vec![0u64; words].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr() as *mut u8;
        Self {
            base,
            len,
            data_ptr,
            _storage: Some(storage),
        }
    }

    /// Wrap an externally mapped region.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, 8-byte
    /// aligned, and must stay mapped for the lifetime of the returned value.
    pub unsafe fn from_raw_parts(base: LocalAddr, ptr: *mut u8, len: usize) -> Self {
        Self {
            base,
            len,
            data_ptr: ptr,
            _storage: None,
        }
    }

    /// Local address of the first byte
    pub fn base(&self) -> LocalAddr {
        self.base
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: LocalAddr, len: usize) -> bool {
        self.offset_of(addr, len).is_some()
    }

    fn offset_of(&self, addr: LocalAddr, len: usize) -> Option<usize> {
        let offset = addr.as_u64().checked_sub(self.base.as_u64())?;
        let end = offset.checked_add(len as u64)?;
        if end > self.len as u64 {
            return None;
        }
        Some(offset as usize)
    }

    fn checked_offset(&self, addr: LocalAddr, len: usize) -> Result<usize> {
        self.offset_of(addr, len)
            .ok_or(AvpError::OutOfBounds { addr, len })
    }

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read(&self, addr: LocalAddr, buf: &mut [u8]) -> Result<()> {
        let offset = self.checked_offset(addr, buf.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(self.data_ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `addr`.
    pub fn write(&self, addr: LocalAddr, data: &[u8]) -> Result<()> {
        let offset = self.checked_offset(addr, data.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Fill `len` bytes starting at `addr` with `byte`.
    pub fn fill(&self, addr: LocalAddr, len: usize, byte: u8) -> Result<()> {
        let offset = self.checked_offset(addr, len)?;
        unsafe {
            core::ptr::write_bytes(self.data_ptr.add(offset), byte, len);
        }
        Ok(())
    }

    pub fn read_u16(&self, addr: LocalAddr) -> Result<u16> {
        let mut tmp = [0u8; 2];
        self.read(addr, &mut tmp)?;
        Ok(u16::from_le_bytes(tmp))
    }

    pub fn read_u32(&self, addr: LocalAddr) -> Result<u32> {
        let mut tmp = [0u8; 4];
        self.read(addr, &mut tmp)?;
        Ok(u32::from_le_bytes(tmp))
    }

    pub fn read_u64(&self, addr: LocalAddr) -> Result<u64> {
        let mut tmp = [0u8; 8];
        self.read(addr, &mut tmp)?;
        Ok(u64::from_le_bytes(tmp))
    }

    pub fn write_u16(&self, addr: LocalAddr, v: u16) -> Result<()> {
        self.write(addr, &v.to_le_bytes())
    }

    pub fn write_u32(&self, addr: LocalAddr, v: u32) -> Result<()> {
        self.write(addr, &v.to_le_bytes())
    }

    pub fn write_u64(&self, addr: LocalAddr, v: u64) -> Result<()> {
        self.write(addr, &v.to_le_bytes())
    }

    /// View a 4-byte aligned word as an atomic.
    pub fn atomic_u32(&self, addr: LocalAddr) -> Result<&AtomicU32> {
        if !addr.is_aligned(4) {
            return Err(AvpError::Misaligned(addr));
        }
        let offset = self.checked_offset(addr, 4)?;
        // SAFETY: in bounds, aligned (the base is 8-aligned), and AtomicU32
        // has the same layout as u32.
        Ok(unsafe { &*(self.data_ptr.add(offset) as *const AtomicU32) })
    }

    /// Volatile-style register read (MMIO).
    pub fn load_register(&self, addr: LocalAddr) -> Result<u32> {
        Ok(self.atomic_u32(addr)?.load(Ordering::Acquire))
    }

    /// Volatile-style register write (MMIO).
    pub fn store_register(&self, addr: LocalAddr, v: u32) -> Result<()> {
        self.atomic_u32(addr)?.store(v, Ordering::Release);
        Ok(())
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// The set of regions the guest may dereference.
///
/// Resolution is a linear scan; a device carries one or two regions.
#[derive(Clone, Debug, Default)]
pub struct GuestMemory {
    regions: Vec<Arc<SharedRegion>>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region. Overlapping regions are rejected.
    pub fn add_region(&mut self, region: Arc<SharedRegion>) -> Result<()> {
        let start = region.base().as_u64();
        let end = start + region.len() as u64;
        for existing in &self.regions {
            let existing_start = existing.base().as_u64();
            let existing_end = existing_start + existing.len() as u64;
            if start < existing_end && end > existing_start {
                return Err(AvpError::OutOfBounds {
                    addr: region.base(),
                    len: region.len(),
                });
            }
        }
        self.regions.push(region);
        Ok(())
    }

    /// Find the region holding `[addr, addr + len)`.
    pub fn region(&self, addr: LocalAddr, len: usize) -> Result<&Arc<SharedRegion>> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(AvpError::OutOfBounds { addr, len })
    }

    pub fn read(&self, addr: LocalAddr, buf: &mut [u8]) -> Result<()> {
        self.region(addr, buf.len())?.read(addr, buf)
    }

    pub fn write(&self, addr: LocalAddr, data: &[u8]) -> Result<()> {
        self.region(addr, data.len())?.write(addr, data)
    }

    pub fn fill(&self, addr: LocalAddr, len: usize, byte: u8) -> Result<()> {
        self.region(addr, len)?.fill(addr, len, byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_bounds() {
        let region = SharedRegion::new_zeroed(LocalAddr::new(0x1000), 64);
        region.write_u32(LocalAddr::new(0x1010), 0xdead_beef).unwrap();
        assert_eq!(region.read_u32(LocalAddr::new(0x1010)).unwrap(), 0xdead_beef);

        // Straddling the end
        assert!(region.write_u64(LocalAddr::new(0x103c), 1).is_err());
        // Before the start
        assert!(region.read_u16(LocalAddr::new(0x0fff)).is_err());
    }

    #[test]
    fn test_atomic_alignment() {
        let region = SharedRegion::new_zeroed(LocalAddr::new(0x1000), 16);
        assert!(region.atomic_u32(LocalAddr::new(0x1004)).is_ok());
        assert!(matches!(
            region.atomic_u32(LocalAddr::new(0x1002)),
            Err(AvpError::Misaligned(_))
        ));
    }

    #[test]
    fn test_guest_memory_resolution() {
        let mut mem = GuestMemory::new();
        mem.add_region(Arc::new(SharedRegion::new_zeroed(LocalAddr::new(0x1000), 0x100)))
            .unwrap();
        mem.add_region(Arc::new(SharedRegion::new_zeroed(LocalAddr::new(0x4000), 0x100)))
            .unwrap();

        mem.write(LocalAddr::new(0x4010), b"avp").unwrap();
        let mut out = [0u8; 3];
        mem.read(LocalAddr::new(0x4010), &mut out).unwrap();
        assert_eq!(&out, b"avp");

        // Gap between regions
        assert!(mem.read(LocalAddr::new(0x2000), &mut out).is_err());

        // Overlap rejected
        let overlapping = Arc::new(SharedRegion::new_zeroed(LocalAddr::new(0x1080), 0x100));
        assert!(mem.add_region(overlapping).is_err());
    }
}
