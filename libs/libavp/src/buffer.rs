//! Packet buffers and buffer chains.
//!
//! A packet travels across the rings as a singly-linked chain of fixed-size
//! segments. Each segment starts with a 64-byte descriptor followed by its
//! data area:
//!
//! ```text
//! +0   self      u64   host address of this buffer
//! +8   next      u64   host address of the next segment, 0 terminates
//! +16  data      u64   host address of the data area (set by the host)
//! +24  data_len  u16   bytes used in this segment
//! +26  nb_segs   u8    segments in the chain (first segment only)
//! +28  pkt_len   u32   total packet length (first segment only)
//! +32  ol_flags  u64   offload flags
//! +40  vlan_tci  u16   VLAN tag when VLAN_PKT is set
//! ```
//!
//! Links are host addresses. Walking a chain therefore means translating
//! every `next` before it is read, which is what [`ChainWalker`] does.

use crate::addr::{HostAddr, LocalAddr};
use crate::error::{AvpError, Result};
use crate::memory::GuestMemory;
use crate::translate::MempoolTranslator;

/// Size of the descriptor that precedes each segment's data
pub const DESC_LEN: usize = 64;

/// Maximum segments in one packet
pub const MAX_SEGMENTS: usize = 5;

/// Shortest frame put on the wire; shorter frames are zero padded
pub const MIN_FRAME_LEN: usize = 60;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;

/// 802.1Q tag length
pub const VLAN_HLEN: usize = 4;

/// Headroom reserved in front of received packets so the IP header lands
/// on an aligned boundary
pub const RX_ALIGN_PAD: usize = 2;

const OFF_SELF: u64 = 0;
const OFF_NEXT: u64 = 8;
const OFF_DATA: u64 = 16;
const OFF_DATA_LEN: u64 = 24;
const OFF_NB_SEGS: u64 = 26;
const OFF_PKT_LEN: u64 = 28;
const OFF_OL_FLAGS: u64 = 32;
const OFF_VLAN_TCI: u64 = 40;

bitflags::bitflags! {
    /// Offload flags carried in a descriptor
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u64 {
        /// The packet carries a VLAN tag in `vlan_tci`
        const VLAN_PKT = 1 << 0;
    }
}

/// Decoded segment descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferHeader {
    pub self_addr: HostAddr,
    pub next: HostAddr,
    pub data: HostAddr,
    pub data_len: u16,
    pub nb_segs: u8,
    pub pkt_len: u32,
    pub flags: BufferFlags,
    pub vlan_tci: u16,
}

impl BufferHeader {
    /// Read the descriptor at `at`.
    pub fn read(mem: &GuestMemory, at: LocalAddr) -> Result<Self> {
        let mut raw = [0u8; DESC_LEN];
        mem.read(at, &mut raw)?;
        let u64_at = |off: u64| {
            let o = off as usize;
            u64::from_le_bytes(raw[o..o + 8].try_into().unwrap_or([0; 8]))
        };
        let u32_at = |off: u64| {
            let o = off as usize;
            u32::from_le_bytes(raw[o..o + 4].try_into().unwrap_or([0; 4]))
        };
        let u16_at = |off: u64| {
            let o = off as usize;
            u16::from_le_bytes([raw[o], raw[o + 1]])
        };
        Ok(Self {
            self_addr: HostAddr::new(u64_at(OFF_SELF)),
            next: HostAddr::new(u64_at(OFF_NEXT)),
            data: HostAddr::new(u64_at(OFF_DATA)),
            data_len: u16_at(OFF_DATA_LEN),
            nb_segs: raw[OFF_NB_SEGS as usize],
            pkt_len: u32_at(OFF_PKT_LEN),
            flags: BufferFlags::from_bits_truncate(u64_at(OFF_OL_FLAGS)),
            vlan_tci: u16_at(OFF_VLAN_TCI),
        })
    }

    /// Write the descriptor at `at`. Reserved bytes are cleared.
    pub fn write(&self, mem: &GuestMemory, at: LocalAddr) -> Result<()> {
        let mut raw = [0u8; DESC_LEN];
        let mut put = |off: u64, bytes: &[u8]| {
            let o = off as usize;
            raw[o..o + bytes.len()].copy_from_slice(bytes);
        };
        put(OFF_SELF, &self.self_addr.as_u64().to_le_bytes());
        put(OFF_NEXT, &self.next.as_u64().to_le_bytes());
        put(OFF_DATA, &self.data.as_u64().to_le_bytes());
        put(OFF_DATA_LEN, &self.data_len.to_le_bytes());
        put(OFF_NB_SEGS, &[self.nb_segs]);
        put(OFF_PKT_LEN, &self.pkt_len.to_le_bytes());
        put(OFF_OL_FLAGS, &self.flags.bits().to_le_bytes());
        put(OFF_VLAN_TCI, &self.vlan_tci.to_le_bytes());
        mem.write(at, &raw)
    }

    /// VLAN tag if the VLAN flag is set
    pub fn vlan(&self) -> Option<u16> {
        self.flags
            .contains(BufferFlags::VLAN_PKT)
            .then_some(self.vlan_tci)
    }
}

/// One segment of a chain, resolved for reading.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub header: BufferHeader,
    /// Host address of the segment descriptor
    pub host: HostAddr,
    /// Translated address of the data area
    pub data: LocalAddr,
}

/// Iterates over the segments of a chain, translating each link.
///
/// The walk stops with [`AvpError::CorruptChain`] rather than following
/// more than [`MAX_SEGMENTS`] links, so a looping chain cannot hang a
/// poller.
pub struct ChainWalker<'a> {
    mem: &'a GuestMemory,
    mempool: &'a MempoolTranslator,
    segment_size: usize,
    next: Option<HostAddr>,
    visited: usize,
}

impl<'a> ChainWalker<'a> {
    pub fn new(
        mem: &'a GuestMemory,
        mempool: &'a MempoolTranslator,
        segment_size: usize,
        head: HostAddr,
    ) -> Self {
        Self {
            mem,
            mempool,
            segment_size,
            next: head.non_null(),
            visited: 0,
        }
    }

    fn resolve(&self, host: HostAddr) -> Result<Segment> {
        let local = self.mempool.translate_range(host, DESC_LEN as u64)?;
        let header = BufferHeader::read(self.mem, local)?;
        if header.data_len as usize > self.segment_size {
            return Err(AvpError::CorruptChain {
                addr: host,
                reason: "segment length exceeds segment size",
            });
        }
        let data = self
            .mempool
            .translate_range(header.data, header.data_len as u64)?;
        Ok(Segment { header, host, data })
    }
}

impl Iterator for ChainWalker<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = self.next.take()?;
        if self.visited == MAX_SEGMENTS {
            return Some(Err(AvpError::CorruptChain {
                addr: host,
                reason: "chain longer than the segment limit",
            }));
        }
        self.visited += 1;
        match self.resolve(host) {
            Ok(segment) => {
                self.next = segment.header.next.non_null();
                Some(Ok(segment))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// A stack-owned packet.
///
/// Received packets are allocated with a fixed capacity; appending past it
/// fails instead of growing, which is how a chain whose segment lengths
/// disagree with its total length is caught.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    capacity: usize,
    vlan_tci: Option<u16>,
}

impl Packet {
    /// Allocate an empty packet able to hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity + RX_ALIGN_PAD),
            capacity,
            vlan_tci: None,
        }
    }

    /// Wrap an already built frame.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            capacity: data.len(),
            data,
            vlan_tci: None,
        }
    }

    /// Attach a VLAN tag
    pub fn with_vlan(mut self, tci: u16) -> Self {
        self.vlan_tci = Some(tci);
        self
    }

    pub fn set_vlan(&mut self, tci: Option<u16>) {
        self.vlan_tci = tci;
    }

    pub fn vlan(&self) -> Option<u16> {
        self.vlan_tci
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Append bytes, failing if capacity would be exceeded.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let attempted = self.data.len() + bytes.len();
        if attempted > self.capacity {
            return Err(AvpError::PacketOverflow {
                capacity: self.capacity,
                attempted,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append `len` bytes read straight out of shared memory.
    pub(crate) fn append_from(&mut self, mem: &GuestMemory, src: LocalAddr, len: usize) -> Result<()> {
        let start = self.data.len();
        let attempted = start + len;
        if attempted > self.capacity {
            return Err(AvpError::PacketOverflow {
                capacity: self.capacity,
                attempted,
            });
        }
        self.data.resize(attempted, 0);
        if let Err(e) = mem.read(src, &mut self.data[start..]) {
            self.data.truncate(start);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedRegion;
    use crate::translate::MemoryPoolDescriptor;
    use std::sync::Arc;

    const HOST_BASE: u64 = 0x7f00_0000;
    const LOCAL_BASE: u64 = 0x4000_0000;
    const STRIDE: u64 = (DESC_LEN + 128) as u64;

    fn setup(buffers: u64) -> (GuestMemory, MempoolTranslator) {
        let len = (STRIDE * buffers) as usize;
        let mut mem = GuestMemory::new();
        mem.add_region(Arc::new(SharedRegion::new_zeroed(LocalAddr::new(LOCAL_BASE), len)))
            .unwrap();
        let mut mempool = MempoolTranslator::new();
        mempool
            .register(MemoryPoolDescriptor::new(
                HostAddr::new(HOST_BASE),
                LocalAddr::new(LOCAL_BASE),
                len as u64,
            ))
            .unwrap();
        (mem, mempool)
    }

    fn host(i: u64) -> HostAddr {
        HostAddr::new(HOST_BASE + i * STRIDE)
    }

    fn local(i: u64) -> LocalAddr {
        LocalAddr::new(LOCAL_BASE + i * STRIDE)
    }

    fn write_segment(mem: &GuestMemory, i: u64, next: HostAddr, payload: &[u8]) {
        let header = BufferHeader {
            self_addr: host(i),
            next,
            data: host(i).add(DESC_LEN as u64),
            data_len: payload.len() as u16,
            ..Default::default()
        };
        header.write(mem, local(i)).unwrap();
        mem.write(local(i).add(DESC_LEN as u64), payload).unwrap();
    }

    #[test]
    fn test_header_layout() {
        let (mem, _) = setup(1);
        let header = BufferHeader {
            self_addr: host(0),
            next: HostAddr::NULL,
            data: host(0).add(64),
            data_len: 952,
            nb_segs: 2,
            pkt_len: 3000,
            flags: BufferFlags::VLAN_PKT,
            vlan_tci: 0x0064,
        };
        header.write(&mem, local(0)).unwrap();

        let region = mem.region(local(0), DESC_LEN).unwrap();
        assert_eq!(region.read_u16(local(0).add(24)).unwrap(), 952);
        assert_eq!(region.read_u32(local(0).add(28)).unwrap(), 3000);
        assert_eq!(region.read_u16(local(0).add(40)).unwrap(), 0x0064);
        assert_eq!(BufferHeader::read(&mem, local(0)).unwrap(), header);
        assert_eq!(header.vlan(), Some(0x0064));
    }

    #[test]
    fn test_walk_chain() {
        let (mem, mempool) = setup(3);
        write_segment(&mem, 0, host(1), b"abc");
        write_segment(&mem, 1, host(2), b"de");
        write_segment(&mem, 2, HostAddr::NULL, b"f");

        let segments: Vec<_> = ChainWalker::new(&mem, &mempool, 128, host(0))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].host, host(2));
        assert_eq!(segments[1].header.data_len, 2);
    }

    #[test]
    fn test_walk_detects_loop() {
        let (mem, mempool) = setup(2);
        write_segment(&mem, 0, host(1), b"x");
        write_segment(&mem, 1, host(0), b"y");

        let result: Result<Vec<_>> = ChainWalker::new(&mem, &mempool, 128, host(0)).collect();
        assert!(matches!(result, Err(AvpError::CorruptChain { .. })));
    }

    #[test]
    fn test_walk_rejects_foreign_link() {
        let (mem, mempool) = setup(1);
        write_segment(&mem, 0, HostAddr::new(0xdead_0000), b"x");

        let result: Result<Vec<_>> = ChainWalker::new(&mem, &mempool, 128, host(0)).collect();
        assert!(matches!(result, Err(AvpError::Untranslatable(_))));
    }

    #[test]
    fn test_packet_capacity_enforced() {
        let mut packet = Packet::with_capacity(4);
        packet.append(b"abc").unwrap();
        assert!(matches!(
            packet.append(b"de"),
            Err(AvpError::PacketOverflow { capacity: 4, attempted: 5 })
        ));
        assert_eq!(packet.data(), b"abc");
    }
}
