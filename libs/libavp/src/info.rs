//! Device-info and memory-map blocks published by the host.
//!
//! Both blocks are magic-tagged and little-endian. The device-info block
//! describes where the rings live, how large packet buffers are and which
//! memory pools packet buffers come from; the memory-map block says how the
//! host's physical ranges are laid out inside the guest's data region.
//!
//! Device-info layout:
//!
//! ```text
//! +0    magic           u32        0x2013_1975
//! +4    version         u32        major << 16 | minor
//! +8    device_id       u64
//! +16   ifname          [u8; 32]   NUL padded
//! +48   ethaddr         [u8; 6]
//! +54   mode            u8         0 guest, 1 host, 2 trace
//! +56   features        u32
//! +60   min_rx, max_rx, min_tx, max_tx   u8 each
//! +64   tx_phys, rx_phys, alloc_phys, free_phys   u64 each
//! +96   tx_size, rx_size, alloc_size, free_size   u32 each (bytes per ring)
//! +112  req_phys, resp_phys, sync_phys, sync_va   u64 each
//! +144  mbuf_size       u32
//! +148  max_rx_pkt_len  u32
//! +152  pool_count      u32
//! +160  pools           [{addr u64, phys u64, len u64}; 8]
//! ```

use crate::addr::{HostAddr, LocalAddr};
use crate::error::{AvpError, Result};
use crate::memory::SharedRegion;
use crate::translate::{MAX_MAPS, MAX_MEMPOOLS};

/// Device-info block magic
pub const DEVICE_MAGIC: u32 = 0x2013_1975;

/// Memory-map block magic
pub const MEMMAP_MAGIC: u32 = 0x2013_1969;

/// Protocol version spoken by this driver
pub const AVP_VERSION: u32 = (2 << 16) | 1;

/// Hard upper bound on queues per direction
pub const MAX_QUEUES: usize = 8;

/// Length of the interface name field
pub const IFNAME_LEN: usize = 32;

/// Size of the device-info block
pub const DEVICE_INFO_LEN: usize = 160 + MAX_MEMPOOLS * 24;

/// Size of the memory-map block
pub const MEMMAP_LEN: usize = 8 + MAX_MAPS * 16;

/// MMIO register offsets
pub mod regs {
    /// Interrupt mask (write 1 to enable a source)
    pub const INTERRUPT_MASK: u64 = 0x0;
    /// Interrupt status (pending sources)
    pub const INTERRUPT_STATUS: u64 = 0x4;
    /// Migration status written by the host
    pub const MIGRATION_STATUS: u64 = 0x8;
    /// Migration acknowledge written by the guest
    pub const MIGRATION_ACK: u64 = 0xC;
    /// Size of the register window
    pub const LEN: usize = 0x10;
}

bitflags::bitflags! {
    /// Interrupt sources
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        /// A control response is waiting on the response ring
        const RESPONSE = 1 << 0;
        /// The migration status register changed
        const MIGRATION = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Device feature bits
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Features: u32 {
        /// VLAN tag insertion and stripping via buffer metadata
        const VLAN_OFFLOAD = 1 << 0;
    }
}

impl Features {
    /// Features this driver knows how to use
    pub const SUPPORTED: Features = Features::VLAN_OFFLOAD;
}

/// Values of the migration status register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationStatus {
    None,
    Detached,
    Attached,
    Error,
}

impl MigrationStatus {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Detached),
            2 => Some(Self::Attached),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Detached => 1,
            Self::Attached => 2,
            Self::Error => 3,
        }
    }
}

/// Who is on the other end of the rings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    /// Attached to a live host switch
    Guest,
    /// Local placeholder with no peer servicing the control rings
    Host,
    /// Tracing tap, no peer servicing the control rings
    Trace,
}

impl PeerMode {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Guest),
            1 => Ok(Self::Host),
            2 => Ok(Self::Trace),
            other => Err(AvpError::InvalidDeviceInfo(format!("unknown mode {other}"))),
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            Self::Guest => 0,
            Self::Host => 1,
            Self::Trace => 2,
        }
    }
}

/// One memory pool as published by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MempoolInfo {
    /// Host virtual address used in ring entries and buffer links
    pub addr: HostAddr,
    /// Host physical address, looked up in the memory map
    pub phys: HostAddr,
    pub len: u64,
}

/// Decoded device-info block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version: u32,
    pub device_id: u64,
    pub ifname: String,
    pub ethaddr: [u8; 6],
    pub mode: PeerMode,
    pub features: Features,
    pub min_rx_queues: u8,
    pub max_rx_queues: u8,
    pub min_tx_queues: u8,
    pub max_tx_queues: u8,
    pub tx_phys: HostAddr,
    pub rx_phys: HostAddr,
    pub alloc_phys: HostAddr,
    pub free_phys: HostAddr,
    pub tx_size: u32,
    pub rx_size: u32,
    pub alloc_size: u32,
    pub free_size: u32,
    pub req_phys: HostAddr,
    pub resp_phys: HostAddr,
    pub sync_phys: HostAddr,
    pub sync_va: HostAddr,
    pub mbuf_size: u32,
    pub max_rx_pkt_len: u32,
    pub pools: Vec<MempoolInfo>,
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut tmp = [0u8; 8];
    tmp.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(tmp)
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

impl DeviceInfo {
    /// Read and validate the block at the start of `region`.
    pub fn read(region: &SharedRegion) -> Result<Self> {
        let mut raw = vec![0u8; DEVICE_INFO_LEN];
        region.read(region.base(), &mut raw)?;
        Self::decode(&raw)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < DEVICE_INFO_LEN {
            return Err(AvpError::InvalidDeviceInfo(format!(
                "block too short: {} bytes",
                raw.len()
            )));
        }
        let magic = get_u32(raw, 0);
        if magic != DEVICE_MAGIC {
            return Err(AvpError::BadMagic {
                block: "device-info",
                found: magic,
            });
        }
        let version = get_u32(raw, 4);
        if version >> 16 != AVP_VERSION >> 16 {
            return Err(AvpError::UnsupportedVersion(version));
        }

        let name_bytes = &raw[16..16 + IFNAME_LEN];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(IFNAME_LEN);
        let ifname = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| AvpError::InvalidDeviceInfo("interface name is not UTF-8".into()))?
            .to_string();

        let mut ethaddr = [0u8; 6];
        ethaddr.copy_from_slice(&raw[48..54]);

        let pool_count = get_u32(raw, 152) as usize;
        if pool_count > MAX_MEMPOOLS {
            return Err(AvpError::TooManyPools(MAX_MEMPOOLS));
        }
        let pools = (0..pool_count)
            .map(|i| {
                let off = 160 + i * 24;
                MempoolInfo {
                    addr: HostAddr::new(get_u64(raw, off)),
                    phys: HostAddr::new(get_u64(raw, off + 8)),
                    len: get_u64(raw, off + 16),
                }
            })
            .collect();

        let info = Self {
            version,
            device_id: get_u64(raw, 8),
            ifname,
            ethaddr,
            mode: PeerMode::from_raw(raw[54])?,
            features: Features::from_bits_truncate(get_u32(raw, 56)),
            min_rx_queues: raw[60],
            max_rx_queues: raw[61],
            min_tx_queues: raw[62],
            max_tx_queues: raw[63],
            tx_phys: HostAddr::new(get_u64(raw, 64)),
            rx_phys: HostAddr::new(get_u64(raw, 72)),
            alloc_phys: HostAddr::new(get_u64(raw, 80)),
            free_phys: HostAddr::new(get_u64(raw, 88)),
            tx_size: get_u32(raw, 96),
            rx_size: get_u32(raw, 100),
            alloc_size: get_u32(raw, 104),
            free_size: get_u32(raw, 108),
            req_phys: HostAddr::new(get_u64(raw, 112)),
            resp_phys: HostAddr::new(get_u64(raw, 120)),
            sync_phys: HostAddr::new(get_u64(raw, 128)),
            sync_va: HostAddr::new(get_u64(raw, 136)),
            mbuf_size: get_u32(raw, 144),
            max_rx_pkt_len: get_u32(raw, 148),
            pools,
        };
        info.validate()?;
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AvpError::InvalidDeviceInfo(msg));
        if self.min_rx_queues == 0 || self.min_rx_queues > self.max_rx_queues {
            return invalid(format!(
                "rx queue range {}..={}",
                self.min_rx_queues, self.max_rx_queues
            ));
        }
        if self.min_tx_queues == 0 || self.min_tx_queues > self.max_tx_queues {
            return invalid(format!(
                "tx queue range {}..={}",
                self.min_tx_queues, self.max_tx_queues
            ));
        }
        if self.min_rx_queues as usize > MAX_QUEUES || self.min_tx_queues as usize > MAX_QUEUES {
            return invalid(format!("host requires more than {MAX_QUEUES} queues"));
        }
        if (self.mbuf_size as usize) < crate::buffer::MIN_FRAME_LEN || self.mbuf_size > u16::MAX as u32 {
            return invalid(format!("segment size {}", self.mbuf_size));
        }
        if self.max_rx_pkt_len == 0 {
            return invalid("max receive packet length is zero".into());
        }
        if self.pools.is_empty() {
            return invalid("no memory pools".into());
        }
        for (name, size) in [
            ("tx", self.tx_size),
            ("rx", self.rx_size),
            ("alloc", self.alloc_size),
            ("free", self.free_size),
        ] {
            if size == 0 {
                return invalid(format!("{name} ring size is zero"));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; DEVICE_INFO_LEN];
        put_u32(&mut raw, 0, DEVICE_MAGIC);
        put_u32(&mut raw, 4, self.version);
        put_u64(&mut raw, 8, self.device_id);
        let name = self.ifname.as_bytes();
        let n = name.len().min(IFNAME_LEN - 1);
        raw[16..16 + n].copy_from_slice(&name[..n]);
        raw[48..54].copy_from_slice(&self.ethaddr);
        raw[54] = self.mode.as_raw();
        put_u32(&mut raw, 56, self.features.bits());
        raw[60] = self.min_rx_queues;
        raw[61] = self.max_rx_queues;
        raw[62] = self.min_tx_queues;
        raw[63] = self.max_tx_queues;
        put_u64(&mut raw, 64, self.tx_phys.as_u64());
        put_u64(&mut raw, 72, self.rx_phys.as_u64());
        put_u64(&mut raw, 80, self.alloc_phys.as_u64());
        put_u64(&mut raw, 88, self.free_phys.as_u64());
        put_u32(&mut raw, 96, self.tx_size);
        put_u32(&mut raw, 100, self.rx_size);
        put_u32(&mut raw, 104, self.alloc_size);
        put_u32(&mut raw, 108, self.free_size);
        put_u64(&mut raw, 112, self.req_phys.as_u64());
        put_u64(&mut raw, 120, self.resp_phys.as_u64());
        put_u64(&mut raw, 128, self.sync_phys.as_u64());
        put_u64(&mut raw, 136, self.sync_va.as_u64());
        put_u32(&mut raw, 144, self.mbuf_size);
        put_u32(&mut raw, 148, self.max_rx_pkt_len);
        let pools = self.pools.len().min(MAX_MEMPOOLS);
        put_u32(&mut raw, 152, pools as u32);
        for (i, pool) in self.pools.iter().take(pools).enumerate() {
            let off = 160 + i * 24;
            put_u64(&mut raw, off, pool.addr.as_u64());
            put_u64(&mut raw, off + 8, pool.phys.as_u64());
            put_u64(&mut raw, off + 16, pool.len);
        }
        raw
    }

    /// Write the block at the start of `region`.
    pub fn write(&self, region: &SharedRegion) -> Result<()> {
        region.write(region.base(), &self.encode())
    }
}

/// One memory-map entry: a host physical range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemMapEntry {
    pub phys: HostAddr,
    pub len: u64,
}

/// Decoded memory-map block.
///
/// Entry *i* is mapped at local offset `sum(len[0..i])` of the data region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemMap {
    pub entries: Vec<MemMapEntry>,
}

impl MemMap {
    pub fn read(region: &SharedRegion) -> Result<Self> {
        let mut raw = vec![0u8; MEMMAP_LEN];
        region.read(region.base(), &mut raw)?;
        Self::decode(&raw)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(AvpError::InvalidDeviceInfo("memory map too short".into()));
        }
        let magic = get_u32(raw, 0);
        if magic != MEMMAP_MAGIC {
            return Err(AvpError::BadMagic {
                block: "memory-map",
                found: magic,
            });
        }
        let count = get_u32(raw, 4) as usize;
        if count == 0 || count > MAX_MAPS || raw.len() < 8 + count * 16 {
            return Err(AvpError::InvalidDeviceInfo(format!(
                "memory map has {count} entries"
            )));
        }
        let entries = (0..count)
            .map(|i| {
                let off = 8 + i * 16;
                MemMapEntry {
                    phys: HostAddr::new(get_u64(raw, off)),
                    len: get_u64(raw, off + 8),
                }
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; MEMMAP_LEN];
        put_u32(&mut raw, 0, MEMMAP_MAGIC);
        let count = self.entries.len().min(MAX_MAPS);
        put_u32(&mut raw, 4, count as u32);
        for (i, entry) in self.entries.iter().take(count).enumerate() {
            let off = 8 + i * 16;
            put_u64(&mut raw, off, entry.phys.as_u64());
            put_u64(&mut raw, off + 8, entry.len);
        }
        raw
    }

    pub fn write(&self, region: &SharedRegion) -> Result<()> {
        region.write(region.base(), &self.encode())
    }

    /// Local base address of each entry inside the data region.
    ///
    /// Entries are laid out back to back; a map whose entries overflow or
    /// run past the end of the region is rejected.
    pub fn local_bases(&self, data: &SharedRegion) -> Result<Vec<(MemMapEntry, LocalAddr)>> {
        let mut offset = 0u64;
        let mut bases = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let end = offset
                .checked_add(entry.len)
                .filter(|&end| end <= data.len() as u64)
                .ok_or_else(|| {
                    AvpError::InvalidDeviceInfo(format!(
                        "memory map entry {i} ({} bytes at offset {offset:#x}) exceeds the {}-byte data region",
                        entry.len,
                        data.len()
                    ))
                })?;
            bases.push((*entry, data.base().add(offset)));
            offset = end;
        }
        Ok(bases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceInfo {
        DeviceInfo {
            version: AVP_VERSION,
            device_id: 0x42,
            ifname: "avp0".into(),
            ethaddr: [0x02, 0, 0, 0, 0, 1],
            mode: PeerMode::Guest,
            features: Features::VLAN_OFFLOAD,
            min_rx_queues: 1,
            max_rx_queues: 4,
            min_tx_queues: 1,
            max_tx_queues: 4,
            tx_phys: HostAddr::new(0x1000),
            rx_phys: HostAddr::new(0x2000),
            alloc_phys: HostAddr::new(0x3000),
            free_phys: HostAddr::new(0x4000),
            tx_size: 0x100,
            rx_size: 0x100,
            alloc_size: 0x100,
            free_size: 0x100,
            req_phys: HostAddr::new(0x5000),
            resp_phys: HostAddr::new(0x5100),
            sync_phys: HostAddr::new(0x5200),
            sync_va: HostAddr::new(0x7f00_5200),
            mbuf_size: 2048,
            max_rx_pkt_len: 9238,
            pools: vec![MempoolInfo {
                addr: HostAddr::new(0x7f10_0000),
                phys: HostAddr::new(0x10_0000),
                len: 0x10_0000,
            }],
        }
    }

    #[test]
    fn test_device_info_decode() {
        let info = sample();
        let decoded = DeviceInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.ifname, "avp0");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut raw = sample().encode();
        raw[0] ^= 0xff;
        assert!(matches!(
            DeviceInfo::decode(&raw),
            Err(AvpError::BadMagic { block: "device-info", .. })
        ));
    }

    #[test]
    fn test_major_version_mismatch_rejected() {
        let mut info = sample();
        info.version = 3 << 16;
        assert!(matches!(
            DeviceInfo::decode(&info.encode()),
            Err(AvpError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_invalid_queue_range_rejected() {
        let mut info = sample();
        info.min_rx_queues = 5;
        assert!(matches!(
            DeviceInfo::decode(&info.encode()),
            Err(AvpError::InvalidDeviceInfo(_))
        ));
    }

    #[test]
    fn test_memmap_local_bases() {
        let map = MemMap {
            entries: vec![
                MemMapEntry {
                    phys: HostAddr::new(0x10_0000_0000),
                    len: 0x4000,
                },
                MemMapEntry {
                    phys: HostAddr::new(0x20_0000_0000),
                    len: 0x8000,
                },
            ],
        };
        let decoded = MemMap::decode(&map.encode()).unwrap();
        let data = SharedRegion::new_zeroed(LocalAddr::new(0x4000_0000), 0xc000);
        let bases: Vec<_> = decoded
            .local_bases(&data)
            .unwrap()
            .into_iter()
            .map(|(_, local)| local)
            .collect();
        assert_eq!(
            bases,
            vec![LocalAddr::new(0x4000_0000), LocalAddr::new(0x4000_4000)]
        );
    }

    #[test]
    fn test_memmap_outside_data_region_rejected() {
        let data = SharedRegion::new_zeroed(LocalAddr::new(0x4000_0000), 0x1000);
        let entry = |len| MemMapEntry {
            phys: HostAddr::new(0x10_0000_0000),
            len,
        };

        let overflow = MemMap {
            entries: vec![entry(u64::MAX), entry(1), entry(1)],
        };
        assert!(matches!(
            overflow.local_bases(&data),
            Err(AvpError::InvalidDeviceInfo(_))
        ));

        let oversized = MemMap {
            entries: vec![entry(0x800), entry(0x801)],
        };
        assert!(matches!(
            oversized.local_bases(&data),
            Err(AvpError::InvalidDeviceInfo(_))
        ));

        let exact = MemMap {
            entries: vec![entry(0x800), entry(0x800)],
        };
        assert_eq!(exact.local_bases(&data).unwrap().len(), 2);
    }
}
