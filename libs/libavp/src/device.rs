//! AVP device state and the stack-facing operations.
//!
//! A device owns the regions handed over by the PCI collaborator and, while
//! attached, a [`Datapath`] built from the host's device-info and memory-map
//! blocks. The datapath is rebuilt from scratch at every attach, since a
//! migration moves every ring and every memory pool.

use crate::addr::HostAddr;
use crate::buffer::{ETH_HLEN, VLAN_HLEN};
use crate::control::{ControlChannel, ControlReply, ControlRequest, ControlTiming, Scratch};
use crate::error::{AvpError, Result};
use crate::fifo::{Fifo, FIFO_HEADER_LEN};
use crate::info::{regs, DeviceInfo, Features, MemMap, PeerMode, MAX_QUEUES};
use crate::memory::{GuestMemory, SharedRegion};
use crate::pool::QueuePoller;
use crate::stack::NetStack;
use crate::stats::{PerCpuStats, Stats64, StatsDelta};
use crate::translate::{MemoryPoolDescriptor, Translators};
use crate::tx::MbufCache;
use crate::{control, cpu};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Smallest MTU accepted
pub const MIN_MTU: u32 = 68;

/// Default MTU
pub const DEFAULT_MTU: u32 = 1500;

/// Link-layer bytes on top of the MTU (Ethernet header plus one VLAN tag)
pub const FRAME_OVERHEAD: u32 = (ETH_HLEN + VLAN_HLEN) as u32;

/// Device identifier published by the host
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "avp-{:x}", self.0)
    }
}

/// Device status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Attached and processing packets
    Ok,
    /// Suspended around a migration, or not yet attached
    Detached,
}

const STATUS_OK: u8 = 0;
const STATUS_DETACHED: u8 = 1;

/// Regions delivered by the PCI collaborator.
#[derive(Clone, Debug)]
pub struct DeviceResources {
    /// Device-info block
    pub info: Arc<SharedRegion>,
    /// Memory-map block
    pub memmap: Arc<SharedRegion>,
    /// Interrupt and migration registers
    pub mmio: Arc<SharedRegion>,
    /// Rings, scratch buffer and packet buffers
    pub data: Arc<SharedRegion>,
}

/// Per-device limits taken from the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSettings {
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub control: ControlTiming,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            max_rx_queues: MAX_QUEUES as u16,
            max_tx_queues: MAX_QUEUES as u16,
            control: ControlTiming::default(),
        }
    }
}

/// What was agreed with the host at the last attach.
#[derive(Clone, Debug)]
pub(crate) struct Negotiated {
    pub info: DeviceInfo,
    pub num_rx: u16,
    pub num_tx: u16,
    pub features: Features,
}

impl Negotiated {
    pub fn new(info: DeviceInfo, settings: &DeviceSettings) -> Self {
        let num_rx = negotiate_queues(info.min_rx_queues, info.max_rx_queues, settings.max_rx_queues);
        let num_tx = negotiate_queues(info.min_tx_queues, info.max_tx_queues, settings.max_tx_queues);
        let features = Features::SUPPORTED & info.features;
        Self {
            info,
            num_rx,
            num_tx,
            features,
        }
    }
}

fn negotiate_queues(min: u8, max: u8, limit: u16) -> u16 {
    let upper = (max as usize).min(MAX_QUEUES).min(limit as usize);
    upper.max(min as usize) as u16
}

/// One receive queue: the host fills `rx`, the guest returns buffers on `free`.
pub(crate) struct RxQueue {
    pub rx: Fifo,
    pub free: Fifo,
    // Held while polling so a queue being moved between workers is never
    // polled twice at once
    pub busy: spin::Mutex<()>,
}

/// One transmit queue: the guest fills `tx` with buffers taken from `alloc`.
pub(crate) struct TxQueue {
    pub tx: Fifo,
    pub alloc: Fifo,
    pub cache: spin::Mutex<MbufCache>,
}

/// Everything the guest touches while attached.
pub(crate) struct Datapath {
    pub mem: GuestMemory,
    pub translators: Translators,
    pub segment_size: usize,
    pub rx: Vec<RxQueue>,
    pub tx: Vec<TxQueue>,
    pub control: ControlChannel,
}

impl Datapath {
    /// Map the host's layout into the data region.
    pub fn build(
        resources: &DeviceResources,
        memmap: &MemMap,
        negotiated: &Negotiated,
        timing: ControlTiming,
    ) -> Result<Self> {
        let info = &negotiated.info;
        let data = &resources.data;

        let mut translators = Translators::default();
        for (entry, local) in memmap.local_bases(data)? {
            translators
                .memmap
                .register(MemoryPoolDescriptor::new(entry.phys, local, entry.len))?;
        }
        for pool in &info.pools {
            let local = translators.memmap.translate_range(pool.phys, pool.len)?;
            translators
                .mempool
                .register(MemoryPoolDescriptor::new(pool.addr, local, pool.len))?;
        }

        let mut mem = GuestMemory::new();
        mem.add_region(data.clone())?;

        let ring = |base: HostAddr, stride: u32, index: u16| -> Result<Fifo> {
            let phys = base.add(index as u64 * stride as u64);
            let local = translators
                .memmap
                .translate_range(phys, FIFO_HEADER_LEN as u64)?;
            let fifo = Fifo::attach(data.clone(), local)?;
            if Fifo::bytes_for(fifo.capacity()) > stride as usize {
                return Err(AvpError::InvalidDeviceInfo(format!(
                    "ring at {phys} overruns its {stride}-byte slot"
                )));
            }
            Ok(fifo)
        };

        let rx = (0..negotiated.num_rx)
            .map(|q| {
                Ok(RxQueue {
                    rx: ring(info.rx_phys, info.rx_size, q)?,
                    free: ring(info.free_phys, info.free_size, q)?,
                    busy: spin::Mutex::new(()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let tx = (0..negotiated.num_tx)
            .map(|q| {
                Ok(TxQueue {
                    tx: ring(info.tx_phys, info.tx_size, q)?,
                    alloc: ring(info.alloc_phys, info.alloc_size, q)?,
                    cache: spin::Mutex::new(MbufCache::new()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let request = Fifo::attach(
            data.clone(),
            translators
                .memmap
                .translate_range(info.req_phys, FIFO_HEADER_LEN as u64)?,
        )?;
        let response = Fifo::attach(
            data.clone(),
            translators
                .memmap
                .translate_range(info.resp_phys, FIFO_HEADER_LEN as u64)?,
        )?;
        let scratch = Scratch {
            region: data.clone(),
            local: translators
                .memmap
                .translate_range(info.sync_phys, control::CONTROL_MSG_LEN as u64)?,
            host: info.sync_va,
        };
        let control = ControlChannel::new(request, response, scratch, info.mode, timing);

        Ok(Self {
            mem,
            translators,
            segment_size: info.mbuf_size as usize,
            rx,
            tx,
            control,
        })
    }
}

/// Negotiated configuration, as reported to the management surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    pub ifname: String,
    pub mac: String,
    pub status: DeviceStatus,
    pub mode: PeerMode,
    /// Negotiated feature bits
    pub features: u32,
    /// Feature bits the host advertised
    pub host_features: u32,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    pub segment_size: u32,
    pub max_rx_pkt_len: u32,
    pub mtu: u32,
    pub admin_up: bool,
    pub faulted: bool,
}

/// A guest-side AVP network interface.
pub struct AvpDevice {
    id: DeviceId,
    resources: DeviceResources,
    stack: Arc<dyn NetStack>,
    settings: DeviceSettings,
    status: AtomicU8,
    faulted: AtomicBool,
    admin_up: AtomicBool,
    mtu: AtomicU32,
    datapath: spin::RwLock<Option<Arc<Datapath>>>,
    negotiated: spin::RwLock<Option<Negotiated>>,
    // Serializes attach/detach; both block on control requests
    pub(crate) transition: Mutex<()>,
    pub(crate) stats: PerCpuStats,
}

impl AvpDevice {
    /// Create a detached device. [`attach`](Self::attach) brings it up.
    pub fn new(
        id: DeviceId,
        resources: DeviceResources,
        stack: Arc<dyn NetStack>,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            id,
            resources,
            stack,
            settings,
            status: AtomicU8::new(STATUS_DETACHED),
            faulted: AtomicBool::new(false),
            admin_up: AtomicBool::new(false),
            mtu: AtomicU32::new(DEFAULT_MTU),
            datapath: spin::RwLock::new(None),
            negotiated: spin::RwLock::new(None),
            transition: Mutex::new(()),
            stats: PerCpuStats::new(cpu::available_cpus()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn status(&self) -> DeviceStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_OK => DeviceStatus::Ok,
            _ => DeviceStatus::Detached,
        }
    }

    pub(crate) fn set_status(&self, status: DeviceStatus) {
        let raw = match status {
            DeviceStatus::Ok => STATUS_OK,
            DeviceStatus::Detached => STATUS_DETACHED,
        };
        self.status.store(raw, Ordering::Release);
    }

    /// Whether a protocol violation has stopped the datapath
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub(crate) fn clear_fault(&self) {
        self.faulted.store(false, Ordering::Release);
    }

    /// Latch the device as faulted after a protocol violation.
    pub(crate) fn latch_fault(&self, err: &AvpError, context: &'static str) {
        if !self.faulted.swap(true, Ordering::AcqRel) {
            tracing::error!(device = %self.id, context, error = %err, "Protocol violation, datapath stopped until re-attach");
        }
    }

    pub fn is_admin_up(&self) -> bool {
        self.admin_up.load(Ordering::Acquire)
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    pub(crate) fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub(crate) fn stack(&self) -> &Arc<dyn NetStack> {
        &self.stack
    }

    pub(crate) fn datapath(&self) -> Option<Arc<Datapath>> {
        self.datapath.read().clone()
    }

    pub(crate) fn install_datapath(&self, datapath: Option<Arc<Datapath>>) -> Option<Arc<Datapath>> {
        core::mem::replace(&mut *self.datapath.write(), datapath)
    }

    pub(crate) fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated.read().clone()
    }

    pub(crate) fn set_negotiated(&self, negotiated: Negotiated) {
        *self.negotiated.write() = Some(negotiated);
    }

    /// Record a batch of counter updates on the calling CPU.
    pub(crate) fn record(&self, delta: &StatsDelta) {
        self.stats.record(delta);
    }

    /// Number of receive queues currently set up
    pub fn rx_queue_count(&self) -> u16 {
        self.datapath().map_or(0, |dp| dp.rx.len() as u16)
    }

    /// Number of transmit queues currently set up
    pub fn tx_queue_count(&self) -> u16 {
        self.datapath().map_or(0, |dp| dp.tx.len() as u16)
    }

    /// Buffers held by a transmit queue's cache
    pub fn tx_cache_len(&self, queue: u16) -> Option<usize> {
        let dp = self.datapath()?;
        let q = dp.tx.get(queue as usize)?;
        let len = q.cache.lock().len();
        Some(len)
    }

    /// Write an MMIO register.
    pub(crate) fn write_register(&self, offset: u64, value: u32) -> Result<()> {
        let mmio = &self.resources.mmio;
        mmio.store_register(mmio.base().add(offset), value)
    }

    /// Read an MMIO register.
    pub(crate) fn read_register(&self, offset: u64) -> Result<u32> {
        let mmio = &self.resources.mmio;
        mmio.load_register(mmio.base().add(offset))
    }

    pub(crate) fn mask_interrupts(&self, enabled: crate::info::InterruptStatus) -> Result<()> {
        self.write_register(regs::INTERRUPT_MASK, enabled.bits())
    }

    /// Issue a control request on the current datapath.
    pub fn control(&self, req: &ControlRequest) -> Result<ControlReply> {
        let dp = self.datapath().ok_or(AvpError::Detached)?;
        let result = dp.control.request(req);
        if let Err(e) = &result {
            if e.is_protocol_violation() {
                self.latch_fault(e, "control");
            }
        }
        result
    }

    /// Bring the interface up.
    ///
    /// While detached the request is deferred: the full-config request sent
    /// at the next attach carries the administrative state.
    pub fn open(&self) -> Result<()> {
        if self.status() == DeviceStatus::Detached {
            self.admin_up.store(true, Ordering::Release);
            tracing::info!(device = %self.id, "Open deferred until attach");
            return Ok(());
        }
        self.control(&ControlRequest::NetworkInterface { up: true })?;
        self.admin_up.store(true, Ordering::Release);
        self.stack.set_link(self.id, true);
        tracing::info!(device = %self.id, "Interface up");
        Ok(())
    }

    /// Take the interface down.
    pub fn close(&self) -> Result<()> {
        self.admin_up.store(false, Ordering::Release);
        self.stack.set_link(self.id, false);
        if self.status() == DeviceStatus::Detached {
            return Ok(());
        }
        self.control(&ControlRequest::NetworkInterface { up: false })?;
        tracing::info!(device = %self.id, "Interface down");
        Ok(())
    }

    /// Largest MTU the host's receive packet length allows
    pub fn max_mtu(&self) -> Option<u32> {
        self.negotiated
            .read()
            .as_ref()
            .map(|n| n.info.max_rx_pkt_len.saturating_sub(FRAME_OVERHEAD))
    }

    /// Change the MTU after validating it against the maximum frame size.
    pub fn change_mtu(&self, mtu: u32) -> Result<()> {
        let max = self.max_mtu().ok_or(AvpError::Detached)?;
        if mtu < MIN_MTU || mtu > max {
            return Err(AvpError::InvalidMtu {
                mtu,
                min: MIN_MTU,
                max,
            });
        }
        if self.status() == DeviceStatus::Detached {
            return Err(AvpError::Detached);
        }
        self.control(&ControlRequest::ChangeMtu { mtu })?;
        let old = self.mtu.swap(mtu, Ordering::AcqRel);
        tracing::info!(device = %self.id, old, new = mtu, "MTU changed");
        Ok(())
    }

    /// Aggregated 64-bit statistics
    pub fn stats64(&self) -> Stats64 {
        self.stats.aggregate()
    }

    /// Current negotiated configuration
    pub fn config(&self) -> Result<DeviceConfig> {
        let negotiated = self.negotiated.read();
        let n = negotiated.as_ref().ok_or(AvpError::DeviceNotFound(self.id))?;
        let mac = n
            .info
            .ethaddr
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Ok(DeviceConfig {
            device_id: self.id,
            ifname: n.info.ifname.clone(),
            mac,
            status: self.status(),
            mode: n.info.mode,
            features: n.features.bits(),
            host_features: n.info.features.bits(),
            num_rx_queues: n.num_rx,
            num_tx_queues: n.num_tx,
            segment_size: n.info.mbuf_size,
            max_rx_pkt_len: n.info.max_rx_pkt_len,
            mtu: self.mtu(),
            admin_up: self.is_admin_up(),
            faulted: self.is_faulted(),
        })
    }

    /// Wake a control request waiting on a response.
    pub fn notify_response(&self) {
        if let Some(dp) = self.datapath() {
            dp.control.notify_response();
        }
    }

    /// Abandon an in-flight control request.
    pub fn interrupt_control(&self) {
        if let Some(dp) = self.datapath() {
            dp.control.interrupt();
        }
    }
}

impl QueuePoller for AvpDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn poll_queue(&self, queue: u16, burst: usize) -> usize {
        // Errors are logged and latched inside poll_rx
        self.poll_rx(queue, burst).unwrap_or(0)
    }

    fn service_control(&self) {
        if let Some(dp) = self.datapath() {
            dp.control.poll_response();
        }
    }
}

impl fmt::Debug for AvpDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AvpDevice")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("faulted", &self.is_faulted())
            .field("admin_up", &self.is_admin_up())
            .finish()
    }
}
