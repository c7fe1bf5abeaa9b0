//! In-process host peer.
//!
//! [`LoopbackHost`] plays the host side of an AVP device entirely in local
//! memory: it lays out the rings, the scratch buffer and a packet-buffer
//! pool in a data region, publishes matching device-info and memory-map
//! blocks, and then acts as the other end of every ring. Host addresses are
//! deliberately unrelated to local ones so that any missing translation
//! shows up immediately.
//!
//! [`CollectingStack`] is a [`NetStack`] that keeps what it is given.

use crate::addr::{HostAddr, LocalAddr};
use crate::buffer::{BufferFlags, BufferHeader, ChainWalker, Packet, DESC_LEN};
use crate::control::{self, ControlRequest, RequestKind};
use crate::device::{DeviceId, DeviceResources};
use crate::error::{AvpError, Result};
use crate::fifo::Fifo;
use crate::info::{
    regs, DeviceInfo, Features, InterruptStatus, MemMap, MemMapEntry, MempoolInfo,
    MigrationStatus, PeerMode, AVP_VERSION, DEVICE_INFO_LEN, MEMMAP_LEN,
};
use crate::memory::{GuestMemory, SharedRegion};
use crate::stack::NetStack;
use crate::translate::{MemoryPoolDescriptor, MempoolTranslator};
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const INFO_BASE: u64 = 0x1000_0000;
const MEMMAP_BASE: u64 = 0x2000_0000;
const MMIO_BASE: u64 = 0x3000_0000;
const DATA_BASE: u64 = 0x4000_0000;

const DEV_PHYS_BASE: u64 = 0x1_0000_0000;
const POOL_PHYS_BASE: u64 = 0x2_0000_0000;
const DEV_VA_BASE: u64 = 0x7e00_0000_0000;
const POOL_VA_BASE: u64 = 0x7f00_0000_0000;
// Every migration moves both the physical and the virtual layout
const EPOCH_PHYS_STRIDE: u64 = 0x1000_0000;
const EPOCH_VA_STRIDE: u64 = 0x10_0000_0000;

const CONTROL_SLOT: u64 = 64;

/// Shape of the simulated device.
#[derive(Clone, Debug)]
pub struct LoopbackConfig {
    pub device_id: u64,
    pub ifname: String,
    pub ethaddr: [u8; 6],
    pub mode: PeerMode,
    pub features: Features,
    pub rx_queues: u8,
    pub tx_queues: u8,
    /// Capacity of every data ring
    pub ring_capacity: u32,
    /// Data bytes per packet buffer
    pub mbuf_size: u32,
    /// Packet buffers in the pool
    pub buffers: usize,
    pub max_rx_pkt_len: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            ifname: "avp0".into(),
            ethaddr: [0x02, 0x00, 0x5e, 0x00, 0x00, 0x01],
            mode: PeerMode::Guest,
            features: Features::VLAN_OFFLOAD,
            rx_queues: 2,
            tx_queues: 2,
            ring_capacity: 64,
            mbuf_size: 2048,
            buffers: 1024,
            max_rx_pkt_len: 9238,
        }
    }
}

/// Offsets inside the device area, fixed for the life of the host.
#[derive(Clone, Copy, Debug)]
struct Layout {
    ring_bytes: u64,
    tx: u64,
    rx: u64,
    alloc: u64,
    free: u64,
    req: u64,
    resp: u64,
    sync: u64,
    dev_len: u64,
    stride: u64,
    pool_len: u64,
}

impl Layout {
    fn new(config: &LoopbackConfig) -> Self {
        let ring_bytes = Fifo::bytes_for(config.ring_capacity).next_multiple_of(64) as u64;
        let ntx = config.tx_queues as u64;
        let nrx = config.rx_queues as u64;
        let tx = 0;
        let rx = tx + ntx * ring_bytes;
        let alloc = rx + nrx * ring_bytes;
        let free = alloc + ntx * ring_bytes;
        let req = free + nrx * ring_bytes;
        let resp = req + CONTROL_SLOT;
        let sync = resp + CONTROL_SLOT;
        let dev_len = (sync + CONTROL_SLOT).next_multiple_of(4096);
        let stride = (DESC_LEN as u64 + config.mbuf_size as u64).next_multiple_of(64);
        Self {
            ring_bytes,
            tx,
            rx,
            alloc,
            free,
            req,
            resp,
            sync,
            dev_len,
            stride,
            pool_len: stride * config.buffers as u64,
        }
    }
}

/// Addresses that move with every migration.
#[derive(Clone, Copy, Debug)]
struct Epoch {
    number: u64,
    dev_phys: u64,
    dev_va: u64,
    pool_phys: u64,
    pool_va: u64,
}

impl Epoch {
    fn new(number: u64) -> Self {
        Self {
            number,
            dev_phys: DEV_PHYS_BASE + number * EPOCH_PHYS_STRIDE,
            dev_va: DEV_VA_BASE + number * EPOCH_VA_STRIDE,
            pool_phys: POOL_PHYS_BASE + number * EPOCH_PHYS_STRIDE,
            pool_va: POOL_VA_BASE + number * EPOCH_VA_STRIDE,
        }
    }
}

/// A drained transmit chain.
#[derive(Clone, Debug)]
pub struct TxFrame {
    /// Descriptors in chain order
    pub segments: Vec<BufferHeader>,
    /// Payload as the host sees it
    pub packet: Packet,
}

struct HostState {
    epoch: Epoch,
    features: Features,
    free_list: Vec<HostAddr>,
    pending: Option<HostAddr>,
    results: [i32; 5],
    served: Vec<ControlRequest>,
}

/// Simulated host side of one AVP device.
pub struct LoopbackHost {
    config: LoopbackConfig,
    layout: Layout,
    info: Arc<SharedRegion>,
    memmap: Arc<SharedRegion>,
    mmio: Arc<SharedRegion>,
    data: Arc<SharedRegion>,
    state: spin::Mutex<HostState>,
    responding: AtomicBool,
}

impl LoopbackHost {
    pub fn new(config: LoopbackConfig) -> Result<Self> {
        let layout = Layout::new(&config);
        let host = Self {
            info: Arc::new(SharedRegion::new_zeroed(
                LocalAddr::new(INFO_BASE),
                DEVICE_INFO_LEN,
            )),
            memmap: Arc::new(SharedRegion::new_zeroed(
                LocalAddr::new(MEMMAP_BASE),
                MEMMAP_LEN,
            )),
            mmio: Arc::new(SharedRegion::new_zeroed(LocalAddr::new(MMIO_BASE), regs::LEN)),
            data: Arc::new(SharedRegion::new_zeroed(
                LocalAddr::new(DATA_BASE),
                (layout.dev_len + layout.pool_len) as usize,
            )),
            state: spin::Mutex::new(HostState {
                epoch: Epoch::new(0),
                features: config.features,
                free_list: Vec::new(),
                pending: None,
                results: [0; 5],
                served: Vec::new(),
            }),
            responding: AtomicBool::new(true),
            layout,
            config,
        };
        host.publish()?;
        Ok(host)
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.config.device_id)
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Regions to hand to the guest driver
    pub fn resources(&self) -> DeviceResources {
        DeviceResources {
            info: self.info.clone(),
            memmap: self.memmap.clone(),
            mmio: self.mmio.clone(),
            data: self.data.clone(),
        }
    }

    fn dev_local(&self, offset: u64) -> LocalAddr {
        LocalAddr::new(DATA_BASE + offset)
    }

    fn pool_local(&self) -> LocalAddr {
        LocalAddr::new(DATA_BASE + self.layout.dev_len)
    }

    fn ring(&self, base: u64, index: u8) -> Result<Fifo> {
        let offset = base + index as u64 * self.layout.ring_bytes;
        Fifo::attach(self.data.clone(), self.dev_local(offset))
    }

    fn translator(&self, epoch: &Epoch) -> Result<MempoolTranslator> {
        let mut t = MempoolTranslator::new();
        t.register(MemoryPoolDescriptor::new(
            HostAddr::new(epoch.pool_va),
            self.pool_local(),
            self.layout.pool_len,
        ))?;
        Ok(t)
    }

    fn guest_memory(&self) -> Result<GuestMemory> {
        let mut mem = GuestMemory::new();
        mem.add_region(self.data.clone())?;
        Ok(mem)
    }

    /// Format rings, lay out the pool and publish the info blocks for the
    /// current epoch.
    fn publish(&self) -> Result<()> {
        let cfg = &self.config;
        let l = self.layout;
        let mut state = self.state.lock();
        let epoch = state.epoch;

        let init = |base: u64, count: u8, capacity: u32| -> Result<()> {
            for i in 0..count {
                let at = self.dev_local(base + i as u64 * l.ring_bytes);
                Fifo::init(self.data.clone(), at, capacity)?;
            }
            Ok(())
        };
        init(l.tx, cfg.tx_queues, cfg.ring_capacity)?;
        init(l.rx, cfg.rx_queues, cfg.ring_capacity)?;
        init(l.alloc, cfg.tx_queues, cfg.ring_capacity)?;
        init(l.free, cfg.rx_queues, cfg.ring_capacity)?;
        init(l.req, 1, 1)?;
        init(l.resp, 1, 1)?;
        self.data.fill(self.dev_local(l.sync), CONTROL_SLOT as usize, 0)?;

        // Every buffer gets fresh self/data addresses
        let mem = self.guest_memory()?;
        let mut buffers = Vec::with_capacity(cfg.buffers);
        for i in 0..cfg.buffers as u64 {
            let host = HostAddr::new(epoch.pool_va + i * l.stride);
            let header = BufferHeader {
                self_addr: host,
                data: host.add(DESC_LEN as u64),
                ..Default::default()
            };
            header.write(&mem, self.pool_local().add(i * l.stride))?;
            buffers.push(host);
        }

        // Alloc rings start full; the rest feeds receive injection
        for q in 0..cfg.tx_queues {
            let alloc = self.ring(l.alloc, q)?;
            let take = (alloc.free_count() as usize).min(buffers.len());
            let batch: Vec<_> = buffers.drain(..take).collect();
            alloc.put(&batch);
        }
        state.free_list = buffers;
        state.pending = None;

        let info = DeviceInfo {
            version: AVP_VERSION,
            device_id: cfg.device_id,
            ifname: cfg.ifname.clone(),
            ethaddr: cfg.ethaddr,
            mode: cfg.mode,
            features: state.features,
            min_rx_queues: 1,
            max_rx_queues: cfg.rx_queues,
            min_tx_queues: 1,
            max_tx_queues: cfg.tx_queues,
            tx_phys: HostAddr::new(epoch.dev_phys + l.tx),
            rx_phys: HostAddr::new(epoch.dev_phys + l.rx),
            alloc_phys: HostAddr::new(epoch.dev_phys + l.alloc),
            free_phys: HostAddr::new(epoch.dev_phys + l.free),
            tx_size: l.ring_bytes as u32,
            rx_size: l.ring_bytes as u32,
            alloc_size: l.ring_bytes as u32,
            free_size: l.ring_bytes as u32,
            req_phys: HostAddr::new(epoch.dev_phys + l.req),
            resp_phys: HostAddr::new(epoch.dev_phys + l.resp),
            sync_phys: HostAddr::new(epoch.dev_phys + l.sync),
            sync_va: HostAddr::new(epoch.dev_va + l.sync),
            mbuf_size: cfg.mbuf_size,
            max_rx_pkt_len: cfg.max_rx_pkt_len,
            pools: vec![MempoolInfo {
                addr: HostAddr::new(epoch.pool_va),
                phys: HostAddr::new(epoch.pool_phys),
                len: l.pool_len,
            }],
        };
        info.write(&self.info)?;

        MemMap {
            entries: vec![
                MemMapEntry {
                    phys: HostAddr::new(epoch.dev_phys),
                    len: l.dev_len,
                },
                MemMapEntry {
                    phys: HostAddr::new(epoch.pool_phys),
                    len: l.pool_len,
                },
            ],
        }
        .write(&self.memmap)?;
        tracing::debug!(epoch = epoch.number, "Loopback host published layout");
        Ok(())
    }

    /// Put `host` back on the free list with a clean single-segment
    /// descriptor, so a stale link can never be followed later.
    fn recycle(
        &self,
        state: &mut HostState,
        mem: &GuestMemory,
        translator: &MempoolTranslator,
        host: HostAddr,
    ) -> Result<()> {
        let header = BufferHeader {
            self_addr: host,
            data: host.add(DESC_LEN as u64),
            ..Default::default()
        };
        header.write(mem, translator.translate(host)?)?;
        state.free_list.push(host);
        Ok(())
    }

    /// Collect the chains the guest returned on a free ring. The guest only
    /// returns heads, so every chain is walked to recover its segments.
    fn reclaim(&self, state: &mut HostState, queue: u8) -> Result<()> {
        let free = self.ring(self.layout.free, queue)?;
        let mem = self.guest_memory()?;
        let translator = self.translator(&state.epoch)?;
        let seg = self.config.mbuf_size as usize;

        let mut head = [HostAddr::NULL];
        while free.get(&mut head) == 1 {
            let mut chain = Vec::new();
            for segment in ChainWalker::new(&mem, &translator, seg, head[0]) {
                match segment {
                    Ok(segment) => chain.push(segment.host),
                    Err(e) => {
                        tracing::warn!(queue, head = %head[0], error = %e, "Dropping unusable chain returned by the guest");
                        break;
                    }
                }
            }
            for host in chain {
                self.recycle(state, &mem, &translator, host)?;
            }
        }
        Ok(())
    }

    /// Queue a packet on a receive ring. Returns `false` when the host is
    /// out of buffers or the ring is full.
    pub fn inject(&self, queue: u8, packet: &Packet) -> Result<bool> {
        self.inject_chain(queue, packet, packet.len() as u32)
    }

    /// Queue a packet whose head descriptor claims `pkt_len` bytes instead
    /// of the chain's real length.
    pub fn inject_mislabeled(&self, queue: u8, packet: &Packet, pkt_len: u32) -> Result<bool> {
        self.inject_chain(queue, packet, pkt_len)
    }

    fn inject_chain(&self, queue: u8, packet: &Packet, pkt_len: u32) -> Result<bool> {
        let mut state = self.state.lock();
        self.reclaim(&mut state, queue)?;
        let rx = self.ring(self.layout.rx, queue)?;
        let seg = self.config.mbuf_size as usize;
        let count = packet.len().div_ceil(seg).max(1);
        if rx.free_count() == 0 || state.free_list.len() < count {
            return Ok(false);
        }

        let split = state.free_list.len() - count;
        let chain: Vec<HostAddr> = state.free_list.drain(split..).collect();
        let mem = self.guest_memory()?;
        let translator = self.translator(&state.epoch)?;
        for (i, &host) in chain.iter().enumerate() {
            let local = translator.translate(host)?;
            let chunk = &packet.data()[(i * seg).min(packet.len())..packet.len().min((i + 1) * seg)];
            let mut header = BufferHeader {
                self_addr: host,
                next: chain.get(i + 1).copied().unwrap_or(HostAddr::NULL),
                data: host.add(DESC_LEN as u64),
                data_len: chunk.len() as u16,
                ..Default::default()
            };
            if i == 0 {
                header.nb_segs = count as u8;
                header.pkt_len = pkt_len;
                if let Some(tci) = packet.vlan() {
                    header.flags = BufferFlags::VLAN_PKT;
                    header.vlan_tci = tci;
                }
            }
            header.write(&mem, local)?;
            mem.write(local.add(DESC_LEN as u64), chunk)?;
        }
        Ok(rx.put(&chain[..1]) == 1)
    }

    /// Queue a raw chain head (for malformed-ring tests).
    pub fn inject_raw(&self, queue: u8, head: HostAddr) -> Result<bool> {
        let rx = self.ring(self.layout.rx, queue)?;
        Ok(rx.put(&[head]) == 1)
    }

    /// Fill a free ring with host buffers until only `leave_free` slots remain.
    pub fn stall_free_ring(&self, queue: u8, leave_free: u32) -> Result<()> {
        let mut state = self.state.lock();
        let free = self.ring(self.layout.free, queue)?;
        while free.free_count() > leave_free {
            let Some(buf) = state.free_list.pop() else {
                break;
            };
            free.put(&[buf]);
        }
        Ok(())
    }

    /// Point the data area of every buffer on an alloc ring at `data`.
    pub fn corrupt_alloc_ring(&self, queue: u8, data: HostAddr) -> Result<usize> {
        let state = self.state.lock();
        let alloc = self.ring(self.layout.alloc, queue)?;
        let mem = self.guest_memory()?;
        let translator = self.translator(&state.epoch)?;
        let mut bufs = vec![HostAddr::NULL; alloc.count() as usize];
        let n = alloc.get(&mut bufs);
        for &host in &bufs[..n] {
            let local = translator.translate(host)?;
            let mut header = BufferHeader::read(&mem, local)?;
            header.data = data;
            header.write(&mem, local)?;
        }
        alloc.put(&bufs[..n]);
        Ok(n)
    }

    /// Entries waiting on a receive ring
    pub fn rx_backlog(&self, queue: u8) -> Result<u32> {
        Ok(self.ring(self.layout.rx, queue)?.count())
    }

    /// Entries on a free ring
    pub fn free_ring_count(&self, queue: u8) -> Result<u32> {
        Ok(self.ring(self.layout.free, queue)?.count())
    }

    /// Buffers waiting on an alloc ring
    pub fn alloc_count(&self, queue: u8) -> Result<u32> {
        Ok(self.ring(self.layout.alloc, queue)?.count())
    }

    /// Chains waiting on a transmit ring
    pub fn tx_backlog(&self, queue: u8) -> Result<u32> {
        Ok(self.ring(self.layout.tx, queue)?.count())
    }

    /// Take a buffer away from the host (to make the alloc ring run dry).
    pub fn drain_alloc(&self, queue: u8) -> Result<usize> {
        let mut state = self.state.lock();
        let alloc = self.ring(self.layout.alloc, queue)?;
        let mem = self.guest_memory()?;
        let translator = self.translator(&state.epoch)?;
        let mut batch = [HostAddr::NULL; 64];
        let mut total = 0;
        loop {
            let n = alloc.get(&mut batch);
            if n == 0 {
                return Ok(total);
            }
            for &buf in &batch[..n] {
                self.recycle(&mut state, &mem, &translator, buf)?;
            }
            total += n;
        }
    }

    /// Dequeue every transmitted chain and recycle its buffers.
    pub fn drain_tx(&self, queue: u8) -> Result<Vec<TxFrame>> {
        let mut state = self.state.lock();
        let tx = self.ring(self.layout.tx, queue)?;
        let alloc = self.ring(self.layout.alloc, queue)?;
        let mem = self.guest_memory()?;
        let translator = self.translator(&state.epoch)?;
        let seg = self.config.mbuf_size as usize;

        let mut frames = Vec::new();
        let mut head = [HostAddr::NULL];
        while tx.get(&mut head) == 1 {
            let mut segments = Vec::new();
            let mut data = Vec::new();
            let mut used = Vec::new();
            for segment in ChainWalker::new(&mem, &translator, seg, head[0]) {
                let segment = segment?;
                let mut chunk = vec![0u8; segment.header.data_len as usize];
                mem.read(segment.data, &mut chunk)?;
                data.extend_from_slice(&chunk);
                segments.push(segment.header);
                used.push(segment.host);
            }
            let mut packet = Packet::from_bytes(data);
            packet.set_vlan(segments.first().and_then(BufferHeader::vlan));
            frames.push(TxFrame { segments, packet });

            for buf in used {
                if alloc.put(&[buf]) == 0 {
                    self.recycle(&mut state, &mem, &translator, buf)?;
                }
            }
        }
        Ok(frames)
    }

    /// Make the host answer requests of `kind` with `code`.
    pub fn set_result(&self, kind: RequestKind, code: i32) {
        self.state.lock().results[kind as usize] = code;
    }

    /// Stop or resume answering control requests.
    pub fn set_responding(&self, responding: bool) {
        self.responding.store(responding, Ordering::Release);
    }

    /// Features advertised from the next migration on.
    pub fn set_features(&self, features: Features) {
        self.state.lock().features = features;
    }

    /// Dequeue a control request without answering it.
    pub fn take_request(&self) -> Result<Option<ControlRequest>> {
        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Ok(None);
        }
        let request = self.ring(self.layout.req, 0)?;
        let mut entry = [HostAddr::NULL];
        if request.get(&mut entry) == 0 {
            return Ok(None);
        }
        let mut raw = [0u8; control::CONTROL_MSG_LEN];
        self.data.read(self.dev_local(self.layout.sync), &mut raw)?;
        let req = ControlRequest::decode(&raw)?;
        state.pending = Some(entry[0]);
        state.served.push(req);
        Ok(Some(req))
    }

    /// Answer the request taken by [`take_request`](Self::take_request).
    /// Returns `false` when nothing was pending.
    pub fn respond(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(addr) = state.pending.take() else {
            return Ok(false);
        };
        let raw_kind = self.data.read_u32(self.dev_local(self.layout.sync))?;
        let code = RequestKind::from_raw(raw_kind).map_or(-22, |k| state.results[k as usize]);
        control::write_result(&self.data, self.dev_local(self.layout.sync), code)?;
        let response = self.ring(self.layout.resp, 0)?;
        if response.put(&[addr]) == 0 {
            return Err(AvpError::RequestRingFull);
        }
        self.raise(InterruptStatus::RESPONSE)?;
        Ok(true)
    }

    /// Answer the pending request with an arbitrary ring entry.
    pub fn respond_with(&self, entry: HostAddr) -> Result<()> {
        self.state.lock().pending = None;
        let response = self.ring(self.layout.resp, 0)?;
        if response.put(&[entry]) == 0 {
            return Err(AvpError::RequestRingFull);
        }
        self.raise(InterruptStatus::RESPONSE)
    }

    /// Take and answer one request, if the host is responding.
    pub fn serve_control(&self) -> Result<Option<ControlRequest>> {
        if !self.responding.load(Ordering::Acquire) {
            return Ok(None);
        }
        let req = self.take_request()?;
        if req.is_some() {
            self.respond()?;
        }
        Ok(req)
    }

    /// Requests taken so far
    pub fn served(&self) -> Vec<ControlRequest> {
        self.state.lock().served.clone()
    }

    /// Responses the guest has not consumed
    pub fn response_backlog(&self) -> Result<u32> {
        Ok(self.ring(self.layout.resp, 0)?.count())
    }

    /// Answer requests on a background thread, calling `notify` after each
    /// answer the way a response interrupt would.
    pub fn spawn_responder(
        self: &Arc<Self>,
        notify: impl Fn() + Send + 'static,
    ) -> Responder {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let host = self.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match host.serve_control() {
                        Ok(Some(_)) => notify(),
                        Ok(None) => std::thread::sleep(Duration::from_micros(200)),
                        Err(e) => {
                            tracing::error!(error = %e, "Loopback responder failed");
                            return;
                        }
                    }
                }
            })
        };
        Responder {
            stop,
            handle: Some(handle),
        }
    }

    fn raise(&self, bits: InterruptStatus) -> Result<()> {
        let at = self.mmio.base().add(regs::INTERRUPT_STATUS);
        let current = self.mmio.load_register(at)?;
        self.mmio.store_register(at, current | bits.bits())
    }

    /// Read and clear pending interrupt bits.
    pub fn take_interrupts(&self) -> Result<InterruptStatus> {
        let at = self.mmio.base().add(regs::INTERRUPT_STATUS);
        let bits = self.mmio.atomic_u32(at)?.swap(0, Ordering::AcqRel);
        Ok(InterruptStatus::from_bits_truncate(bits))
    }

    fn set_migration_status(&self, status: MigrationStatus) -> Result<()> {
        self.mmio.store_register(
            self.mmio.base().add(regs::MIGRATION_STATUS),
            status.as_raw(),
        )?;
        self.raise(InterruptStatus::MIGRATION)
    }

    /// Announce the start of a migration.
    pub fn begin_migration(&self) -> Result<InterruptStatus> {
        self.set_migration_status(MigrationStatus::Detached)?;
        Ok(InterruptStatus::MIGRATION)
    }

    /// Move everything to a new layout and announce the re-attach.
    pub fn end_migration(&self) -> Result<InterruptStatus> {
        {
            let mut state = self.state.lock();
            state.epoch = Epoch::new(state.epoch.number + 1);
        }
        self.publish()?;
        self.set_migration_status(MigrationStatus::Attached)?;
        Ok(InterruptStatus::MIGRATION)
    }

    /// Migration epoch (0 before the first migration)
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch.number
    }

    /// Last value the guest wrote to the acknowledge register
    pub fn migration_ack(&self) -> Result<Option<MigrationStatus>> {
        let raw = self
            .mmio
            .load_register(self.mmio.base().add(regs::MIGRATION_ACK))?;
        Ok(MigrationStatus::from_raw(raw))
    }

    /// Buffers the host holds in reserve for receive injection
    pub fn free_buffers(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Host address of pool buffer `index` in the current epoch.
    pub fn buffer_addr(&self, index: usize) -> HostAddr {
        let epoch = self.state.lock().epoch;
        HostAddr::new(epoch.pool_va + index as u64 * self.layout.stride)
    }
}

/// Background control responder; stops when dropped.
pub struct Responder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A [`NetStack`] that records everything it receives.
#[derive(Debug, Default)]
pub struct CollectingStack {
    delivered: spin::Mutex<Vec<(DeviceId, u16, Packet)>>,
    links: spin::Mutex<Vec<(DeviceId, bool)>>,
    // Allocations left before failing; negative means unlimited
    alloc_budget: AtomicI64,
}

impl CollectingStack {
    pub fn new() -> Self {
        Self {
            alloc_budget: AtomicI64::new(-1),
            ..Default::default()
        }
    }

    /// Fail every allocation after the next `n`.
    pub fn fail_allocs_after(&self, n: u32) {
        self.alloc_budget.store(n as i64, Ordering::Release);
    }

    pub fn allow_allocs(&self) {
        self.alloc_budget.store(-1, Ordering::Release);
    }

    /// Take every delivered packet
    pub fn take(&self) -> Vec<Packet> {
        core::mem::take(&mut *self.delivered.lock())
            .into_iter()
            .map(|(_, _, p)| p)
            .collect()
    }

    /// Take delivered packets with their device and queue
    pub fn take_with_origin(&self) -> Vec<(DeviceId, u16, Packet)> {
        core::mem::take(&mut *self.delivered.lock())
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Last reported carrier state of `device`
    pub fn link(&self, device: DeviceId) -> Option<bool> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|(d, _)| *d == device)
            .map(|(_, up)| *up)
    }
}

impl NetStack for CollectingStack {
    fn alloc_rx(&self, len: usize) -> Option<Packet> {
        let budget = self.alloc_budget.load(Ordering::Acquire);
        if budget == 0 {
            return None;
        }
        if budget > 0 {
            self.alloc_budget.fetch_sub(1, Ordering::AcqRel);
        }
        Some(Packet::with_capacity(len))
    }

    fn deliver(&self, device: DeviceId, queue: u16, packet: Packet) {
        self.delivered.lock().push((device, queue, packet));
    }

    fn set_link(&self, device: DeviceId, up: bool) {
        self.links.lock().push((device, up));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_blocks_parse() {
        let host = LoopbackHost::new(LoopbackConfig::default()).unwrap();
        let res = host.resources();
        let info = DeviceInfo::read(&res.info).unwrap();
        assert_eq!(info.device_id, 1);
        assert_eq!(info.pools.len(), 1);
        let map = MemMap::read(&res.memmap).unwrap();
        assert_eq!(map.entries.len(), 2);
        assert_eq!(host.alloc_count(0).unwrap(), 64);
    }

    #[test]
    fn test_migration_moves_addresses() {
        let host = LoopbackHost::new(LoopbackConfig::default()).unwrap();
        let before = DeviceInfo::read(&host.resources().info).unwrap();
        host.begin_migration().unwrap();
        host.end_migration().unwrap();
        let after = DeviceInfo::read(&host.resources().info).unwrap();
        assert_ne!(before.pools[0].addr, after.pools[0].addr);
        assert_ne!(before.sync_va, after.sync_va);
        assert_eq!(host.epoch(), 1);
        assert!(host
            .take_interrupts()
            .unwrap()
            .contains(InterruptStatus::MIGRATION));
    }
}
