//! Transmit engine.
//!
//! An outgoing packet is cut into segment-sized pieces, each copied into a
//! buffer taken from the queue's [`MbufCache`]. The buffers are chained
//! through their `next` links and only the head goes on the tx ring, so a
//! send costs one ring slot however many segments it has.
//!
//! Sends never block and never fail upward: anything that goes wrong is a
//! drop, recorded in the statistics and reported in the [`TxOutcome`].

use crate::addr::{BufferRef, HostAddr};
use crate::buffer::{BufferFlags, BufferHeader, Packet, DESC_LEN, MAX_SEGMENTS, MIN_FRAME_LEN};
use crate::device::{AvpDevice, Datapath, DeviceStatus, TxQueue};
use crate::error::Result;
use crate::stats::StatsDelta;

/// Buffers a transmit queue keeps on hand
pub const MBUF_CACHE_SIZE: usize = 32;

/// Free buffers prefetched from a queue's alloc ring.
#[derive(Debug, Default)]
pub struct MbufCache {
    bufs: heapless::Vec<BufferRef, MBUF_CACHE_SIZE>,
    flushed: bool,
}

impl MbufCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Whether the cache was returned to the host and is closed
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Top up from the alloc ring so at least `needed` buffers are held.
    ///
    /// Each fetched buffer is translated before it is cached; a buffer that
    /// does not translate is a protocol violation. The rest of the batch is
    /// still cached, and the first failure is returned.
    fn refill(&mut self, dp: &Datapath, q: &TxQueue, needed: usize) -> Result<()> {
        if self.bufs.len() >= needed {
            return Ok(());
        }
        let want = (q.alloc.count() as usize).min(MBUF_CACHE_SIZE - self.bufs.len());
        let mut fetched = [HostAddr::NULL; MBUF_CACHE_SIZE];
        let got = q.alloc.get(&mut fetched[..want]);
        let mut failure = None;
        for &host in &fetched[..got] {
            match dp.translators.mempool.translate_range(host, DESC_LEN as u64) {
                // Room was computed above
                Ok(local) => {
                    let _ = self.bufs.push(BufferRef { host, local });
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Take `count` buffers, in chain order.
    fn take(&mut self, count: usize) -> heapless::Vec<BufferRef, MAX_SEGMENTS> {
        let mut chain = heapless::Vec::new();
        let split = self.bufs.len() - count;
        for buf in &self.bufs[split..] {
            let _ = chain.push(*buf);
        }
        self.bufs.truncate(split);
        chain
    }

    /// Put unused buffers back.
    fn restore(&mut self, bufs: &[BufferRef]) {
        for buf in bufs {
            if self.bufs.push(*buf).is_err() {
                break;
            }
        }
    }

    /// Return every cached buffer to the alloc ring and close the cache.
    ///
    /// Returns the number of buffers handed back. A second flush is a no-op.
    pub(crate) fn flush(&mut self, q: &TxQueue) -> usize {
        if self.flushed {
            return 0;
        }
        self.flushed = true;
        let hosts: heapless::Vec<HostAddr, MBUF_CACHE_SIZE> =
            self.bufs.iter().map(|b| b.host).collect();
        let returned = q.alloc.put(&hosts);
        if returned < hosts.len() {
            tracing::warn!(returned, cached = hosts.len(), "Alloc ring could not take back every cached buffer");
        }
        self.bufs.clear();
        returned
    }
}

/// Why a packet was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxDrop {
    /// The device is detached
    Detached,
    /// The device latched a protocol violation
    Faulted,
    /// Empty, or needs more than the segment limit
    BadLength,
    /// No such transmit queue
    BadQueue,
    /// No tx ring slot
    RingFull,
    /// Not enough free buffers even after a refill
    NoBuffers,
    /// The tx ring refused the chain head
    EnqueueFailed,
    /// A buffer from the host did not translate
    ProtocolViolation,
}

/// Result of a send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// The chain is on the ring
    Queued { segments: usize },
    Dropped(TxDrop),
}

impl TxOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, TxOutcome::Queued { .. })
    }
}

impl AvpDevice {
    /// Send a packet on `queue`. The packet is consumed either way.
    pub fn transmit(&self, queue: u16, packet: Packet) -> TxOutcome {
        let mut delta = StatsDelta::default();
        let outcome = self.transmit_inner(queue, &packet, &mut delta);
        if let TxOutcome::Dropped(reason) = outcome {
            delta.tx_dropped += 1;
            tracing::trace!(device = %self.id(), queue, ?reason, len = packet.len(), "Transmit dropped");
        }
        self.record(&delta);
        outcome
    }

    fn transmit_inner(&self, queue: u16, packet: &Packet, delta: &mut StatsDelta) -> TxOutcome {
        if self.status() != DeviceStatus::Ok {
            return TxOutcome::Dropped(TxDrop::Detached);
        }
        if self.is_faulted() {
            return TxOutcome::Dropped(TxDrop::Faulted);
        }
        let Some(dp) = self.datapath() else {
            return TxOutcome::Dropped(TxDrop::Detached);
        };
        let Some(q) = dp.tx.get(queue as usize) else {
            delta.tx_errors += 1;
            return TxOutcome::Dropped(TxDrop::BadQueue);
        };

        let count = packet.len().div_ceil(dp.segment_size);
        if count == 0 || count > MAX_SEGMENTS {
            delta.tx_errors += 1;
            return TxOutcome::Dropped(TxDrop::BadLength);
        }
        if q.tx.free_count() == 0 {
            return TxOutcome::Dropped(TxDrop::RingFull);
        }

        let mut cache = q.cache.lock();
        if cache.is_flushed() {
            return TxOutcome::Dropped(TxDrop::Detached);
        }
        if let Err(e) = cache.refill(&dp, q, count) {
            self.latch_fault(&e, "transmit refill");
            return TxOutcome::Dropped(TxDrop::ProtocolViolation);
        }
        if cache.len() < count {
            delta.tx_fifo_errors += 1;
            return TxOutcome::Dropped(TxDrop::NoBuffers);
        }

        let chain = cache.take(count);
        let wire_len = match build_chain(&dp, &chain, packet) {
            Ok(len) => len,
            Err(e) => {
                cache.restore(&chain);
                self.latch_fault(&e, "transmit chain");
                return TxOutcome::Dropped(TxDrop::ProtocolViolation);
            }
        };

        if q.tx.put(&[chain[0].host]) == 0 {
            cache.restore(&chain);
            delta.tx_fifo_errors += 1;
            return TxOutcome::Dropped(TxDrop::EnqueueFailed);
        }
        drop(cache);

        delta.tx_packets += 1;
        delta.tx_bytes += wire_len as u64;
        TxOutcome::Queued { segments: count }
    }
}

/// Copy `packet` into `chain` and link it. Returns the length on the wire.
fn build_chain(dp: &Datapath, chain: &[BufferRef], packet: &Packet) -> Result<usize> {
    let seg = dp.segment_size;
    let data = packet.data();
    let wire_len = data.len().max(MIN_FRAME_LEN);

    for (i, buf) in chain.iter().enumerate() {
        let mut header = BufferHeader::read(&dp.mem, buf.local)?;
        let chunk = &data[i * seg..data.len().min((i + 1) * seg)];
        let target = dp.translators.mempool.translate_range(header.data, seg as u64)?;
        dp.mem.write(target, chunk)?;

        header.self_addr = buf.host;
        header.next = chain.get(i + 1).map_or(HostAddr::NULL, |b| b.host);
        header.data_len = chunk.len() as u16;
        header.nb_segs = 0;
        header.pkt_len = 0;
        header.flags = BufferFlags::empty();
        header.vlan_tci = 0;

        if i == 0 {
            if chunk.len() < MIN_FRAME_LEN {
                let pad = MIN_FRAME_LEN - chunk.len();
                dp.mem.fill(target.add(chunk.len() as u64), pad, 0)?;
                header.data_len = MIN_FRAME_LEN as u16;
            }
            header.nb_segs = chain.len() as u8;
            header.pkt_len = wire_len as u32;
            if let Some(tci) = packet.vlan() {
                header.flags = BufferFlags::VLAN_PKT;
                header.vlan_tci = tci;
            }
        }
        header.write(&dp.mem, buf.local)?;
    }
    Ok(wire_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_restore_preserve_buffers() {
        let mut cache = MbufCache::new();
        for i in 0..4u64 {
            cache
                .bufs
                .push(BufferRef {
                    host: HostAddr::new(0x1000 * (i + 1)),
                    local: crate::addr::LocalAddr::new(0x10 * (i + 1)),
                })
                .unwrap();
        }
        let chain = cache.take(3);
        assert_eq!(chain.len(), 3);
        assert_eq!(cache.len(), 1);
        cache.restore(&chain);
        assert_eq!(cache.len(), 4);
    }
}
