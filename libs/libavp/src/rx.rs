//! Receive engine.
//!
//! The host queues buffer chains on a queue's rx ring. A poll dequeues a
//! burst, copies every chain into a stack-owned [`Packet`] and hands the
//! buffers straight back on the free ring. The burst is capped by the free
//! ring's room, so every buffer taken can be returned.

use crate::addr::HostAddr;
use crate::buffer::{BufferHeader, ChainWalker, Packet, DESC_LEN};
use crate::device::{AvpDevice, Datapath, DeviceStatus, RxQueue};
use crate::error::{AvpError, Result};
use crate::stats::StatsDelta;

/// Largest burst a single poll processes
pub const MAX_RX_BURST: usize = 64;

impl AvpDevice {
    /// Poll one receive queue; returns the number of ring entries processed.
    ///
    /// A queue already being polled elsewhere (during a move between
    /// workers) is skipped. A protocol violation latches the device as
    /// faulted and is returned; later polls return 0 until re-attach.
    pub fn poll_rx(&self, queue: u16, burst: usize) -> Result<usize> {
        if self.status() != DeviceStatus::Ok || self.is_faulted() {
            return Ok(0);
        }
        let Some(dp) = self.datapath() else {
            return Ok(0);
        };
        let q = dp
            .rx
            .get(queue as usize)
            .ok_or(AvpError::InvalidQueue(queue))?;
        let Some(_busy) = q.busy.try_lock() else {
            return Ok(0);
        };

        let mut delta = StatsDelta::default();
        let result = self.receive_burst(&dp, q, queue, burst, &mut delta);
        self.record(&delta);
        if let Err(e) = &result {
            if e.is_protocol_violation() {
                self.latch_fault(e, "receive");
            }
        }
        result
    }

    fn receive_burst(
        &self,
        dp: &Datapath,
        q: &RxQueue,
        queue: u16,
        burst: usize,
        delta: &mut StatsDelta,
    ) -> Result<usize> {
        let num_rx = q.rx.count() as usize;
        let num_free = q.free.free_count() as usize;
        if num_free == 0 {
            delta.rx_fifo_errors += 1;
        }
        let n = num_rx.min(num_free).min(burst.min(MAX_RX_BURST));
        if n == 0 {
            return Ok(0);
        }

        let mut entries = [HostAddr::NULL; MAX_RX_BURST];
        let n = q.rx.get(&mut entries[..n]);
        let entries = &entries[..n];

        let outcome = self.copy_out(dp, entries, queue, delta);

        // Buffers go back to the host whatever happened to their contents
        let returned = q.free.put(entries);
        if returned < n {
            tracing::error!(device = %self.id(), queue, returned, taken = n, "Free ring refused returned buffers");
            delta.rx_fifo_errors += 1;
        }

        outcome.map(|()| n)
    }

    fn copy_out(
        &self,
        dp: &Datapath,
        entries: &[HostAddr],
        queue: u16,
        delta: &mut StatsDelta,
    ) -> Result<()> {
        let mempool = &dp.translators.mempool;
        for (i, &head) in entries.iter().enumerate() {
            let local = mempool.translate_range(head, DESC_LEN as u64)?;
            let header = BufferHeader::read(&dp.mem, local)?;
            let pkt_len = header.pkt_len as usize;

            let Some(mut packet) = self.stack().alloc_rx(pkt_len) else {
                // This packet and the untried tail of the burst are lost
                let dropped = (entries.len() - i) as u64;
                delta.rx_dropped += dropped;
                tracing::trace!(device = %self.id(), queue, dropped, "Packet allocation failed");
                break;
            };

            match copy_chain(dp, head, &mut packet) {
                Ok(()) => {}
                Err(AvpError::PacketOverflow { capacity, attempted }) => {
                    tracing::trace!(device = %self.id(), queue, capacity, attempted, "Chain longer than its packet length");
                    delta.rx_dropped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            if packet.len() != pkt_len {
                tracing::trace!(device = %self.id(), queue, expected = pkt_len, got = packet.len(), "Chain shorter than its packet length");
                delta.rx_errors += 1;
                continue;
            }

            packet.set_vlan(header.vlan());
            delta.rx_packets += 1;
            delta.rx_bytes += pkt_len as u64;
            self.stack().deliver(self.id(), queue, packet);
        }
        Ok(())
    }
}

fn copy_chain(dp: &Datapath, head: HostAddr, packet: &mut Packet) -> Result<()> {
    for segment in ChainWalker::new(&dp.mem, &dp.translators.mempool, dp.segment_size, head) {
        let segment = segment?;
        packet.append_from(&dp.mem, segment.data, segment.header.data_len as usize)?;
    }
    Ok(())
}
