//! Per-CPU device statistics.
//!
//! Counters are updated on the hot path without a lock: every CPU slot is
//! guarded by a [`SeqCount`], and readers aggregating across slots retry
//! until they observe a slot between updates.
//!
//! Protocol:
//! 1) The writer claims the slot by moving the sequence from even to odd.
//! 2) The writer updates the counters.
//! 3) The writer publishes by moving the sequence to the next even value.
//!
//! A reader snapshots the sequence, reads the counters, and retries if the
//! sequence was odd or changed in the meantime.

use crate::cpu;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

/// Generation counter for read-consistent snapshots.
#[derive(Debug, Default)]
pub struct SeqCount {
    seq: AtomicU64,
}

impl SeqCount {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Claim the write side. Spins while another writer holds it.
    pub fn write_begin(&self) -> u64 {
        let mut start = self.seq.load(Ordering::Relaxed);
        loop {
            if start & 1 != 0 {
                core::hint::spin_loop();
                start = self.seq.load(Ordering::Relaxed);
                continue;
            }
            match self.seq.compare_exchange_weak(
                start,
                start + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return start,
                Err(actual) => start = actual,
            }
        }
    }

    /// Publish the update started by the matching [`write_begin`](Self::write_begin).
    pub fn write_end(&self, start: u64) {
        self.seq.store(start.wrapping_add(2), Ordering::Release);
    }

    /// Start a read; spins while a write is in progress.
    pub fn read_begin(&self) -> u64 {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            core::hint::spin_loop();
        }
    }

    /// Whether the read started at `start` must be retried.
    pub fn read_retry(&self, start: u64) -> bool {
        core::sync::atomic::fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) != start
    }

    /// Current raw sequence value.
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

/// A batch of counter increments applied in one sequenced update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub rx_fifo_errors: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
    pub tx_fifo_errors: u64,
}

impl StatsDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Aggregated 64-bit device statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats64 {
    /// Received packets
    pub rx_packets: u64,
    /// Received bytes
    pub rx_bytes: u64,
    /// Receive errors
    pub rx_errors: u64,
    /// Received packets dropped by the guest
    pub rx_dropped: u64,
    /// Polls that found no room to return buffers to the host
    pub rx_fifo_errors: u64,
    /// Transmitted packets
    pub tx_packets: u64,
    /// Transmitted bytes
    pub tx_bytes: u64,
    /// Transmit errors
    pub tx_errors: u64,
    /// Transmit packets dropped
    pub tx_dropped: u64,
    /// Transmits that could not get buffers or a ring slot
    pub tx_fifo_errors: u64,
}

impl Stats64 {
    fn accumulate(&mut self, other: &Stats64) {
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.rx_errors += other.rx_errors;
        self.rx_dropped += other.rx_dropped;
        self.rx_fifo_errors += other.rx_fifo_errors;
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.tx_errors += other.tx_errors;
        self.tx_dropped += other.tx_dropped;
        self.tx_fifo_errors += other.tx_fifo_errors;
    }
}

/// Counters for one CPU.
#[derive(Debug, Default)]
pub struct CpuStats {
    seq: SeqCount,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    rx_dropped: AtomicU64,
    rx_fifo_errors: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_errors: AtomicU64,
    tx_dropped: AtomicU64,
    tx_fifo_errors: AtomicU64,
}

impl CpuStats {
    /// Apply a delta as one sequenced update.
    pub fn apply(&self, delta: &StatsDelta) {
        if delta.is_empty() {
            return;
        }
        let start = self.seq.write_begin();
        bump(&self.rx_packets, delta.rx_packets);
        bump(&self.rx_bytes, delta.rx_bytes);
        bump(&self.rx_errors, delta.rx_errors);
        bump(&self.rx_dropped, delta.rx_dropped);
        bump(&self.rx_fifo_errors, delta.rx_fifo_errors);
        bump(&self.tx_packets, delta.tx_packets);
        bump(&self.tx_bytes, delta.tx_bytes);
        bump(&self.tx_errors, delta.tx_errors);
        bump(&self.tx_dropped, delta.tx_dropped);
        bump(&self.tx_fifo_errors, delta.tx_fifo_errors);
        self.seq.write_end(start);
    }

    /// Read-consistent snapshot of this slot.
    pub fn snapshot(&self) -> Stats64 {
        loop {
            let start = self.seq.read_begin();
            let snap = Stats64 {
                rx_packets: self.rx_packets.load(Ordering::Relaxed),
                rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
                rx_errors: self.rx_errors.load(Ordering::Relaxed),
                rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
                rx_fifo_errors: self.rx_fifo_errors.load(Ordering::Relaxed),
                tx_packets: self.tx_packets.load(Ordering::Relaxed),
                tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
                tx_errors: self.tx_errors.load(Ordering::Relaxed),
                tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
                tx_fifo_errors: self.tx_fifo_errors.load(Ordering::Relaxed),
            };
            if !self.seq.read_retry(start) {
                return snap;
            }
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64, by: u64) {
    if by != 0 {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// One [`CpuStats`] slot per CPU.
#[derive(Debug)]
pub struct PerCpuStats {
    slots: Box<[CpuStats]>,
}

impl PerCpuStats {
    pub fn new(cpus: usize) -> Self {
        let cpus = cpus.max(1);
        Self {
            slots: (0..cpus).map(|_| CpuStats::default()).collect(),
        }
    }

    /// Slot for `cpu`; CPU ids beyond the table share slots.
    pub fn slot(&self, cpu: usize) -> &CpuStats {
        &self.slots[cpu % self.slots.len()]
    }

    /// Apply a delta to the calling CPU's slot.
    pub fn record(&self, delta: &StatsDelta) {
        self.slot(cpu::current_cpu()).apply(delta);
    }

    /// Sum of every slot.
    pub fn aggregate(&self) -> Stats64 {
        let mut total = Stats64::default();
        for slot in self.slots.iter() {
            total.accumulate(&slot.snapshot());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_seqcount_generations() {
        let seq = SeqCount::new();
        let read = seq.read_begin();
        let start = seq.write_begin();
        assert_eq!(seq.sequence() & 1, 1);
        seq.write_end(start);
        assert_eq!(seq.sequence(), 2);
        assert!(seq.read_retry(read));
    }

    #[test]
    fn test_aggregate_across_slots() {
        let stats = PerCpuStats::new(4);
        stats.slot(0).apply(&StatsDelta {
            rx_packets: 2,
            rx_bytes: 128,
            ..Default::default()
        });
        stats.slot(3).apply(&StatsDelta {
            rx_packets: 1,
            tx_dropped: 5,
            ..Default::default()
        });
        // Wraps onto slot 1
        stats.slot(5).apply(&StatsDelta {
            tx_packets: 7,
            ..Default::default()
        });

        let total = stats.aggregate();
        assert_eq!(total.rx_packets, 3);
        assert_eq!(total.rx_bytes, 128);
        assert_eq!(total.tx_dropped, 5);
        assert_eq!(total.tx_packets, 7);
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        // Writers always bump packets and bytes together (1 packet = 64 bytes),
        // so every consistent snapshot satisfies bytes == 64 * packets.
        let stats = Arc::new(PerCpuStats::new(1));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        stats.slot(0).apply(&StatsDelta {
                            rx_packets: 1,
                            rx_bytes: 64,
                            ..Default::default()
                        });
                    }
                })
            })
            .collect();

        for _ in 0..2_000 {
            let snap = stats.aggregate();
            assert_eq!(snap.rx_bytes, snap.rx_packets * 64);
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(stats.aggregate().rx_packets, 8_000);
    }
}
