//! The network-stack side of a device.

use crate::buffer::Packet;
use crate::device::DeviceId;

/// Receives packets and link changes from AVP devices.
///
/// Calls come from RX worker threads and from lifecycle transitions, so
/// implementations must be cheap and must not call back into the device.
pub trait NetStack: Send + Sync {
    /// Allocate a packet able to hold `len` bytes. `None` drops the rest of
    /// the current receive burst.
    fn alloc_rx(&self, len: usize) -> Option<Packet> {
        Some(Packet::with_capacity(len))
    }

    /// Take ownership of a received packet.
    fn deliver(&self, device: DeviceId, queue: u16, packet: Packet);

    /// Carrier change
    fn set_link(&self, _device: DeviceId, _up: bool) {}
}
