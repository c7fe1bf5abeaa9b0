//! # libavp
//!
//! Guest-side driver for the AVP paravirtual network interface.
//!
//! The host publishes a device as a handful of shared-memory regions: a
//! device-info block, a memory map, four MMIO registers and a data region
//! holding single-producer/single-consumer rings of host addresses plus
//! the packet-buffer pools those addresses point into. This crate attaches
//! to that layout, moves packets through it, talks to the host over the
//! request/response control rings and survives live migration by tearing
//! everything down and rebuilding it against the host's new layout.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────┐
//!  │                      DeviceManager                       │
//!  │   create / release devices, interrupts, CPU hotplug      │
//!  └───────────────┬──────────────────────────┬───────────────┘
//!                  │                          │
//!       ┌──────────┴──────────┐     ┌─────────┴──────────┐
//!       │      AvpDevice      │◄────│    RxThreadPool    │
//!       │ attach/detach, TX,  │poll │ one worker per CPU │
//!       │ RX, control channel │     └────────────────────┘
//!       └──────────┬──────────┘
//!                  │ rings of host addresses (Fifo)
//!       ┌──────────┴──────────┐
//!       │   shared memory     │  translated through the memory map
//!       │  (SharedRegion)     │  and the mempool descriptors
//!       └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use libavp::{AvpConfig, DeviceManager, InterruptStatus, NetStack};
//! # fn demo(stack: std::sync::Arc<dyn NetStack>, resources: libavp::DeviceResources) -> libavp::Result<()> {
//! let manager = DeviceManager::new(AvpConfig::load("/etc/avp")?, stack)?;
//! let device = manager.create_device(resources)?;
//! device.open()?;
//!
//! // From the interrupt handler
//! manager.handle_interrupt(device.id(), InterruptStatus::RESPONSE)?;
//! # Ok(())
//! # }
//! ```
//!
//! With the `loopback` feature, [`loopback::LoopbackHost`] provides an
//! in-process host peer to run all of this without a hypervisor.

pub mod addr;
pub mod buffer;
pub mod config;
pub mod control;
pub mod cpu;
pub mod device;
pub mod error;
pub mod fifo;
pub mod info;
mod lifecycle;
pub mod manager;
pub mod memory;
pub mod pool;
mod rx;
pub mod stack;
pub mod stats;
pub mod translate;
mod tx;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use addr::{BufferRef, HostAddr, LocalAddr};
pub use buffer::{BufferFlags, BufferHeader, Packet};
pub use config::AvpConfig;
pub use control::{ControlReply, ControlRequest, RequestKind};
pub use device::{AvpDevice, DeviceConfig, DeviceId, DeviceResources, DeviceStatus};
pub use error::{AvpError, Result};
pub use fifo::Fifo;
pub use info::{DeviceInfo, Features, InterruptStatus, MemMap, MigrationStatus, PeerMode};
pub use manager::DeviceManager;
pub use memory::{GuestMemory, SharedRegion};
pub use pool::{PollPolicy, QueuePoller, RxThreadPool};
pub use rx::MAX_RX_BURST;
pub use stack::NetStack;
pub use stats::Stats64;
pub use tx::{MbufCache, TxDrop, TxOutcome, MBUF_CACHE_SIZE};
