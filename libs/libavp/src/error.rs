//! Error types for libavp.
//!
//! Backpressure (a full ring, an exhausted buffer cache) is never an error:
//! it is absorbed by the engines and shows up in the statistics. What lands
//! here is either a construction-time problem, a control-channel failure, or
//! a protocol violation that desynchronizes the channel with the host.

use crate::addr::{HostAddr, LocalAddr};
use crate::control::RequestKind;
use crate::device::DeviceId;
use thiserror::Error;

/// Result type alias using libavp's Error type.
pub type Result<T> = std::result::Result<T, AvpError>;

/// Errors raised by the AVP guest driver.
#[derive(Error, Debug)]
pub enum AvpError {
    // Shared memory
    #[error("local address {addr} (+{len} bytes) is outside every mapped region")]
    OutOfBounds { addr: LocalAddr, len: usize },

    #[error("local address {0} is not aligned for atomic access")]
    Misaligned(LocalAddr),

    // Rings
    #[error("invalid ring capacity {0} (must be a non-zero power of two)")]
    InvalidRingCapacity(u32),

    #[error("ring header at {addr} is corrupt: {reason}")]
    CorruptRing { addr: LocalAddr, reason: &'static str },

    // Translation
    #[error("host address {0} does not fall inside any registered pool")]
    Untranslatable(HostAddr),

    #[error("memory pool at {0} overlaps an existing registration")]
    PoolOverlap(HostAddr),

    #[error("too many memory pools registered (max {0})")]
    TooManyPools(usize),

    // Buffer chains
    #[error("corrupt buffer chain at {addr}: {reason}")]
    CorruptChain { addr: HostAddr, reason: &'static str },

    #[error("packet overflow: {attempted} bytes into a {capacity}-byte packet")]
    PacketOverflow { capacity: usize, attempted: usize },

    // Device info
    #[error("bad magic in {block} block: {found:#010x}")]
    BadMagic { block: &'static str, found: u32 },

    #[error("unsupported device version {0:#x}")]
    UnsupportedVersion(u32),

    #[error("invalid device info: {0}")]
    InvalidDeviceInfo(String),

    // Control channel
    #[error("control request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("control request interrupted")]
    Interrupted,

    #[error("control response mismatch: expected {expected}, got {found}")]
    ResponseMismatch { expected: HostAddr, found: HostAddr },

    #[error("control request ring is full")]
    RequestRingFull,

    #[error("host rejected {kind:?} request with code {code}")]
    Rejected { kind: RequestKind, code: i32 },

    // Device state
    #[error("device is detached")]
    Detached,

    #[error("device is faulted and must be re-attached")]
    Faulted,

    #[error("invalid MTU {mtu} (allowed {min}..={max})")]
    InvalidMtu { mtu: u32, min: u32, max: u32 },

    #[error("invalid queue index {0}")]
    InvalidQueue(u16),

    #[error("CPU {0} is not an online eligible CPU")]
    InvalidCpu(usize),

    #[error("device {0} already exists")]
    DeviceExists(DeviceId),

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    // Configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AvpError {
    /// Whether this error means the guest and host no longer agree on the
    /// contents of the shared rings.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            AvpError::Untranslatable(_)
                | AvpError::ResponseMismatch { .. }
                | AvpError::CorruptChain { .. }
                | AvpError::CorruptRing { .. }
        )
    }

    /// Whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AvpError::Timeout { .. } | AvpError::Interrupted | AvpError::Detached
        )
    }
}
