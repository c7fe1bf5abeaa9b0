//! Synchronous control channel.
//!
//! Configuration and link-state changes travel over a request ring, a
//! response ring and one scratch buffer the host can read. A request is
//! staged in the scratch buffer, its host address is enqueued on the request
//! ring, and the host answers by enqueuing the same address on the response
//! ring after writing a result code into the buffer.
//!
//! Control message layout (64 bytes):
//!
//! ```text
//! +0   kind      u32   1 change MTU, 2 interface up/down, 3 full config, 4 shutdown
//! +8   payload         new_mtu u32 | if_up u32 | DeviceConfigRequest
//! +48  result    i32   0 on success, negative error code from the host
//! ```
//!
//! Only one request per device is in flight at a time. A response left
//! behind by a request that already timed out is drained before the next
//! request is staged, so a late answer is never attributed to the wrong
//! request.

use crate::addr::{HostAddr, LocalAddr};
use crate::error::{AvpError, Result};
use crate::fifo::Fifo;
use crate::info::PeerMode;
use crate::memory::SharedRegion;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Size of a control message
pub const CONTROL_MSG_LEN: usize = 64;

const OFF_KIND: usize = 0;
const OFF_PAYLOAD: usize = 8;
const OFF_RESULT: usize = 48;

/// Driver type reported in the full-config request
pub const DRIVER_TYPE_GUEST: u32 = 1;

/// Driver version reported in the full-config request
pub const DRIVER_VERSION: u32 = crate::info::AVP_VERSION;

/// Control request discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestKind {
    ChangeMtu = 1,
    NetworkInterface = 2,
    Configure = 3,
    Shutdown = 4,
}

impl RequestKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::ChangeMtu),
            2 => Some(Self::NetworkInterface),
            3 => Some(Self::Configure),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Payload of a full-config request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfigRequest {
    pub device_id: u64,
    pub driver_type: u32,
    pub driver_version: u32,
    pub features: u32,
    pub num_tx_queues: u16,
    pub num_rx_queues: u16,
    pub if_up: bool,
}

/// A control request as staged in the scratch buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    ChangeMtu { mtu: u32 },
    NetworkInterface { up: bool },
    Configure(DeviceConfigRequest),
    Shutdown,
}

impl ControlRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::ChangeMtu { .. } => RequestKind::ChangeMtu,
            Self::NetworkInterface { .. } => RequestKind::NetworkInterface,
            Self::Configure(_) => RequestKind::Configure,
            Self::Shutdown => RequestKind::Shutdown,
        }
    }

    /// Encode with a cleared result field.
    pub fn encode(&self) -> [u8; CONTROL_MSG_LEN] {
        let mut raw = [0u8; CONTROL_MSG_LEN];
        raw[OFF_KIND..OFF_KIND + 4].copy_from_slice(&(self.kind() as u32).to_le_bytes());
        let p = OFF_PAYLOAD;
        match self {
            Self::ChangeMtu { mtu } => raw[p..p + 4].copy_from_slice(&mtu.to_le_bytes()),
            Self::NetworkInterface { up } => {
                raw[p..p + 4].copy_from_slice(&(*up as u32).to_le_bytes())
            }
            Self::Configure(cfg) => {
                raw[p..p + 8].copy_from_slice(&cfg.device_id.to_le_bytes());
                raw[p + 8..p + 12].copy_from_slice(&cfg.driver_type.to_le_bytes());
                raw[p + 12..p + 16].copy_from_slice(&cfg.driver_version.to_le_bytes());
                raw[p + 16..p + 20].copy_from_slice(&cfg.features.to_le_bytes());
                raw[p + 20..p + 22].copy_from_slice(&cfg.num_tx_queues.to_le_bytes());
                raw[p + 22..p + 24].copy_from_slice(&cfg.num_rx_queues.to_le_bytes());
                raw[p + 24..p + 28].copy_from_slice(&(cfg.if_up as u32).to_le_bytes());
            }
            Self::Shutdown => {}
        }
        raw
    }

    /// Decode a staged message (host side).
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < CONTROL_MSG_LEN {
            return Err(AvpError::InvalidDeviceInfo(format!(
                "control message too short: {} bytes",
                raw.len()
            )));
        }
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u64_at = |o: usize| u64::from(u32_at(o)) | (u64::from(u32_at(o + 4)) << 32);

        let raw_kind = u32_at(OFF_KIND);
        let kind = RequestKind::from_raw(raw_kind).ok_or_else(|| {
            AvpError::InvalidDeviceInfo(format!("unknown control request kind {raw_kind}"))
        })?;
        let p = OFF_PAYLOAD;
        Ok(match kind {
            RequestKind::ChangeMtu => Self::ChangeMtu { mtu: u32_at(p) },
            RequestKind::NetworkInterface => Self::NetworkInterface { up: u32_at(p) != 0 },
            RequestKind::Configure => Self::Configure(DeviceConfigRequest {
                device_id: u64_at(p),
                driver_type: u32_at(p + 8),
                driver_version: u32_at(p + 12),
                features: u32_at(p + 16),
                num_tx_queues: u16_at(p + 20),
                num_rx_queues: u16_at(p + 22),
                if_up: u32_at(p + 24) != 0,
            }),
            RequestKind::Shutdown => Self::Shutdown,
        })
    }
}

/// Read the result code of a message in `region` at `at`.
pub fn read_result(region: &SharedRegion, at: LocalAddr) -> Result<i32> {
    Ok(region.read_u32(at.add(OFF_RESULT as u64))? as i32)
}

/// Write the result code of a message in `region` at `at` (host side).
pub fn write_result(region: &SharedRegion, at: LocalAddr, code: i32) -> Result<()> {
    region.write_u32(at.add(OFF_RESULT as u64), code as u32)
}

/// How a request completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlReply {
    /// The host answered with success
    Completed,
    /// The device has no live guest peer; nothing was sent
    Bypassed,
}

/// Timing of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlTiming {
    /// Wait per attempt
    pub timeout: Duration,
    /// Attempts before giving up
    pub attempts: u32,
}

impl Default for ControlTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            attempts: 2,
        }
    }
}

/// Scratch buffer shared with the host.
#[derive(Clone, Debug)]
pub struct Scratch {
    pub region: Arc<SharedRegion>,
    /// Where the guest writes the message
    pub local: LocalAddr,
    /// Address enqueued on the rings
    pub host: HostAddr,
}

/// One device's control channel.
pub struct ControlChannel {
    request: Fifo,
    response: Fifo,
    scratch: Scratch,
    mode: PeerMode,
    timing: ControlTiming,
    // Serializes requests for this device
    lock: Mutex<()>,
    // Waiters park here until a response arrives or the channel is interrupted
    signal: Mutex<()>,
    arrived: Condvar,
    cancel: AtomicBool,
}

impl ControlChannel {
    pub fn new(
        request: Fifo,
        response: Fifo,
        scratch: Scratch,
        mode: PeerMode,
        timing: ControlTiming,
    ) -> Self {
        Self {
            request,
            response,
            scratch,
            mode,
            timing,
            lock: Mutex::new(()),
            signal: Mutex::new(()),
            arrived: Condvar::new(),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    /// Send a request and wait for the host's answer.
    pub fn request(&self, req: &ControlRequest) -> Result<ControlReply> {
        if self.mode != PeerMode::Guest {
            tracing::debug!(kind = ?req.kind(), mode = ?self.mode, "No guest peer, control request bypassed");
            return Ok(ControlReply::Bypassed);
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel.store(false, Ordering::Release);

        let stale = self.response.drain();
        if stale > 0 {
            tracing::warn!(stale, "Discarded stale control responses");
        }

        let Scratch {
            region,
            local,
            host,
        } = &self.scratch;
        region.write(*local, &req.encode())?;
        if self.request.put(&[*host]) != 1 {
            return Err(AvpError::RequestRingFull);
        }

        let mut answered = false;
        for attempt in 1..=self.timing.attempts {
            if self.wait_response()? {
                answered = true;
                break;
            }
            tracing::debug!(kind = ?req.kind(), attempt, "Control request attempt timed out");
        }
        if !answered {
            tracing::warn!(kind = ?req.kind(), attempts = self.timing.attempts, "Control request timed out");
            return Err(AvpError::Timeout {
                attempts: self.timing.attempts,
            });
        }

        let mut entry = [HostAddr::NULL];
        self.response.get(&mut entry);
        if entry[0] != *host {
            tracing::error!(expected = %host, found = %entry[0], "Control response does not match request");
            return Err(AvpError::ResponseMismatch {
                expected: *host,
                found: entry[0],
            });
        }

        match read_result(region, *local)? {
            0 => Ok(ControlReply::Completed),
            code => {
                tracing::warn!(kind = ?req.kind(), code, "Host rejected control request");
                Err(AvpError::Rejected {
                    kind: req.kind(),
                    code,
                })
            }
        }
    }

    /// Wait one attempt. `Ok(true)` when a response is queued.
    fn wait_response(&self) -> Result<bool> {
        let guard = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        let (_guard, _) = self
            .arrived
            .wait_timeout_while(guard, self.timing.timeout, |_| {
                self.response.is_empty() && !self.cancel.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        if self.cancel.load(Ordering::Acquire) {
            return Err(AvpError::Interrupted);
        }
        Ok(!self.response.is_empty())
    }

    /// Wake a waiter; called on a response interrupt.
    pub fn notify_response(&self) {
        let _guard = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        self.arrived.notify_all();
    }

    /// Wake a waiter if the host queued a response without interrupting.
    pub fn poll_response(&self) -> bool {
        if self.response.is_empty() {
            return false;
        }
        self.notify_response();
        true
    }

    /// Abandon the request in flight, if any.
    pub fn interrupt(&self) {
        self.cancel.store(true, Ordering::Release);
        self.notify_response();
    }
}

impl core::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("mode", &self.mode)
            .field("scratch", &self.scratch.host)
            .field("timing", &self.timing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000;
    const REQ: u64 = BASE;
    const RESP: u64 = BASE + 0x40;
    const SCRATCH: u64 = BASE + 0x80;
    const SCRATCH_HOST: u64 = 0x7f00_0080;

    struct Host {
        region: Arc<SharedRegion>,
        request: Fifo,
        response: Fifo,
    }

    fn channel(mode: PeerMode) -> (ControlChannel, Host) {
        let region = Arc::new(SharedRegion::new_zeroed(LocalAddr::new(BASE), 0x100));
        let request = Fifo::init(region.clone(), LocalAddr::new(REQ), 1).unwrap();
        let response = Fifo::init(region.clone(), LocalAddr::new(RESP), 1).unwrap();
        let chan = ControlChannel::new(
            request.clone(),
            response.clone(),
            Scratch {
                region: region.clone(),
                local: LocalAddr::new(SCRATCH),
                host: HostAddr::new(SCRATCH_HOST),
            },
            mode,
            ControlTiming {
                timeout: Duration::from_millis(20),
                attempts: 2,
            },
        );
        (
            chan,
            Host {
                region,
                request,
                response,
            },
        )
    }

    #[test]
    fn test_message_layout() {
        let req = ControlRequest::Configure(DeviceConfigRequest {
            device_id: 0x1122,
            driver_type: DRIVER_TYPE_GUEST,
            driver_version: DRIVER_VERSION,
            features: 1,
            num_tx_queues: 2,
            num_rx_queues: 3,
            if_up: true,
        });
        let raw = req.encode();
        assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(raw[8..16].try_into().unwrap()), 0x1122);
        assert_eq!(u16::from_le_bytes(raw[28..30].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(raw[30..32].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(raw[32..36].try_into().unwrap()), 1);
        assert_eq!(ControlRequest::decode(&raw).unwrap(), req);

        let mtu = ControlRequest::ChangeMtu { mtu: 9000 }.encode();
        assert_eq!(u32::from_le_bytes(mtu[8..12].try_into().unwrap()), 9000);
    }

    #[test]
    fn test_bypassed_without_guest_peer() {
        let (chan, host) = channel(PeerMode::Host);
        assert_eq!(
            chan.request(&ControlRequest::Shutdown).unwrap(),
            ControlReply::Bypassed
        );
        assert!(host.request.is_empty());
    }

    #[test]
    fn test_completed_and_rejected() {
        let (chan, host) = channel(PeerMode::Guest);
        let chan = Arc::new(chan);

        let responder = |code: i32| {
            let chan = chan.clone();
            let region = host.region.clone();
            let request = host.request.clone();
            let response = host.response.clone();
            std::thread::spawn(move || {
                let mut entry = [HostAddr::NULL];
                while request.get(&mut entry) == 0 {
                    std::thread::yield_now();
                }
                write_result(&region, LocalAddr::new(SCRATCH), code).unwrap();
                response.put(&entry);
                chan.notify_response();
            })
        };

        let t = responder(0);
        assert_eq!(
            chan.request(&ControlRequest::NetworkInterface { up: true })
                .unwrap(),
            ControlReply::Completed
        );
        t.join().unwrap();

        let t = responder(-22);
        assert!(matches!(
            chan.request(&ControlRequest::ChangeMtu { mtu: 1500 }),
            Err(AvpError::Rejected {
                kind: RequestKind::ChangeMtu,
                code: -22
            })
        ));
        t.join().unwrap();
    }

    #[test]
    fn test_mismatched_response_is_violation() {
        let (chan, host) = channel(PeerMode::Guest);
        let chan = Arc::new(chan);
        let t = {
            let request = host.request.clone();
            let response = host.response.clone();
            std::thread::spawn(move || {
                let mut entry = [HostAddr::NULL];
                while request.get(&mut entry) == 0 {
                    std::thread::yield_now();
                }
                response.put(&[HostAddr::new(0xbad0)]);
            })
        };
        let err = chan.request(&ControlRequest::Shutdown).unwrap_err();
        t.join().unwrap();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_interrupt_abandons_wait() {
        let (chan, _host) = channel(PeerMode::Guest);
        let chan = Arc::new(ControlChannel {
            timing: ControlTiming {
                timeout: Duration::from_secs(10),
                attempts: 2,
            },
            ..chan
        });
        let waiter = {
            let chan = chan.clone();
            std::thread::spawn(move || chan.request(&ControlRequest::Shutdown))
        };
        std::thread::sleep(Duration::from_millis(20));
        chan.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(AvpError::Interrupted)));
    }
}
