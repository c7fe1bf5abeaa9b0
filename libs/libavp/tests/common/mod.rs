//! Shared harness: one guest device attached to a loopback host.

#![allow(dead_code)]

use libavp::control::ControlTiming;
use libavp::device::DeviceSettings;
use libavp::loopback::{CollectingStack, LoopbackConfig, LoopbackHost, Responder};
use libavp::{AvpDevice, PollPolicy, RxThreadPool};
use std::sync::Arc;
use std::time::Duration;

/// Short control timing so timeouts stay cheap.
pub fn settings() -> DeviceSettings {
    DeviceSettings {
        control: ControlTiming {
            timeout: Duration::from_millis(50),
            attempts: 2,
        },
        ..Default::default()
    }
}

/// A pool whose only CPU is offline: every queue parks, so tests drive
/// `poll_rx` themselves.
pub fn quiet_pool() -> RxThreadPool {
    let pool = RxThreadPool::new(PollPolicy::default(), &[0]);
    pool.offline(0);
    pool
}

pub struct Harness {
    pub responder: Option<Responder>,
    pub host: Arc<LoopbackHost>,
    pub stack: Arc<CollectingStack>,
    pub device: Arc<AvpDevice>,
    pub pool: RxThreadPool,
}

impl Harness {
    /// A detached device with a running control responder.
    pub fn new(config: LoopbackConfig) -> Self {
        let host = Arc::new(LoopbackHost::new(config).expect("loopback host"));
        let stack = Arc::new(CollectingStack::new());
        let device = Arc::new(AvpDevice::new(
            host.device_id(),
            host.resources(),
            stack.clone(),
            settings(),
        ));
        let weak = Arc::downgrade(&device);
        let responder = host.spawn_responder(move || {
            if let Some(device) = weak.upgrade() {
                device.notify_response();
            }
        });
        Self {
            responder: Some(responder),
            host,
            stack,
            device,
            pool: quiet_pool(),
        }
    }

    /// A device attached with the default loopback layout.
    pub fn attached() -> Self {
        Self::attached_with(LoopbackConfig::default())
    }

    pub fn attached_with(config: LoopbackConfig) -> Self {
        let harness = Self::new(config);
        harness.device.attach(&harness.pool).expect("attach");
        harness
    }

    /// Stop answering control requests from a background thread.
    pub fn stop_responder(&mut self) {
        self.responder.take();
    }

    /// Poll a queue until it is empty.
    pub fn drain_rx(&self, queue: u16) -> usize {
        let mut total = 0;
        loop {
            let n = self.device.poll_rx(queue, 64).expect("poll");
            if n == 0 {
                return total;
            }
            total += n;
        }
    }
}

/// Frame filled with a recognizable pattern.
pub fn frame(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
