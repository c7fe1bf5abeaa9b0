//! Attach/detach state machine.
//!
//! ```text
//!            attach (fresh info + memory map, configure ok)
//!   DETACHED ------------------------------------------------> OK
//!      ^                                                        |
//!      +-------------------- migration begins ------------------+
//! ```
//!
//! A device starts DETACHED and is brought up by its first attach. A failed
//! attach leaves it DETACHED. Detach is idempotent.

use crate::control::{ControlRequest, DeviceConfigRequest, DRIVER_TYPE_GUEST, DRIVER_VERSION};
use crate::device::{AvpDevice, Datapath, DeviceId, DeviceStatus, Negotiated};
use crate::error::{AvpError, Result};
use crate::info::{regs, DeviceInfo, InterruptStatus, MemMap, MigrationStatus};
use crate::pool::{QueuePoller, RxThreadPool};
use std::sync::{Arc, PoisonError};

impl AvpDevice {
    /// Suspend the device: OK → DETACHED.
    ///
    /// Returns `false` when the device was already detached, in which case
    /// nothing is touched.
    pub fn detach(&self, pool: &RxThreadPool) -> bool {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status() == DeviceStatus::Detached {
            tracing::debug!(device = %self.id(), "Already detached");
            return false;
        }

        self.set_status(DeviceStatus::Detached);
        self.stack().set_link(self.id(), false);

        if let Err(e) = self.control(&ControlRequest::Shutdown) {
            tracing::warn!(device = %self.id(), error = %e, "Shutdown request failed, detaching anyway");
        }

        pool.unregister_response_poll(self.id());
        let unassigned = pool.remove_device(self.id());

        let mut flushed = 0;
        if let Some(dp) = self.install_datapath(None) {
            for q in &dp.tx {
                flushed += q.cache.lock().flush(q);
            }
        }

        tracing::info!(device = %self.id(), unassigned, flushed, "Device detached");
        true
    }

    /// Bring the device up against the host's current layout: DETACHED → OK.
    ///
    /// Reads fresh device-info and memory-map blocks, rebuilds translation
    /// and rings, and sends the full configuration. Any failure leaves the
    /// device DETACHED.
    pub fn attach(self: &Arc<Self>, pool: &RxThreadPool) -> Result<()> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status() == DeviceStatus::Ok {
            return Ok(());
        }

        let resources = self.resources();
        let info = DeviceInfo::read(&resources.info)?;
        if DeviceId(info.device_id) != self.id() {
            return Err(AvpError::InvalidDeviceInfo(format!(
                "device id changed from {} to {}",
                self.id(),
                DeviceId(info.device_id)
            )));
        }
        let memmap = MemMap::read(&resources.memmap)?;
        let negotiated = Negotiated::new(info, self.settings());

        if let Some(previous) = self.negotiated() {
            let lost = previous.features.difference(negotiated.features);
            if !lost.is_empty() {
                tracing::warn!(device = %self.id(), ?lost, "Host no longer offers previously enabled features");
            }
        }

        let dp = Arc::new(Datapath::build(
            resources,
            &memmap,
            &negotiated,
            self.settings().control,
        )?);
        self.mask_interrupts(InterruptStatus::RESPONSE | InterruptStatus::MIGRATION)?;

        // Installed while still DETACHED so response interrupts and pool
        // workers reach the new control channel; the datapath stays idle
        // until status is OK.
        self.install_datapath(Some(dp.clone()));
        let poller: Arc<dyn QueuePoller> = self.clone();
        pool.register_response_poll(poller.clone());
        let admin_up = self.is_admin_up();
        let request = ControlRequest::Configure(DeviceConfigRequest {
            device_id: self.id().0,
            driver_type: DRIVER_TYPE_GUEST,
            driver_version: DRIVER_VERSION,
            features: negotiated.features.bits(),
            num_tx_queues: negotiated.num_tx,
            num_rx_queues: negotiated.num_rx,
            if_up: admin_up,
        });
        if let Err(e) = dp.control.request(&request) {
            pool.unregister_response_poll(self.id());
            self.install_datapath(None);
            tracing::warn!(device = %self.id(), error = %e, "Configuration request failed, staying detached");
            return Err(e);
        }

        let num_rx = negotiated.num_rx;
        tracing::info!(
            device = %self.id(),
            ifname = %negotiated.info.ifname,
            rx_queues = num_rx,
            tx_queues = negotiated.num_tx,
            features = ?negotiated.features,
            "Device attached"
        );
        self.set_negotiated(negotiated);
        self.clear_fault();
        self.set_status(DeviceStatus::Ok);

        for queue in 0..num_rx {
            pool.assign(poller.clone(), queue);
        }
        if admin_up {
            self.stack().set_link(self.id(), true);
        }
        Ok(())
    }

    /// React to a migration interrupt and acknowledge it to the host.
    ///
    /// The acknowledge register receives the status that was handled, or
    /// `Error` when a re-attach failed.
    pub fn handle_migration(self: &Arc<Self>, pool: &RxThreadPool) -> Result<MigrationStatus> {
        let raw = self.read_register(regs::MIGRATION_STATUS)?;
        let status = MigrationStatus::from_raw(raw).ok_or_else(|| {
            AvpError::InvalidDeviceInfo(format!("unknown migration status {raw}"))
        })?;

        let outcome = match status {
            MigrationStatus::Detached => {
                self.detach(pool);
                Ok(MigrationStatus::Detached)
            }
            MigrationStatus::Attached => self.attach(pool).map(|()| MigrationStatus::Attached),
            other => {
                tracing::debug!(device = %self.id(), status = ?other, "Ignoring migration status");
                Ok(other)
            }
        };

        let ack = match &outcome {
            Ok(status) => *status,
            Err(e) => {
                tracing::error!(device = %self.id(), error = %e, "Re-attach failed");
                MigrationStatus::Error
            }
        };
        self.write_register(regs::MIGRATION_ACK, ack.as_raw())?;
        outcome
    }
}
