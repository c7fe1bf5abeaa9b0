//! Device registry and the management surface.
//!
//! The manager owns every device and the RX thread pool they share. The
//! PCI collaborator calls [`DeviceManager::create_device`] when the host
//! publishes a device and routes interrupts to
//! [`DeviceManager::handle_interrupt`]; the platform hotplug mechanism calls
//! [`DeviceManager::cpu_online`] / [`DeviceManager::cpu_offline`].

use crate::config::AvpConfig;
use crate::device::{AvpDevice, DeviceConfig, DeviceId, DeviceResources};
use crate::error::{AvpError, Result};
use crate::info::{DeviceInfo, InterruptStatus};
use crate::pool::RxThreadPool;
use crate::stack::NetStack;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct DeviceManager {
    config: AvpConfig,
    stack: Arc<dyn NetStack>,
    pool: RxThreadPool,
    devices: spin::RwLock<BTreeMap<DeviceId, Arc<AvpDevice>>>,
}

impl DeviceManager {
    pub fn new(config: AvpConfig, stack: Arc<dyn NetStack>) -> Result<Self> {
        config.validate()?;
        let pool = RxThreadPool::new(config.poll_policy(), &config.cpus.eligible);
        tracing::info!(cpus = ?pool.eligible_cpus(), "AVP device manager started");
        Ok(Self {
            config,
            stack,
            pool,
            devices: spin::RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &AvpConfig {
        &self.config
    }

    pub fn pool(&self) -> &RxThreadPool {
        &self.pool
    }

    /// Create and attach a device from the regions the host published.
    pub fn create_device(&self, resources: DeviceResources) -> Result<Arc<AvpDevice>> {
        let info = DeviceInfo::read(&resources.info)?;
        let id = DeviceId(info.device_id);
        let device = Arc::new(AvpDevice::new(
            id,
            resources,
            self.stack.clone(),
            self.config.device_settings(),
        ));

        {
            let mut devices = self.devices.write();
            if devices.contains_key(&id) {
                return Err(AvpError::DeviceExists(id));
            }
            // Registered before attaching so response interrupts for the
            // configuration request can be routed
            devices.insert(id, device.clone());
        }

        if let Err(e) = device.attach(&self.pool) {
            self.devices.write().remove(&id);
            tracing::warn!(device = %id, error = %e, "Device creation failed");
            return Err(e);
        }
        tracing::info!(device = %id, ifname = %info.ifname, "Device created");
        Ok(device)
    }

    /// Detach and forget a device.
    pub fn release_device(&self, id: DeviceId) -> Result<()> {
        let device = self
            .devices
            .write()
            .remove(&id)
            .ok_or(AvpError::DeviceNotFound(id))?;
        device.detach(&self.pool);
        if let Err(e) = device.mask_interrupts(InterruptStatus::empty()) {
            tracing::warn!(device = %id, error = %e, "Could not mask interrupts");
        }
        tracing::info!(device = %id, "Device released");
        Ok(())
    }

    pub fn device(&self, id: DeviceId) -> Result<Arc<AvpDevice>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or(AvpError::DeviceNotFound(id))
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.read().keys().copied().collect()
    }

    /// Current negotiated configuration of a device
    pub fn query_config(&self, id: DeviceId) -> Result<DeviceConfig> {
        self.device(id)?.config()
    }

    /// Interrupt entry point.
    pub fn handle_interrupt(&self, id: DeviceId, status: InterruptStatus) -> Result<()> {
        let device = self.device(id)?;
        if status.contains(InterruptStatus::RESPONSE) {
            device.notify_response();
        }
        if status.contains(InterruptStatus::MIGRATION) {
            device.handle_migration(&self.pool)?;
        }
        Ok(())
    }

    /// Platform hotplug: a CPU came online.
    pub fn cpu_online(&self, cpu: usize) -> bool {
        self.pool.online(cpu)
    }

    /// Platform hotplug: a CPU is going offline.
    pub fn cpu_offline(&self, cpu: usize) -> bool {
        self.pool.offline(cpu)
    }

    /// Release every device and stop all workers.
    pub fn shutdown(&self) {
        for id in self.devices() {
            if let Err(e) = self.release_device(id) {
                tracing::warn!(device = %id, error = %e, "Release failed during shutdown");
            }
        }
        self.pool.shutdown();
    }
}
