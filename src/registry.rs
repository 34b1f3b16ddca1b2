//! Device registry
//!
//! Tracks the RSP devices reported by the service and which of them are
//! claimed by an open [`DeviceController`](crate::controller::DeviceController)
//! in this process. A device can only be claimed once; the [`Claim`] releases
//! it when dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::Serialize;
use tracing::debug;

use sdrplay_api::{Api, DeviceDesc};

use crate::error::{Error, Result};
use crate::model::HwVersion;

/**
 * Information about an enumerated RSP device
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Index in the enumeration order
    pub index: usize,
    pub serial: String,
    pub model: HwVersion,
    /// Free to be selected
    pub available: bool,
    /// Claimed by this process
    pub claimed: bool,
}

#[derive(Default)]
struct RegistryState {
    devices: Vec<DeviceDesc>,
    claimed: HashSet<String>,
}

/// Process-wide record of devices and claims.
#[derive(Default)]
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The registry shared by controllers that are not given one.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(DeviceRegistry::new).clone()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enumerate the devices known to the service.
    ///
    /// The caller should hold the service's device API lock.
    pub fn refresh(&self, api: &dyn Api) -> Result<Vec<DeviceDesc>> {
        let devices = api.get_devices()?;
        debug!("found {} RSP device(s)", devices.len());
        self.state().devices = devices.clone();
        Ok(devices)
    }

    /// Devices seen by the last refresh.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let state = self.state();
        state
            .devices
            .iter()
            .enumerate()
            .map(|(index, d)| DeviceInfo {
                index,
                serial: d.serial.clone(),
                model: d.hw_ver,
                available: d.valid,
                claimed: state.claimed.contains(&d.serial),
            })
            .collect()
    }

    pub fn is_claimed(&self, serial: &str) -> bool {
        self.state().claimed.contains(serial)
    }

    /// Claim a device for exclusive use by one controller.
    pub fn claim(self: &Arc<Self>, serial: &str) -> Result<Claim> {
        if !self.state().claimed.insert(serial.to_string()) {
            return Err(Error::DeviceBusy(format!(
                "{} is already open in this process",
                serial
            )));
        }
        debug!("claimed {}", serial);
        Ok(Claim {
            registry: self.clone(),
            serial: serial.to_string(),
        })
    }
}

/// Exclusive claim on a device, released on drop.
#[derive(Debug)]
pub struct Claim {
    registry: Arc<DeviceRegistry>,
    serial: String,
}

impl Claim {
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry.state().claimed.remove(&self.serial);
        debug!("released {}", self.serial);
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("DeviceRegistry")
            .field("devices", &state.devices.len())
            .field("claimed", &state.claimed)
            .finish()
    }
}

/// List the RSP devices of a service
pub fn list_devices(api: &dyn Api) -> Result<Vec<DeviceInfo>> {
    let registry = DeviceRegistry::global();
    api.lock_device_api()?;
    let refreshed = registry.refresh(api);
    api.unlock_device_api()?;
    refreshed?;
    Ok(registry.devices())
}
