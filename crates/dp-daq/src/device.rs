//! Device enumeration, caching, and channel validation

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use dp_core::{ai_index, ao_index, do_line, ChannelSpec, ValidationError};

use crate::{DaqDriver, DaqResult};

/// Static description of one DAQ device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub product_type: String,
    pub product_category: String,
    /// Maximum AO sample clock rate, per channel.
    pub max_ao_rate_hz: f64,
    pub ao_line_count: u32,
    pub do_line_count: u32,
}

/// Cached view over a driver's device list.
///
/// Enumeration and driver-version lookup can be slow, so both are cached
/// at construction and refreshed only on explicit operator request.
pub struct DeviceRegistry {
    driver: Arc<dyn DaqDriver>,
    devices: RwLock<Vec<DeviceDescriptor>>,
    driver_version: RwLock<Option<String>>,
}

impl DeviceRegistry {
    pub fn new(driver: Arc<dyn DaqDriver>) -> Self {
        let registry = Self {
            driver,
            devices: RwLock::new(Vec::new()),
            driver_version: RwLock::new(None),
        };
        registry.refresh();
        registry
    }

    /// Re-enumerate devices and re-read the driver version.
    pub fn refresh(&self) {
        match self.driver.devices() {
            Ok(devices) => {
                log::info!("Enumerated {} DAQ device(s)", devices.len());
                *self.devices.write() = devices;
            }
            Err(e) => log::error!("Device enumeration failed: {}", e),
        }
        *self.driver_version.write() = self.driver.driver_version();
    }

    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.read().clone()
    }

    pub fn driver_version(&self) -> Option<String> {
        self.driver_version.read().clone()
    }

    pub fn driver(&self) -> Arc<dyn DaqDriver> {
        Arc::clone(&self.driver)
    }

    /// Look up a device in the cached enumeration. A miss never touches
    /// the hardware; a device plugged in since the last scan only appears
    /// after an explicit `refresh()`.
    pub fn find(&self, name: &str) -> Option<DeviceDescriptor> {
        self.devices.read().iter().find(|d| d.name == name).cloned()
    }

    /// Validate a channel spec against a device: structural checks plus
    /// every named line must exist on the device.
    pub fn validate(
        &self,
        device: &DeviceDescriptor,
        spec: &ChannelSpec,
    ) -> Result<(), ValidationError> {
        spec.check()?;

        for name in &spec.ao_channels {
            let index = ao_index(name).ok_or_else(|| ValidationError::BadChannelName(name.clone()))?;
            if index >= device.ao_line_count {
                return Err(ValidationError::ChannelNotPresent(name.clone()));
            }
        }
        for name in &spec.do_channels {
            let (_, line) = do_line(name).ok_or_else(|| ValidationError::BadChannelName(name.clone()))?;
            if line >= device.do_line_count {
                return Err(ValidationError::ChannelNotPresent(name.clone()));
            }
        }
        // AI lines are reserved for future capture. The descriptor does not
        // carry an AI count, so only the naming scheme is checked.
        for name in &spec.ai_channels {
            ai_index(name).ok_or_else(|| ValidationError::BadChannelName(name.clone()))?;
        }

        Ok(())
    }

    /// Validate that the device supports the requested sample rate.
    pub fn validate_rate(&self, device: &DeviceDescriptor, rate_hz: u32) -> DaqResult<()> {
        if f64::from(rate_hz) > device.max_ao_rate_hz {
            return Err(crate::DaqError::TaskCreation(format!(
                "{} Hz exceeds {} max AO rate of {} Hz",
                rate_hz, device.name, device.max_ao_rate_hz
            )));
        }
        Ok(())
    }
}
