//! Device catalog: enumeration, exclusive open and hot-plug monitoring.
//!
//! - `NusbCatalog`: the host USB stack
//! - `MockCatalog`: scripted devices for tests

mod mock;
mod monitor;
mod nusb;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

pub use self::mock::MockCatalog;
pub use self::monitor::{DeviceEvent, DeviceMonitor};
pub use self::nusb::NusbCatalog;

use crate::channel::TransferChannel;
use crate::device::{DeviceDescriptor, DeviceIdentity};
use crate::error::UsbError;
use crate::protocol::constants::{APPLE_VENDOR_ID, SUPPORTED_PIDS};
use crate::transport::UsbBackend;

/// Locates attached devices and hands out exclusive channels.
pub trait DeviceCatalog {
    type Backend: UsbBackend;

    /// Snapshot of attached devices, optionally restricted to `bDeviceClass`.
    fn list_attached(&self, device_class: Option<u8>) -> Result<Vec<DeviceDescriptor>, UsbError>;

    /// Open the first device matching `vendor_id:product_id`.
    fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<TransferChannel<Self::Backend>, UsbError>;

    /// Watch for devices matching `filter` coming and going.
    fn monitor(
        &self,
        filter: DeviceFilter,
        poll_interval: Duration,
    ) -> Result<DeviceMonitor, UsbError>;

    /// Open whichever Apple DFU or recovery mode device is attached first.
    fn open_apple(&self) -> Result<TransferChannel<Self::Backend>, UsbError> {
        let found = self
            .list_attached(None)?
            .into_iter()
            .find(|d| DeviceFilter::apple_modes().matches(d))
            .ok_or(UsbError::DeviceNotFound {
                vid: APPLE_VENDOR_ID,
                pid: 0,
            })?;
        self.open(found.vendor_id, found.product_id)
    }
}

/// Which devices a monitor reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    /// Accepted product ids; empty accepts any.
    pub product_ids: Vec<u16>,
    pub device_class: Option<u8>,
}

impl DeviceFilter {
    /// Accepts every device.
    pub fn any() -> Self {
        Self::default()
    }

    /// Apple devices in DFU or recovery mode.
    pub fn apple_modes() -> Self {
        Self {
            vendor_id: Some(APPLE_VENDOR_ID),
            product_ids: SUPPORTED_PIDS.to_vec(),
            device_class: None,
        }
    }

    pub fn identity(identity: DeviceIdentity) -> Self {
        Self {
            vendor_id: Some(identity.vendor_id),
            product_ids: vec![identity.product_id],
            device_class: None,
        }
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        self.vendor_id.is_none_or(|vid| device.vendor_id == vid)
            && (self.product_ids.is_empty() || self.product_ids.contains(&device.product_id))
            && self.device_class.is_none_or(|class| device.class == class)
    }
}

/// Locations of devices currently opened through a catalog.
#[derive(Debug, Clone, Default)]
pub(crate) struct OpenRegistry {
    open: Arc<Mutex<HashSet<String>>>,
}

impl OpenRegistry {
    /// Mark `location` as open. Fails if it already is.
    pub(crate) fn claim(&self, location: &str) -> Result<ClaimGuard, UsbError> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| UsbError::AccessDenied("open registry poisoned".into()))?;
        if !open.insert(location.to_string()) {
            return Err(UsbError::AccessDenied(format!(
                "device at {location} is already open"
            )));
        }
        debug!(location, "Device claimed");
        Ok(ClaimGuard {
            location: location.to_string(),
            registry: Arc::clone(&self.open),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self, location: &str) -> bool {
        self.open
            .lock()
            .map(|open| open.contains(location))
            .unwrap_or(false)
    }
}

/// Releases a registry entry when dropped together with its device handle.
#[derive(Debug)]
pub struct ClaimGuard {
    location: String,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Ok(mut open) = self.registry.lock() {
            open.remove(&self.location);
            debug!(location = %self.location, "Device released");
        }
    }
}

/// Restrict a snapshot to one device class.
pub(crate) fn filter_class(
    devices: Vec<DeviceDescriptor>,
    device_class: Option<u8>,
) -> Vec<DeviceDescriptor> {
    match device_class {
        Some(class) => devices.into_iter().filter(|d| d.class == class).collect(),
        None => devices,
    }
}
