//! Catalog backed by the host USB stack through nusb.

use std::time::Duration;

use nusb::{DeviceInfo, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::{DeviceCatalog, DeviceFilter, DeviceMonitor, OpenRegistry, filter_class};
use crate::channel::TransferChannel;
use crate::device::DeviceDescriptor;
use crate::error::UsbError;
use crate::transport::NusbBackend;

/// Timeout for the descriptor read done while opening.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Production catalog.
#[derive(Debug, Clone, Default)]
pub struct NusbCatalog {
    registry: OpenRegistry,
}

impl NusbCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn enumerate() -> Result<Vec<DeviceInfo>, UsbError> {
        Ok(list_devices()
            .wait()
            .map_err(|e| UsbError::Enumeration(e.to_string()))?
            .collect())
    }

    fn snapshot() -> Result<Vec<DeviceDescriptor>, UsbError> {
        Ok(Self::enumerate()?.iter().map(describe).collect())
    }
}

/// Descriptor fields available without opening the device.
fn describe(info: &DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        class: info.class(),
        subclass: info.subclass(),
        protocol: info.protocol(),
        serial_number: info.serial_number().map(str::to_string),
        friendly_name: info
            .product_string()
            .or(info.manufacturer_string())
            .map(str::to_string),
        manufacturer: info.manufacturer_string().map(str::to_string),
        bus_id: info.bus_id().to_string(),
        address: info.device_address(),
        configuration: Vec::new(),
    }
}

impl DeviceCatalog for NusbCatalog {
    type Backend = NusbBackend;

    #[instrument(level = "debug", skip(self))]
    fn list_attached(&self, device_class: Option<u8>) -> Result<Vec<DeviceDescriptor>, UsbError> {
        let devices = filter_class(Self::snapshot()?, device_class);
        debug!(count = devices.len(), "Devices enumerated");
        Ok(devices)
    }

    #[instrument(level = "info", skip(self), fields(vid = %format!("{:04X}", vendor_id), pid = %format!("{:04X}", product_id)))]
    fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<TransferChannel<NusbBackend>, UsbError> {
        let info = Self::enumerate()?
            .into_iter()
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or(UsbError::DeviceNotFound {
                vid: vendor_id,
                pid: product_id,
            })?;

        let mut descriptor = describe(&info);
        let claim = self.registry.claim(&descriptor.location())?;
        let backend = NusbBackend::open(&info)?;

        match backend.configuration_descriptor(DESCRIPTOR_TIMEOUT) {
            Ok(raw) => descriptor.configuration = raw,
            Err(e) => warn!(error = %e, "Configuration descriptor unavailable"),
        }

        info!(device = %descriptor, "Device ready");
        Ok(TransferChannel::new(backend, descriptor, Some(claim)))
    }

    fn monitor(
        &self,
        filter: DeviceFilter,
        poll_interval: Duration,
    ) -> Result<DeviceMonitor, UsbError> {
        DeviceMonitor::spawn(Self::snapshot, filter, poll_interval)
    }
}
