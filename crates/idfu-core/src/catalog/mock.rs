//! In-memory catalog for tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{DeviceCatalog, DeviceFilter, DeviceMonitor, OpenRegistry, filter_class};
use crate::channel::TransferChannel;
use crate::device::DeviceDescriptor;
use crate::error::UsbError;
use crate::transport::{MockBackend, MockHandle};

#[derive(Debug, Default)]
struct Attached {
    devices: Vec<(DeviceDescriptor, MockHandle)>,
    enumeration_fails: bool,
}

/// Catalog of scripted devices. Devices can be attached and detached while
/// channels and monitors are live.
#[derive(Debug, Clone, Default)]
pub struct MockCatalog {
    attached: Arc<Mutex<Attached>>,
    registry: OpenRegistry,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Attached> {
        self.attached.lock().unwrap()
    }

    /// Attach a device; the returned handle scripts its backend.
    pub fn attach(&self, descriptor: DeviceDescriptor) -> MockHandle {
        let handle = MockHandle::new();
        self.lock().devices.push((descriptor, handle.clone()));
        handle
    }

    /// Detach the device at `location`. Open channels see a disconnect.
    pub fn detach(&self, location: &str) {
        self.lock().devices.retain(|(d, handle)| {
            if d.location() == location {
                handle.disconnect();
                false
            } else {
                true
            }
        });
    }

    /// Make every enumeration fail until cleared.
    pub fn fail_enumeration(&self, fail: bool) {
        self.lock().enumeration_fails = fail;
    }

    fn snapshot(attached: &Mutex<Attached>) -> Result<Vec<DeviceDescriptor>, UsbError> {
        let attached = attached
            .lock()
            .map_err(|_| UsbError::Enumeration("mock catalog poisoned".into()))?;
        if attached.enumeration_fails {
            return Err(UsbError::Enumeration("device registry unavailable".into()));
        }
        Ok(attached.devices.iter().map(|(d, _)| d.clone()).collect())
    }
}

impl DeviceCatalog for MockCatalog {
    type Backend = MockBackend;

    fn list_attached(&self, device_class: Option<u8>) -> Result<Vec<DeviceDescriptor>, UsbError> {
        Ok(filter_class(Self::snapshot(&self.attached)?, device_class))
    }

    fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<TransferChannel<MockBackend>, UsbError> {
        let (descriptor, handle) = self
            .lock()
            .devices
            .iter()
            .find(|(d, _)| d.vendor_id == vendor_id && d.product_id == product_id)
            .cloned()
            .ok_or(UsbError::DeviceNotFound {
                vid: vendor_id,
                pid: product_id,
            })?;

        let claim = self.registry.claim(&descriptor.location())?;
        let backend = MockBackend::with_handle(descriptor.identity(), handle);
        Ok(TransferChannel::new(backend, descriptor, Some(claim)))
    }

    fn monitor(
        &self,
        filter: DeviceFilter,
        poll_interval: Duration,
    ) -> Result<DeviceMonitor, UsbError> {
        let attached = Arc::clone(&self.attached);
        DeviceMonitor::spawn(move || Self::snapshot(&attached), filter, poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DeviceEvent;
    use crate::channel::ChannelState;
    use crate::device::DeviceIdentity;
    use crate::error::ErrorKind;

    fn recovery() -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x05AC,
            product_id: 0x1281,
            serial_number: Some("CPID:8010 ECID:001A2B3C4D5E6F".into()),
            friendly_name: Some("Apple Mobile Device (Recovery Mode)".into()),
            bus_id: "2".into(),
            address: 7,
            ..Default::default()
        }
    }

    fn hub() -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x1D6B,
            product_id: 0x0002,
            class: 9,
            bus_id: "2".into(),
            address: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_list_attached() {
        let catalog = MockCatalog::new();
        catalog.attach(recovery());
        catalog.attach(hub());

        assert_eq!(catalog.list_attached(None).unwrap().len(), 2);
        let hubs = catalog.list_attached(Some(9)).unwrap();
        assert_eq!(hubs, vec![hub()]);

        catalog.fail_enumeration(true);
        let err = catalog.list_attached(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Enumeration);
    }

    #[test]
    fn test_open_exclusive() {
        let catalog = MockCatalog::new();
        catalog.attach(recovery());

        let channel = catalog.open(0x05AC, 0x1281).unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.identity(), DeviceIdentity::APPLE_RECOVERY);
        assert_eq!(
            channel.serial_number(),
            Some("CPID:8010 ECID:001A2B3C4D5E6F")
        );

        let err = catalog.open(0x05AC, 0x1281).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        drop(channel);
        assert!(catalog.open(0x05AC, 0x1281).is_ok());
    }

    #[test]
    fn test_open_missing() {
        let catalog = MockCatalog::new();
        catalog.attach(hub());
        let err = catalog.open(0x05AC, 0x1227).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(catalog.open_apple().unwrap_err().kind(), ErrorKind::DeviceNotFound);
    }

    #[test]
    fn test_reenumerate_releases_claim() {
        let catalog = MockCatalog::new();
        catalog.attach(recovery());

        let mut channel = catalog.open_apple().unwrap();
        channel.reenumerate_device().unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);

        // Handle released, reopen succeeds while the old channel is still alive
        let reopened = catalog.open_apple().unwrap();
        assert_eq!(reopened.state(), ChannelState::Open);
    }

    #[test]
    fn test_detach_disconnects_open_channel() {
        let catalog = MockCatalog::new();
        catalog.attach(recovery());
        let mut channel = catalog.open_apple().unwrap();

        catalog.detach(&recovery().location());
        let err = channel.set_configuration(1).unwrap_err();
        assert!(matches!(err, UsbError::Disconnected));
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test]
    fn test_monitor_reports_detach() {
        let catalog = MockCatalog::new();
        catalog.attach(recovery());

        let monitor = catalog
            .monitor(DeviceFilter::apple_modes(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(
            monitor.recv_timeout(Duration::from_secs(1)),
            Some(DeviceEvent::Connected(recovery()))
        );

        catalog.detach(&recovery().location());
        assert_eq!(
            monitor.recv_timeout(Duration::from_secs(2)),
            Some(DeviceEvent::Disconnected(recovery()))
        );
    }

    #[test]
    fn test_monitor_registration_failure() {
        let catalog = MockCatalog::new();
        catalog.fail_enumeration(true);
        let err = catalog
            .monitor(DeviceFilter::any(), Duration::from_millis(10))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Enumeration);
    }
}
