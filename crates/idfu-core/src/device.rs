//! Device identity and static descriptor metadata.

use std::fmt;

use crate::protocol::constants::{APPLE_VENDOR_ID, DFU_PRODUCT_ID, RECOVERY_PRODUCT_ID};

/// Vendor/product pair of an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const APPLE_DFU: Self = Self::new(APPLE_VENDOR_ID, DFU_PRODUCT_ID);
    pub const APPLE_RECOVERY: Self = Self::new(APPLE_VENDOR_ID, RECOVERY_PRODUCT_ID);

    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Snapshot of an attached device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub serial_number: Option<String>,
    /// Product string, falling back to the manufacturer string.
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub bus_id: String,
    pub address: u8,
    /// Raw active configuration descriptor, empty when it could not be read.
    pub configuration: Vec<u8>,
}

impl DeviceDescriptor {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }

    /// Bus location; stable while the device stays attached.
    pub fn location(&self) -> String {
        format!("{}-{}", self.bus_id, self.address)
    }

    pub fn matches(&self, identity: DeviceIdentity) -> bool {
        self.identity() == identity
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]",
            self.identity(),
            self.friendly_name.as_deref().unwrap_or("<unnamed>"),
            self.location()
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial={serial}")?;
        }
        Ok(())
    }
}
