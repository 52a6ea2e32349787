//! The two upload dialects spoken by Apple boot loaders.

use std::fmt;

use crate::device::DeviceIdentity;
use crate::error::UsbError;
use crate::protocol::constants::*;

/// Protocol spoken by the device, chosen by product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Boot ROM in DFU mode: chunks ride on class control requests.
    Dfu,
    /// iBoot recovery mode: chunks go over a bulk pipe, commands as strings.
    IBoot,
}

impl Dialect {
    pub fn from_identity(identity: DeviceIdentity) -> Result<Self, UsbError> {
        match identity {
            DeviceIdentity::APPLE_DFU => Ok(Dialect::Dfu),
            DeviceIdentity::APPLE_RECOVERY => Ok(Dialect::IBoot),
            other => Err(UsbError::unsupported(format!(
                "{other} is not an Apple DFU or recovery mode device"
            ))),
        }
    }

    pub fn chunk_size(&self) -> usize {
        match self {
            Dialect::Dfu => DFU_CHUNK_SIZE,
            Dialect::IBoot => RECOVERY_CHUNK_SIZE,
        }
    }

    /// DFU acknowledges each chunk through GETSTATUS.
    pub fn polls_status(&self) -> bool {
        matches!(self, Dialect::Dfu)
    }

    /// DFU closes an image with a zero-length DNLOAD.
    pub fn finalizes(&self) -> bool {
        matches!(self, Dialect::Dfu)
    }

    pub fn accepts_commands(&self) -> bool {
        matches!(self, Dialect::IBoot)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Dfu => write!(f, "DFU"),
            Dialect::IBoot => write!(f, "iBoot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_from_identity() {
        assert_eq!(
            Dialect::from_identity(DeviceIdentity::APPLE_DFU).unwrap(),
            Dialect::Dfu
        );
        assert_eq!(
            Dialect::from_identity(DeviceIdentity::APPLE_RECOVERY).unwrap(),
            Dialect::IBoot
        );
        let err = Dialect::from_identity(DeviceIdentity::new(0x05AC, 0x12A8)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_dialect_table() {
        assert_eq!(Dialect::Dfu.chunk_size(), 0x800);
        assert_eq!(Dialect::IBoot.chunk_size(), 0x8000);
        assert!(Dialect::Dfu.polls_status() && Dialect::Dfu.finalizes());
        assert!(!Dialect::IBoot.polls_status() && !Dialect::IBoot.finalizes());
        assert!(Dialect::IBoot.accepts_commands());
        assert!(!Dialect::Dfu.accepts_commands());
    }
}
