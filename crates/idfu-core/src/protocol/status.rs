//! DFU GETSTATUS response decoding.

use std::fmt;

use super::constants::DFU_STATUS_LEN;
use crate::error::UsbError;

/// bState values from the DFU 1.1 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnloadBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(v: u8) -> Self {
        match v {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DnloadSync,
            4 => DfuState::DnloadBusy,
            5 => DfuState::DnloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl DfuState {
    pub fn as_u8(&self) -> u8 {
        match self {
            DfuState::AppIdle => 0,
            DfuState::AppDetach => 1,
            DfuState::DfuIdle => 2,
            DfuState::DnloadSync => 3,
            DfuState::DnloadBusy => 4,
            DfuState::DnloadIdle => 5,
            DfuState::ManifestSync => 6,
            DfuState::Manifest => 7,
            DfuState::ManifestWaitReset => 8,
            DfuState::UploadIdle => 9,
            DfuState::Error => 10,
            DfuState::Unknown(v) => *v,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnloadBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::Error => write!(f, "dfuERROR"),
            DfuState::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

/// Decoded 6-byte GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    /// bStatus; 0 is OK.
    pub status: u8,
    /// bwPollTimeout in milliseconds.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub fn from_bytes(data: &[u8]) -> Result<Self, UsbError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(UsbError::Io {
                message: format!(
                    "status response too short: {} of {} bytes",
                    data.len(),
                    DFU_STATUS_LEN
                ),
                transferred: data.len(),
            });
        }
        Ok(Self {
            status: data[0],
            poll_timeout: (data[3] as u32) << 16 | (data[2] as u32) << 8 | (data[1] as u32),
            state: DfuState::from(data[4]),
            string_index: data[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        let t = self.poll_timeout;
        [
            self.status,
            t as u8,
            (t >> 8) as u8,
            (t >> 16) as u8,
            self.state.as_u8(),
            self.string_index,
        ]
    }

    /// Ready for the next DNLOAD block.
    pub fn is_ready(&self) -> bool {
        self.status == 0 && self.state == DfuState::DnloadIdle
    }

    /// The device rejected what it was sent.
    pub fn is_rejected(&self) -> bool {
        self.status != 0 || self.state == DfuState::Error
    }

    pub fn ok(&self) -> Result<(), UsbError> {
        if self.is_rejected() {
            Err(UsbError::DeviceStatus {
                status: self.status,
                state: self.state.as_u8(),
            })
        } else {
            Ok(())
        }
    }
}

impl Default for DfuStatus {
    fn default() -> Self {
        Self {
            status: 0,
            poll_timeout: 0,
            state: DfuState::DfuIdle,
            string_index: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_status() {
        let st = DfuStatus::from_bytes(&[0x00, 0x10, 0x27, 0x00, 0x05, 0x00]).unwrap();
        assert_eq!(st.poll_timeout, 10_000);
        assert_eq!(st.state, DfuState::DnloadIdle);
        assert!(st.is_ready());
        assert!(st.ok().is_ok());
    }

    #[test]
    fn test_rejected_status() {
        let st = DfuStatus::from_bytes(&[0x0E, 0, 0, 0, 10, 0]).unwrap();
        assert!(st.is_rejected());
        assert_eq!(st.ok().unwrap_err().kind(), ErrorKind::Unsuccessful);
    }

    #[test]
    fn test_short_status_is_io() {
        let err = DfuStatus::from_bytes(&[0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.transferred(), 3);
    }

    #[test]
    fn test_status_bytes_match_wire() {
        let st = DfuStatus {
            status: 0,
            poll_timeout: 0x030201,
            state: DfuState::DnloadBusy,
            string_index: 0,
        };
        assert_eq!(st.to_bytes(), [0, 1, 2, 3, 4, 0]);
    }
}
