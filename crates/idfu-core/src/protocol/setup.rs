//! Control transfer setup packets.
//!
//! Wire layout (8 bytes, USB 2.0 §9.3):
//! `bmRequestType | bRequest | wValue LE16 | wIndex LE16 | wLength LE16`

use std::fmt;
use std::io::Cursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::constants::{
    REQUEST_DIR_IN, REQUEST_RECIPIENT_MASK, REQUEST_TYPE_MASK, REQUEST_TYPE_SHIFT,
};
use crate::error::UsbError;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Data stage direction, from bit 7 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// Bits 5..6 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Bits 0..4 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// Builds a `bmRequestType` byte.
pub const fn request_type(direction: Direction, kind: RequestKind, recipient: Recipient) -> u8 {
    let dir = match direction {
        Direction::Out => 0,
        Direction::In => REQUEST_DIR_IN,
    };
    let kind = match kind {
        RequestKind::Standard => 0,
        RequestKind::Class => 1,
        RequestKind::Vendor => 2,
        RequestKind::Reserved => 3,
    };
    let recipient = match recipient {
        Recipient::Device => 0,
        Recipient::Interface => 1,
        Recipient::Endpoint => 2,
        Recipient::Other => 3,
        Recipient::Reserved(r) => r & REQUEST_RECIPIENT_MASK,
    };
    dir | (kind << REQUEST_TYPE_SHIFT) | recipient
}

/// The 8-byte setup stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & REQUEST_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type & REQUEST_TYPE_MASK) >> REQUEST_TYPE_SHIFT {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & REQUEST_RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            r => Recipient::Reserved(r),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.request_type;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SetupError> {
        if data.len() < Self::SIZE {
            return Err(SetupError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            request_type: cursor.read_u8()?,
            request: cursor.read_u8()?,
            value: cursor.read_u16::<LittleEndian>()?,
            index: cursor.read_u16::<LittleEndian>()?,
            length: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

impl fmt::Display for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:02X} {:02X} {:04X} {:04X} {:04X}]",
            self.request_type, self.request, self.value, self.index, self.length
        )
    }
}

/// Data stage of a control transfer.
#[derive(Debug)]
pub enum ControlData<'a> {
    None,
    /// Outbound payload (host to device).
    Out(&'a [u8]),
    /// Buffer filled by the device (device to host).
    In(&'a mut [u8]),
}

impl ControlData<'_> {
    pub fn capacity(&self) -> usize {
        match self {
            ControlData::None => 0,
            ControlData::Out(data) => data.len(),
            ControlData::In(buf) => buf.len(),
        }
    }
}

/// A complete control request: setup stage plus data stage.
#[derive(Debug)]
pub struct ControlPacket<'a> {
    pub setup: SetupPacket,
    pub data: ControlData<'a>,
}

impl<'a> ControlPacket<'a> {
    /// Host-to-device request carrying `data`.
    ///
    /// A payload longer than `u16::MAX` is rejected by [`validate`](Self::validate).
    pub fn out(request_type: u8, request: u8, value: u16, index: u16, data: &'a [u8]) -> Self {
        let length = u16::try_from(data.len()).unwrap_or(u16::MAX);
        Self {
            setup: SetupPacket::new(request_type, request, value, index, length),
            data: if data.is_empty() {
                ControlData::None
            } else {
                ControlData::Out(data)
            },
        }
    }

    /// Device-to-host request reading up to `buf.len()` bytes.
    pub fn input(request_type: u8, request: u8, value: u16, index: u16, buf: &'a mut [u8]) -> Self {
        let length = u16::try_from(buf.len()).unwrap_or(u16::MAX);
        Self {
            setup: SetupPacket::new(request_type, request, value, index, length),
            data: if buf.is_empty() {
                ControlData::None
            } else {
                ControlData::In(buf)
            },
        }
    }

    /// Request without a data stage.
    pub fn no_data(request_type: u8, request: u8, value: u16, index: u16) -> Self {
        Self {
            setup: SetupPacket::new(request_type, request, value, index, 0),
            data: ControlData::None,
        }
    }

    /// Checks the packet is self-consistent before it goes on the wire.
    ///
    /// Direction comes from `bmRequestType`; the data stage must agree with it.
    pub fn validate(&self) -> Result<(), UsbError> {
        let setup = &self.setup;
        if setup.kind() == RequestKind::Reserved {
            return Err(UsbError::invalid(format!(
                "reserved request type in bmRequestType 0x{:02X}",
                setup.request_type
            )));
        }
        if let Recipient::Reserved(r) = setup.recipient() {
            return Err(UsbError::invalid(format!("reserved recipient {r}")));
        }

        let length = setup.length as usize;
        let capacity = self.data.capacity();
        if capacity > u16::MAX as usize {
            return Err(UsbError::invalid(format!(
                "payload of {capacity} bytes does not fit in wLength"
            )));
        }
        if length > capacity {
            return Err(UsbError::invalid(format!(
                "wLength {length} exceeds payload capacity {capacity}"
            )));
        }
        if capacity > 0 && length != capacity {
            return Err(UsbError::invalid(format!(
                "wLength {length} does not match payload capacity {capacity}"
            )));
        }

        match (&self.data, setup.direction()) {
            (ControlData::None, _) => Ok(()),
            (ControlData::Out(_), Direction::Out) | (ControlData::In(_), Direction::In) => Ok(()),
            (_, direction) => Err(UsbError::invalid(format!(
                "data stage does not match {direction} direction of bmRequestType 0x{:02X}",
                setup.request_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::constants::*;

    #[test]
    fn test_setup_wire_layout() {
        let setup = SetupPacket::new(DFU_REQUEST_OUT, DFU_DNLOAD, 0x1234, 0x0001, 0x0800);
        assert_eq!(
            setup.to_bytes(),
            [0x21, 0x01, 0x34, 0x12, 0x01, 0x00, 0x00, 0x08]
        );

        let parsed = SetupPacket::from_bytes(&setup.to_bytes()).unwrap();
        assert_eq!(parsed, setup);
    }

    #[test]
    fn test_setup_too_short() {
        assert!(SetupPacket::from_bytes(&[0xA1, 0x03, 0x00]).is_err());
    }

    #[test]
    fn test_request_type_bits() {
        assert_eq!(
            request_type(Direction::Out, RequestKind::Class, Recipient::Interface),
            DFU_REQUEST_OUT
        );
        assert_eq!(
            request_type(Direction::In, RequestKind::Class, Recipient::Interface),
            DFU_REQUEST_IN
        );
        assert_eq!(
            request_type(Direction::Out, RequestKind::Vendor, Recipient::Device),
            VENDOR_REQUEST_OUT_DEVICE
        );

        let setup = SetupPacket::new(DFU_REQUEST_IN, DFU_GETSTATUS, 0, 0, 6);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.kind(), RequestKind::Class);
        assert_eq!(setup.recipient(), Recipient::Interface);
    }

    #[test]
    fn test_validate_direction_mismatch() {
        let data = [1u8, 2, 3];
        let mut packet = ControlPacket::out(DFU_REQUEST_OUT, DFU_DNLOAD, 0, 0, &data);
        assert!(packet.validate().is_ok());

        // Same payload, IN direction bit set
        packet.setup.request_type = DFU_REQUEST_IN;
        let err = packet.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_validate_length_exceeds_capacity() {
        let mut buf = [0u8; 4];
        let mut packet = ControlPacket::input(DFU_REQUEST_IN, DFU_GETSTATUS, 0, 0, &mut buf);
        packet.setup.length = 6;
        assert!(packet.validate().is_err());
    }

    #[test]
    fn test_validate_oversized_payload() {
        let data = vec![0u8; 70_000];
        let packet = ControlPacket::out(VENDOR_REQUEST_OUT_DEVICE, 0, 0, 0, &data);
        let err = packet.validate().unwrap_err();
        assert!(matches!(err, UsbError::InvalidRequest(_)));

        let mut buf = vec![0u8; 0x10000];
        let packet = ControlPacket::input(DFU_REQUEST_IN, DFU_UPLOAD, 0, 0, &mut buf);
        assert!(packet.validate().is_err());

        let data = vec![0u8; u16::MAX as usize];
        let packet = ControlPacket::out(VENDOR_REQUEST_OUT_DEVICE, 0, 0, 0, &data);
        assert!(packet.validate().is_ok());
    }

    #[test]
    fn test_validate_length_below_capacity() {
        let data = [0u8; 8];
        let mut packet = ControlPacket::out(DFU_REQUEST_OUT, DFU_DNLOAD, 0, 0, &data);
        packet.setup.length = 4;
        assert!(matches!(packet.validate(), Err(UsbError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_reserved_type() {
        let packet = ControlPacket::no_data(0x60, 0, 0, 0);
        assert_eq!(packet.validate().unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
