//! USB backend abstraction.
//!
//! Defines the `UsbBackend` trait, the contract this crate needs from the
//! host USB stack, allowing different implementations (nusb, mock, etc.).
//! Backends do no validation of their own: the channel checks state,
//! direction and endpoint tables before calling in.

use std::fmt;
use std::time::Duration;

use crate::device::DeviceIdentity;
use crate::error::UsbError;
use crate::protocol::SetupPacket;

/// Endpoint transfer type from `bmAttributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Control => write!(f, "Control"),
            TransferType::Isochronous => write!(f, "Isochronous"),
            TransferType::Bulk => write!(f, "Bulk"),
            TransferType::Interrupt => write!(f, "Interrupt"),
        }
    }
}

/// One endpoint of the selected alternate setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: usize,
    /// Transactions per microframe (1..=3 for high-bandwidth endpoints).
    pub transactions: u8,
}

impl EndpointInfo {
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: usize) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
            transactions: 1,
        }
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    /// Largest payload one isochronous frame may carry.
    pub fn max_frame_len(&self) -> usize {
        self.max_packet_size * self.transactions.max(1) as usize
    }
}

/// Outcome of one isochronous frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Pending,
    Ok,
    Error,
}

/// Per-frame isochronous request and result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsocFrame {
    pub requested: u16,
    pub actual: u16,
    pub status: FrameStatus,
}

impl IsocFrame {
    pub fn new(requested: u16) -> Self {
        Self {
            requested,
            ..Default::default()
        }
    }
}

/// Abstract USB driver backend for one exclusively opened device.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbBackend: Send {
    fn identity(&self) -> DeviceIdentity;

    /// Select a device configuration (`bConfigurationValue`).
    fn set_configuration(&mut self, value: u8) -> Result<(), UsbError>;

    /// Claim an interface and select its alternate setting.
    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbError>;

    /// Endpoints of an interface alternate setting in the active configuration.
    fn endpoints(&self, interface: u8, alt_setting: u8) -> Result<Vec<EndpointInfo>, UsbError>;

    /// Control transfer with an IN data stage. Returns bytes received.
    fn control_in(
        &mut self,
        setup: &SetupPacket,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Control transfer with an OUT (or empty) data stage. Returns bytes sent.
    fn control_out(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Bulk or interrupt OUT transfer. Returns bytes sent.
    fn bulk_out(
        &mut self,
        endpoint: &EndpointInfo,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Bulk or interrupt IN transfer.
    ///
    /// Copies at most `buf.len()` bytes and returns the length the device
    /// actually sent, which may exceed `buf.len()`.
    fn bulk_in(
        &mut self,
        endpoint: &EndpointInfo,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Schedule isochronous OUT frames; per-frame results land in `frames`.
    fn isochronous_out(
        &mut self,
        endpoint: &EndpointInfo,
        data: &[u8],
        frame_start: u64,
        frames: &mut [IsocFrame],
    ) -> Result<(), UsbError>;

    /// Schedule isochronous IN frames; per-frame results land in `frames`.
    fn isochronous_in(
        &mut self,
        endpoint: &EndpointInfo,
        buf: &mut [u8],
        frame_start: u64,
        frames: &mut [IsocFrame],
    ) -> Result<(), UsbError>;

    /// The bus frame counter of the device.
    fn current_frame(&self) -> Result<u64, UsbError>;

    /// Port reset; the device keeps its address.
    fn reset(&mut self) -> Result<(), UsbError>;

    /// Simulated unplug/replug. The backend is unusable afterwards.
    fn reenumerate(&mut self) -> Result<(), UsbError>;
}
