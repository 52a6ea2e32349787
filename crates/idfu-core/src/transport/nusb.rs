//! nusb-based USB backend implementation.
//!
//! Key nusb 0.2 API patterns:
//! - `device_info.open().wait()` to open a device
//! - `device.claim_interface(n).wait()` + `set_alt_setting(alt).wait()`
//! - `control_in`/`control_out` with an explicit timeout
//! - `interface.endpoint::<Bulk, Out>(addr)` then `submit` / `wait_next_complete`

use std::time::Duration;

use nusb::transfer::{
    Bulk, BulkOrInterrupt, Completion, ControlIn, ControlOut, ControlType, EndpointDirection, In,
    Interrupt, Out, Recipient as NusbRecipient, TransferError,
};
use nusb::{Device, DeviceInfo, Endpoint, Interface, MaybeFuture};
use tracing::{debug, info, instrument, warn};

use super::traits::{EndpointInfo, IsocFrame, TransferType, UsbBackend};
use crate::device::DeviceIdentity;
use crate::error::UsbError;
use crate::protocol::constants::{
    CONFIGURATION_HEADER_LEN, DESCRIPTOR_TYPE_CONFIGURATION, REQUEST_GET_DESCRIPTOR,
};
use crate::protocol::{Recipient, RequestKind, SetupPacket, request_type};

/// How long to wait for a cancelled transfer to come back.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// nusb-based USB backend.
pub struct NusbBackend {
    device: Device,
    interface: Option<Interface>,
    /// Alternate setting selected on `interface`.
    alt_setting: u8,
    identity: DeviceIdentity,
}

impl NusbBackend {
    /// Open the device behind `device_info`.
    #[instrument(level = "info", skip(device_info), fields(vid = %format!("{:04X}", device_info.vendor_id()), pid = %format!("{:04X}", device_info.product_id())))]
    pub fn open(device_info: &DeviceInfo) -> Result<Self, UsbError> {
        let device = device_info
            .open()
            .wait()
            .map_err(|e| UsbError::AccessDenied(e.to_string()))?;

        info!(bus = device_info.bus_id(), address = device_info.device_address(), "Device opened");

        Ok(Self {
            device,
            interface: None,
            alt_setting: 0,
            identity: DeviceIdentity::new(device_info.vendor_id(), device_info.product_id()),
        })
    }

    /// Interface to route a request through, if one is claimed.
    fn interface_for(&self, setup: &SetupPacket) -> Option<&Interface> {
        match setup.recipient() {
            Recipient::Device => None,
            _ => self.interface.as_ref(),
        }
    }

    fn claim(&self, interface: u8, alt_setting: u8) -> Result<Interface, UsbError> {
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| UsbError::AccessDenied(e.to_string()))?;
        claimed
            .set_alt_setting(alt_setting)
            .wait()
            .map_err(|e| UsbError::io(e.to_string()))?;
        Ok(claimed)
    }

    /// Claim an interface again after a failed operation released it.
    fn reclaim(&mut self, interface: u8, alt_setting: u8) {
        match self.claim(interface, alt_setting) {
            Ok(claimed) => {
                self.interface = Some(claimed);
                self.alt_setting = alt_setting;
            }
            Err(e) => warn!(error = %e, interface, "Could not reclaim interface"),
        }
    }

    fn claimed(&self) -> Result<&Interface, UsbError> {
        self.interface
            .as_ref()
            .ok_or_else(|| UsbError::unsupported("no interface claimed"))
    }

    /// Raw bytes of the active configuration descriptor.
    pub fn configuration_descriptor(&self, timeout: Duration) -> Result<Vec<u8>, UsbError> {
        read_configuration_descriptor(&self.device, timeout)
    }
}

impl UsbBackend for NusbBackend {
    fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    #[instrument(skip(self))]
    fn set_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        // Interfaces must be released before the configuration changes.
        let alt_setting = self.alt_setting;
        let previous = self
            .interface
            .take()
            .map(|iface| iface.interface_number());
        if let Err(e) = self.device.set_configuration(value).wait() {
            if let Some(interface) = previous {
                self.reclaim(interface, alt_setting);
            }
            return Err(UsbError::AccessDenied(e.to_string()));
        }
        info!(configuration = value, "Configuration set");
        Ok(())
    }

    #[instrument(skip(self))]
    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        match self.interface.as_ref() {
            Some(current) if current.interface_number() == interface => {
                current
                    .set_alt_setting(alt_setting)
                    .wait()
                    .map_err(|e| UsbError::io(e.to_string()))?;
            }
            _ => {
                // The old interface is released only once the new one is held.
                self.interface = Some(self.claim(interface, alt_setting)?);
            }
        }
        self.alt_setting = alt_setting;
        info!(interface, alt_setting, "Interface claimed");
        Ok(())
    }

    fn endpoints(&self, interface: u8, alt_setting: u8) -> Result<Vec<EndpointInfo>, UsbError> {
        let config = self
            .device
            .active_configuration()
            .map_err(|e| UsbError::io(e.to_string()))?;

        let mut endpoints = Vec::new();
        for alt in config.interface_alt_settings() {
            if alt.interface_number() != interface || alt.alternate_setting() != alt_setting {
                continue;
            }
            for ep in alt.endpoints() {
                let transfer_type = match ep.transfer_type() {
                    nusb::descriptors::TransferType::Control => TransferType::Control,
                    nusb::descriptors::TransferType::Isochronous => TransferType::Isochronous,
                    nusb::descriptors::TransferType::Bulk => TransferType::Bulk,
                    nusb::descriptors::TransferType::Interrupt => TransferType::Interrupt,
                };
                endpoints.push(EndpointInfo {
                    address: ep.address(),
                    transfer_type,
                    max_packet_size: ep.max_packet_size(),
                    transactions: ep.packets_per_microframe(),
                });
            }
        }
        debug!(interface, alt_setting, count = endpoints.len(), "Endpoint table loaded");
        Ok(endpoints)
    }

    #[instrument(skip(self, buf), fields(setup = %setup))]
    fn control_in(
        &mut self,
        setup: &SetupPacket,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let (control_type, recipient) = control_kind(setup)?;
        let request = ControlIn {
            control_type,
            recipient,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length: setup.length,
        };
        let data = match self.interface_for(setup) {
            Some(iface) => iface.control_in(request, timeout).wait(),
            None => self.device.control_in(request, timeout).wait(),
        }
        .map_err(|e| map_transfer_error(e, timeout, 0))?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        debug!(bytes_read = n, "Control IN complete");
        Ok(n)
    }

    #[instrument(skip(self, data), fields(setup = %setup, len = data.len()))]
    fn control_out(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let (control_type, recipient) = control_kind(setup)?;
        let request = ControlOut {
            control_type,
            recipient,
            request: setup.request,
            value: setup.value,
            index: setup.index,
            data,
        };
        match self.interface_for(setup) {
            Some(iface) => iface.control_out(request, timeout).wait(),
            None => self.device.control_out(request, timeout).wait(),
        }
        .map_err(|e| map_transfer_error(e, timeout, 0))?;

        debug!(bytes_written = data.len(), "Control OUT complete");
        Ok(data.len())
    }

    #[instrument(skip(self, data), fields(ep = %format!("0x{:02X}", endpoint.address), len = data.len()))]
    fn bulk_out(
        &mut self,
        endpoint: &EndpointInfo,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let iface = self.claimed()?;
        match endpoint.transfer_type {
            TransferType::Interrupt => {
                submit_out::<Interrupt>(iface, endpoint.address, data, timeout)
            }
            _ => submit_out::<Bulk>(iface, endpoint.address, data, timeout),
        }
    }

    #[instrument(skip(self, buf), fields(ep = %format!("0x{:02X}", endpoint.address), max_len = buf.len()))]
    fn bulk_in(
        &mut self,
        endpoint: &EndpointInfo,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let iface = self.claimed()?;
        // IN requests must cover whole packets; anything past buf is reported, not kept.
        let packet = endpoint.max_packet_size.max(1);
        let requested = buf.len().div_ceil(packet).max(1) * packet;
        match endpoint.transfer_type {
            TransferType::Interrupt => {
                submit_in::<Interrupt>(iface, endpoint.address, buf, requested, timeout)
            }
            _ => submit_in::<Bulk>(iface, endpoint.address, buf, requested, timeout),
        }
    }

    fn isochronous_out(
        &mut self,
        _endpoint: &EndpointInfo,
        _data: &[u8],
        _frame_start: u64,
        _frames: &mut [IsocFrame],
    ) -> Result<(), UsbError> {
        Err(UsbError::unsupported(
            "isochronous transfers are not available through nusb",
        ))
    }

    fn isochronous_in(
        &mut self,
        _endpoint: &EndpointInfo,
        _buf: &mut [u8],
        _frame_start: u64,
        _frames: &mut [IsocFrame],
    ) -> Result<(), UsbError> {
        Err(UsbError::unsupported(
            "isochronous transfers are not available through nusb",
        ))
    }

    fn current_frame(&self) -> Result<u64, UsbError> {
        Err(UsbError::unsupported("frame counter is not exposed by nusb"))
    }

    #[instrument(skip(self))]
    fn reset(&mut self) -> Result<(), UsbError> {
        self.device
            .reset()
            .wait()
            .map_err(|e| UsbError::io(e.to_string()))?;
        self.interface = None;
        info!("Device reset");
        Ok(())
    }

    /// nusb has no re-enumerate request; a port reset makes the host
    /// enumerate the device again and invalidates this handle.
    #[instrument(skip(self))]
    fn reenumerate(&mut self) -> Result<(), UsbError> {
        self.device
            .reset()
            .wait()
            .map_err(|e| UsbError::io(e.to_string()))?;
        self.interface = None;
        info!("Device re-enumerating");
        Ok(())
    }
}

/// Read the active configuration descriptor with standard GET_DESCRIPTOR requests.
fn read_configuration_descriptor(
    device: &Device,
    timeout: Duration,
) -> Result<Vec<u8>, UsbError> {
    let get = |length: u16| {
        device
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: NusbRecipient::Device,
                    request: REQUEST_GET_DESCRIPTOR,
                    value: (DESCRIPTOR_TYPE_CONFIGURATION as u16) << 8,
                    index: 0,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout, 0))
    };

    let header = get(CONFIGURATION_HEADER_LEN)?;
    if header.len() < 4 {
        return Err(UsbError::io("configuration descriptor header truncated"));
    }
    let total = u16::from_le_bytes([header[2], header[3]]);
    get(total)
}

fn control_kind(setup: &SetupPacket) -> Result<(ControlType, NusbRecipient), UsbError> {
    let control_type = match setup.kind() {
        RequestKind::Standard => ControlType::Standard,
        RequestKind::Class => ControlType::Class,
        RequestKind::Vendor => ControlType::Vendor,
        RequestKind::Reserved => {
            return Err(UsbError::invalid("reserved request type"));
        }
    };
    let recipient = match setup.recipient() {
        Recipient::Device => NusbRecipient::Device,
        Recipient::Interface => NusbRecipient::Interface,
        Recipient::Endpoint => NusbRecipient::Endpoint,
        Recipient::Other => NusbRecipient::Other,
        Recipient::Reserved(r) => {
            return Err(UsbError::invalid(format!("reserved recipient {r}")));
        }
    };
    // The request type byte is rebuilt by nusb; make sure it round-trips.
    debug_assert_eq!(
        request_type(setup.direction(), setup.kind(), setup.recipient()),
        setup.request_type
    );
    Ok((control_type, recipient))
}

fn map_transfer_error(err: TransferError, timeout: Duration, transferred: usize) -> UsbError {
    match err {
        TransferError::Cancelled => UsbError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            transferred,
        },
        TransferError::Stall => UsbError::Stall,
        TransferError::Disconnected => UsbError::Disconnected,
        other => UsbError::Io {
            message: other.to_string(),
            transferred,
        },
    }
}

fn wait_or_cancel<T: BulkOrInterrupt, D: EndpointDirection>(
    ep: &mut Endpoint<T, D>,
    timeout: Duration,
) -> Result<Completion, UsbError> {
    match ep.wait_next_complete(timeout) {
        Some(completion) => Ok(completion),
        None => {
            ep.cancel_all();
            let transferred = ep
                .wait_next_complete(CANCEL_GRACE)
                .map(|c| c.actual_len)
                .unwrap_or(0);
            Err(UsbError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                transferred,
            })
        }
    }
}

fn submit_out<T: BulkOrInterrupt>(
    iface: &Interface,
    address: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    let mut ep = iface
        .endpoint::<T, Out>(address)
        .map_err(|e| UsbError::io(e.to_string()))?;

    let mut buffer = ep.allocate(data.len());
    buffer.extend_from_slice(data);
    ep.submit(buffer);

    let completion = wait_or_cancel(&mut ep, timeout)?;
    completion
        .status
        .map_err(|e| map_transfer_error(e, timeout, completion.actual_len))?;

    debug!(bytes_written = completion.actual_len, "Write complete");
    Ok(completion.actual_len)
}

fn submit_in<T: BulkOrInterrupt>(
    iface: &Interface,
    address: u8,
    buf: &mut [u8],
    requested: usize,
    timeout: Duration,
) -> Result<usize, UsbError> {
    let mut ep = iface
        .endpoint::<T, In>(address)
        .map_err(|e| UsbError::io(e.to_string()))?;

    let mut buffer = ep.allocate(requested);
    buffer.set_requested_len(requested);
    ep.submit(buffer);

    let completion = wait_or_cancel(&mut ep, timeout)?;
    completion
        .status
        .map_err(|e| map_transfer_error(e, timeout, completion.actual_len))?;

    let received = &completion.buffer[..];
    let n = received.len().min(buf.len());
    buf[..n].copy_from_slice(&received[..n]);

    debug!(bytes_read = completion.actual_len, "Read complete");
    Ok(completion.actual_len)
}
