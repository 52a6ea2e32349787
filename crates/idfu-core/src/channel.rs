//! Transfer channel: correctly shaped, correctly directed I/O on one device.
//!
//! A channel owns the [`DeviceHandle`] of an opened device and walks it
//! through `Closed → Open → Configured → InterfaceClaimed`. Every transfer is
//! checked against the current state and the endpoint table of the selected
//! alternate setting before it reaches the backend.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::catalog::ClaimGuard;
use crate::device::{DeviceDescriptor, DeviceIdentity};
use crate::error::UsbError;
use crate::protocol::{ControlData, ControlPacket, Direction};
use crate::transport::{EndpointInfo, FrameStatus, IsocFrame, TransferType, UsbBackend};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Released; every call fails with `DeviceNotFound`.
    Closed,
    Open,
    Configured,
    InterfaceClaimed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "CLOSED"),
            ChannelState::Open => write!(f, "OPEN"),
            ChannelState::Configured => write!(f, "CONFIGURED"),
            ChannelState::InterfaceClaimed => write!(f, "INTERFACE_CLAIMED"),
        }
    }
}

/// Exclusively claimed device: backend resources plus negotiated state.
pub struct DeviceHandle<B: UsbBackend> {
    backend: B,
    configuration: Option<u8>,
    interface: Option<(u8, u8)>,
    endpoints: Vec<EndpointInfo>,
    /// Marks the device busy in the catalog until the handle is dropped.
    _claim: Option<ClaimGuard>,
}

impl<B: UsbBackend> DeviceHandle<B> {
    fn new(backend: B, claim: Option<ClaimGuard>) -> Self {
        Self {
            backend,
            configuration: None,
            interface: None,
            endpoints: Vec::new(),
            _claim: claim,
        }
    }

    fn clear_selection(&mut self) {
        self.interface = None;
        self.endpoints.clear();
    }

    /// Look up a data endpoint of the selected alternate setting.
    fn endpoint(
        &self,
        address: u8,
        allowed: &[TransferType],
        direction: Direction,
    ) -> Result<EndpointInfo, UsbError> {
        let ep = self
            .endpoints
            .iter()
            .find(|ep| ep.address == address)
            .copied()
            .ok_or_else(|| {
                UsbError::unsupported(format!(
                    "endpoint 0x{address:02X} is not on the selected alternate setting"
                ))
            })?;

        if !allowed.contains(&ep.transfer_type) {
            return Err(UsbError::unsupported(format!(
                "endpoint 0x{address:02X} is {}",
                ep.transfer_type
            )));
        }
        let ep_direction = if ep.is_in() {
            Direction::In
        } else {
            Direction::Out
        };
        if ep_direction != direction {
            return Err(UsbError::unsupported(format!(
                "endpoint 0x{address:02X} is {ep_direction}, transfer is {direction}"
            )));
        }
        Ok(ep)
    }
}

/// I/O against one open device.
pub struct TransferChannel<B: UsbBackend> {
    identity: DeviceIdentity,
    descriptor: DeviceDescriptor,
    state: ChannelState,
    handle: Option<DeviceHandle<B>>,
}

impl<B: UsbBackend> TransferChannel<B> {
    /// Wrap an opened backend. The channel starts in `Open`.
    pub fn from_backend(backend: B) -> Self {
        let identity = backend.identity();
        let descriptor = DeviceDescriptor {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
            ..Default::default()
        };
        Self::new(backend, descriptor, None)
    }

    pub(crate) fn new(backend: B, descriptor: DeviceDescriptor, claim: Option<ClaimGuard>) -> Self {
        Self {
            identity: backend.identity(),
            descriptor,
            state: ChannelState::Open,
            handle: Some(DeviceHandle::new(backend, claim)),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != ChannelState::Closed
    }

    /// Static information about the opened device.
    pub fn device_information(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.descriptor.serial_number.as_deref()
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.descriptor.friendly_name.as_deref()
    }

    pub fn configuration(&self) -> Option<u8> {
        self.handle.as_ref().and_then(|h| h.configuration)
    }

    /// Claimed interface and alternate setting.
    pub fn interface(&self) -> Option<(u8, u8)> {
        self.handle.as_ref().and_then(|h| h.interface)
    }

    /// Endpoints of the selected alternate setting.
    pub fn endpoints(&self) -> &[EndpointInfo] {
        self.handle
            .as_ref()
            .map(|h| h.endpoints.as_slice())
            .unwrap_or(&[])
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<B>, UsbError> {
        match self.handle.as_mut() {
            Some(handle) if self.state != ChannelState::Closed => Ok(handle),
            _ => Err(UsbError::Closed),
        }
    }

    /// Handle for a data transfer; needs a claimed interface.
    fn claimed_mut(&mut self) -> Result<&mut DeviceHandle<B>, UsbError> {
        let state = self.state;
        let handle = self.handle_mut()?;
        if state != ChannelState::InterfaceClaimed {
            return Err(UsbError::unsupported(format!(
                "transfer requires a claimed interface, channel is {state}"
            )));
        }
        Ok(handle)
    }

    fn goto_state(&mut self, new_state: ChannelState) {
        if self.state != new_state {
            debug!(from = %self.state, to = %new_state, "Channel state transition");
        }
        self.state = new_state;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Select a device configuration. Releases any claimed interface.
    #[instrument(skip(self), fields(device = %self.identity))]
    pub fn set_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        let handle = self.handle_mut()?;
        handle.backend.set_configuration(value)?;
        handle.configuration = Some(value);
        handle.clear_selection();
        self.goto_state(ChannelState::Configured);
        info!(configuration = value, "Configuration selected");
        Ok(())
    }

    /// Claim `interface` and select `alt_setting`; loads its endpoint table.
    #[instrument(skip(self), fields(device = %self.identity))]
    pub fn set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        let state = self.state;
        let handle = self.handle_mut()?;
        if state == ChannelState::Open {
            return Err(UsbError::unsupported(
                "set_configuration must precede set_interface",
            ));
        }

        let endpoints = handle.backend.endpoints(interface, alt_setting)?;
        handle.backend.claim_interface(interface, alt_setting)?;
        handle.interface = Some((interface, alt_setting));
        handle.endpoints = endpoints;
        self.goto_state(ChannelState::InterfaceClaimed);
        info!(interface, alt_setting, "Interface selected");
        Ok(())
    }

    /// Port reset. The channel returns to `Open` and must be configured again.
    #[instrument(skip(self), fields(device = %self.identity))]
    pub fn reset_device(&mut self) -> Result<(), UsbError> {
        let handle = self.handle_mut()?;
        handle.backend.reset()?;
        handle.configuration = None;
        handle.clear_selection();
        self.goto_state(ChannelState::Open);
        info!("Device reset");
        Ok(())
    }

    /// Simulate unplug/replug. The handle is released; reopen through the catalog.
    #[instrument(skip(self), fields(device = %self.identity))]
    pub fn reenumerate_device(&mut self) -> Result<(), UsbError> {
        self.handle_mut()?.backend.reenumerate()?;
        self.handle = None;
        self.goto_state(ChannelState::Closed);
        info!("Device re-enumerating, handle released");
        Ok(())
    }

    /// Release the device.
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            info!(device = %self.identity, "Device closed");
        }
        self.goto_state(ChannelState::Closed);
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Issue a control request exactly as given.
    ///
    /// Direction comes from bit 7 of `bmRequestType`. Returns the bytes moved
    /// in the data stage, never more than `wLength`.
    #[instrument(skip(self, packet), fields(setup = %packet.setup))]
    pub fn control_transfer(
        &mut self,
        packet: ControlPacket<'_>,
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let handle = self.claimed_mut()?;
        packet.validate()?;

        let setup = packet.setup;
        let length = setup.length as usize;
        let result = match packet.data {
            ControlData::Out(data) => {
                handle
                    .backend
                    .control_out(&setup, &data[..length], timeout)
            }
            ControlData::In(buf) => handle
                .backend
                .control_in(&setup, &mut buf[..length], timeout)
                .map(|n| n.min(length)),
            ControlData::None => match setup.direction() {
                Direction::In => handle.backend.control_in(&setup, &mut [], timeout),
                Direction::Out => handle.backend.control_out(&setup, &[], timeout),
            },
        };

        match &result {
            Ok(n) => debug!(transferred = n, "Control transfer complete"),
            Err(e) => warn!(error = %e, "Control transfer failed"),
        }
        result
    }

    /// Write to a bulk or interrupt OUT endpoint.
    #[instrument(skip(self, data), fields(ep = %format!("0x{:02X}", endpoint), len = data.len()))]
    pub fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let handle = self.claimed_mut()?;
        let ep = handle.endpoint(
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
            Direction::Out,
        )?;
        let n = handle.backend.bulk_out(&ep, data, timeout)?;
        debug!(bytes_written = n, "Bulk write complete");
        Ok(n)
    }

    /// Read from a bulk or interrupt IN endpoint.
    ///
    /// A response longer than `buf` is truncated into `buf` and reported as
    /// [`UsbError::ShortBuffer`].
    #[instrument(skip(self, buf), fields(ep = %format!("0x{:02X}", endpoint), max_len = buf.len()))]
    pub fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let handle = self.claimed_mut()?;
        let ep = handle.endpoint(
            endpoint,
            &[TransferType::Bulk, TransferType::Interrupt],
            Direction::In,
        )?;
        let actual = handle.backend.bulk_in(&ep, buf, timeout)?;
        if actual > buf.len() {
            warn!(capacity = buf.len(), actual, "Bulk read overflowed buffer");
            return Err(UsbError::ShortBuffer {
                capacity: buf.len(),
                actual,
            });
        }
        debug!(bytes_read = actual, "Bulk read complete");
        Ok(actual)
    }

    /// Schedule isochronous OUT frames.
    ///
    /// `frame_start` of 0 schedules immediately. Per-frame results are
    /// written to `frames`; the call itself fails only if nothing could be
    /// scheduled.
    pub fn isochronous_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        frame_start: u64,
        num_frames: u32,
        frames: &mut [IsocFrame],
    ) -> Result<(), UsbError> {
        let handle = self.claimed_mut()?;
        let ep = handle.endpoint(endpoint, &[TransferType::Isochronous], Direction::Out)?;
        check_frames(&ep, data.len(), num_frames, frames)?;
        check_frame_start(&handle.backend, frame_start)?;

        reset_frames(frames);
        handle
            .backend
            .isochronous_out(&ep, data, frame_start, frames)?;
        log_frames(endpoint, frames);
        Ok(())
    }

    /// Schedule isochronous IN frames. See [`Self::isochronous_write`].
    pub fn isochronous_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        frame_start: u64,
        num_frames: u32,
        frames: &mut [IsocFrame],
    ) -> Result<(), UsbError> {
        let handle = self.claimed_mut()?;
        let ep = handle.endpoint(endpoint, &[TransferType::Isochronous], Direction::In)?;
        check_frames(&ep, buf.len(), num_frames, frames)?;
        check_frame_start(&handle.backend, frame_start)?;

        reset_frames(frames);
        handle
            .backend
            .isochronous_in(&ep, buf, frame_start, frames)?;
        log_frames(endpoint, frames);
        Ok(())
    }
}

impl<B: UsbBackend> fmt::Debug for TransferChannel<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferChannel")
            .field("identity", &self.identity)
            .field("location", &self.descriptor.location())
            .field("state", &self.state)
            .field("configuration", &self.configuration())
            .field("interface", &self.interface())
            .finish()
    }
}

fn check_frames(
    ep: &EndpointInfo,
    data_len: usize,
    num_frames: u32,
    frames: &[IsocFrame],
) -> Result<(), UsbError> {
    if frames.len() != num_frames as usize {
        return Err(UsbError::invalid(format!(
            "frame list has {} entries, {} frames requested",
            frames.len(),
            num_frames
        )));
    }
    if frames.is_empty() {
        return Err(UsbError::invalid("no frames requested"));
    }

    let max = ep.max_frame_len();
    let mut total = 0usize;
    for (i, frame) in frames.iter().enumerate() {
        if frame.requested as usize > max {
            return Err(UsbError::invalid(format!(
                "frame {i} requests {} bytes, endpoint allows {max}",
                frame.requested
            )));
        }
        total += frame.requested as usize;
    }
    if total > data_len {
        return Err(UsbError::invalid(format!(
            "frames request {total} bytes, buffer holds {data_len}"
        )));
    }
    Ok(())
}

fn check_frame_start<B: UsbBackend>(backend: &B, frame_start: u64) -> Result<(), UsbError> {
    if frame_start == 0 {
        return Ok(());
    }
    let now = backend.current_frame()?;
    if frame_start <= now {
        return Err(UsbError::io(format!(
            "start frame {frame_start} is not after current frame {now}"
        )));
    }
    Ok(())
}

fn reset_frames(frames: &mut [IsocFrame]) {
    for frame in frames.iter_mut() {
        frame.actual = 0;
        frame.status = FrameStatus::Pending;
    }
}

fn log_frames(endpoint: u8, frames: &[IsocFrame]) {
    let failed = frames
        .iter()
        .filter(|f| f.status == FrameStatus::Error)
        .count();
    if failed > 0 {
        warn!(ep = %format!("0x{:02X}", endpoint), failed, total = frames.len(), "Isochronous frames failed");
    } else {
        debug!(ep = %format!("0x{:02X}", endpoint), frames = frames.len(), "Isochronous transfer complete");
    }
}
