//! Mock USB backend for testing.
//!
//! State lives behind an `Arc<Mutex<..>>` so a test keeps a [`MockHandle`]
//! after the backend itself has been moved into a channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{EndpointInfo, FrameStatus, IsocFrame, UsbBackend};
use crate::device::DeviceIdentity;
use crate::error::UsbError;
use crate::protocol::SetupPacket;

/// Operation captured by the mock, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    SetConfiguration(u8),
    ClaimInterface { interface: u8, alt_setting: u8 },
    ControlOut { setup: SetupPacket, data: Vec<u8> },
    ControlIn { setup: SetupPacket },
    BulkOut { endpoint: u8, data: Vec<u8> },
    BulkIn { endpoint: u8, capacity: usize },
    IsocOut { endpoint: u8, frame_start: u64, frames: usize },
    IsocIn { endpoint: u8, frame_start: u64, frames: usize },
    Reset,
    Reenumerate,
}

/// Operations a fault can be scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockTransfer {
    ControlIn,
    ControlOut,
    BulkIn,
    BulkOut,
    Isochronous,
    ClaimInterface,
    Reset,
}

/// Failure injected in place of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Timeout,
    Stall,
    Disconnect,
    Io,
}

impl MockFault {
    fn into_error(self) -> UsbError {
        match self {
            MockFault::Timeout => UsbError::Timeout {
                timeout_ms: 5000,
                transferred: 0,
            },
            MockFault::Stall => UsbError::Stall,
            MockFault::Disconnect => UsbError::Disconnected,
            MockFault::Io => UsbError::io("injected I/O fault"),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    ops: Vec<MockOp>,
    control_in_queue: VecDeque<Vec<u8>>,
    /// Returned for control IN requests when the queue is empty.
    control_in_default: Option<Vec<u8>>,
    bulk_in_queue: VecDeque<Vec<u8>>,
    endpoints: HashMap<(u8, u8), Vec<EndpointInfo>>,
    faults: HashMap<(MockTransfer, usize), MockFault>,
    counters: HashMap<MockTransfer, usize>,
    failed_frames: Vec<usize>,
    current_frame: u64,
    disconnected: bool,
    configuration_fails: bool,
    /// Interface held by the backend; a failed claim keeps the old one.
    claimed: Option<(u8, u8)>,
}

impl MockState {
    /// Counts the transfer and returns the fault scheduled for it, if any.
    fn take_fault(&mut self, kind: MockTransfer) -> Result<(), UsbError> {
        if self.disconnected {
            return Err(UsbError::Disconnected);
        }
        let n = self.counters.entry(kind).or_insert(0);
        let index = *n;
        *n += 1;
        match self.faults.remove(&(kind, index)) {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }
}

/// Inspection and scripting handle shared with a [`MockBackend`].
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Queue a control IN response.
    pub fn queue_control_in(&self, data: &[u8]) {
        self.lock().control_in_queue.push_back(data.to_vec());
    }

    /// Response used for control IN once the queue is drained.
    pub fn set_default_control_in(&self, data: &[u8]) {
        self.lock().control_in_default = Some(data.to_vec());
    }

    /// Queue a bulk IN response.
    pub fn queue_bulk_in(&self, data: &[u8]) {
        self.lock().bulk_in_queue.push_back(data.to_vec());
    }

    /// Declare the endpoints of an interface alternate setting.
    pub fn set_endpoints(&self, interface: u8, alt_setting: u8, endpoints: Vec<EndpointInfo>) {
        self.lock()
            .endpoints
            .insert((interface, alt_setting), endpoints);
    }

    /// Fail the `nth` (0-based) transfer of `kind`.
    pub fn fail_nth(&self, kind: MockTransfer, nth: usize, fault: MockFault) {
        self.lock().faults.insert((kind, nth), fault);
    }

    /// Report these frame indices as failed on the next isochronous call.
    pub fn fail_frames(&self, frames: &[usize]) {
        self.lock().failed_frames = frames.to_vec();
    }

    pub fn set_current_frame(&self, frame: u64) {
        self.lock().current_frame = frame;
    }

    pub fn fail_configuration(&self) {
        self.lock().configuration_fails = true;
    }

    /// Interface and alternate setting the backend currently holds.
    pub fn claimed_interface(&self) -> Option<(u8, u8)> {
        self.lock().claimed
    }

    /// Get all captured operations.
    pub fn ops(&self) -> Vec<MockOp> {
        self.lock().ops.clone()
    }

    /// Captured control OUT transfers.
    pub fn control_outs(&self) -> Vec<(SetupPacket, Vec<u8>)> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::ControlOut { setup, data } => Some((*setup, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Captured bulk OUT payloads.
    pub fn bulk_outs(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::BulkOut { endpoint, data } => Some((*endpoint, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Clear captured operations.
    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }
}

/// Mock backend for unit testing channel and protocol logic.
pub struct MockBackend {
    identity: DeviceIdentity,
    handle: MockHandle,
}

impl MockBackend {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self::with_handle(identity, MockHandle::new())
    }

    pub fn with_handle(identity: DeviceIdentity, handle: MockHandle) -> Self {
        Self { identity, handle }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl UsbBackend for MockBackend {
    fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::SetConfiguration(value));
        if state.disconnected {
            return Err(UsbError::Disconnected);
        }
        if state.configuration_fails {
            return Err(UsbError::AccessDenied("configuration busy".into()));
        }
        state.claimed = None;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::ClaimInterface {
            interface,
            alt_setting,
        });
        state.take_fault(MockTransfer::ClaimInterface)?;
        state.claimed = Some((interface, alt_setting));
        Ok(())
    }

    fn endpoints(&self, interface: u8, alt_setting: u8) -> Result<Vec<EndpointInfo>, UsbError> {
        Ok(self
            .handle
            .lock()
            .endpoints
            .get(&(interface, alt_setting))
            .cloned()
            .unwrap_or_default())
    }

    fn control_in(
        &mut self,
        setup: &SetupPacket,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::ControlIn { setup: *setup });
        state.take_fault(MockTransfer::ControlIn)?;

        let response = match state.control_in_queue.pop_front() {
            Some(r) => r,
            None => state.control_in_default.clone().ok_or(UsbError::Timeout {
                timeout_ms: 5000,
                transferred: 0,
            })?,
        };
        // The device never sends more than wLength.
        let n = response.len().min(buf.len()).min(setup.length as usize);
        buf[..n].copy_from_slice(&response[..n]);
        Ok(n)
    }

    fn control_out(
        &mut self,
        setup: &SetupPacket,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::ControlOut {
            setup: *setup,
            data: data.to_vec(),
        });
        state.take_fault(MockTransfer::ControlOut)?;
        Ok(data.len())
    }

    fn bulk_out(
        &mut self,
        endpoint: &EndpointInfo,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::BulkOut {
            endpoint: endpoint.address,
            data: data.to_vec(),
        });
        state.take_fault(MockTransfer::BulkOut)?;
        Ok(data.len())
    }

    fn bulk_in(
        &mut self,
        endpoint: &EndpointInfo,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::BulkIn {
            endpoint: endpoint.address,
            capacity: buf.len(),
        });
        state.take_fault(MockTransfer::BulkIn)?;

        let response = state.bulk_in_queue.pop_front().ok_or(UsbError::Timeout {
            timeout_ms: 5000,
            transferred: 0,
        })?;
        let n = response.len().min(buf.len());
        buf[..n].copy_from_slice(&response[..n]);
        Ok(response.len())
    }

    fn isochronous_out(
        &mut self,
        endpoint: &EndpointInfo,
        _data: &[u8],
        frame_start: u64,
        frames: &mut [IsocFrame],
    ) -> Result<(), UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::IsocOut {
            endpoint: endpoint.address,
            frame_start,
            frames: frames.len(),
        });
        state.take_fault(MockTransfer::Isochronous)?;
        complete_frames(&mut state, frames);
        Ok(())
    }

    fn isochronous_in(
        &mut self,
        endpoint: &EndpointInfo,
        buf: &mut [u8],
        frame_start: u64,
        frames: &mut [IsocFrame],
    ) -> Result<(), UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::IsocIn {
            endpoint: endpoint.address,
            frame_start,
            frames: frames.len(),
        });
        state.take_fault(MockTransfer::Isochronous)?;

        let mut offset = 0;
        for (i, frame) in frames.iter().enumerate() {
            let len = frame.requested as usize;
            if !state.failed_frames.contains(&i) {
                buf[offset..offset + len].fill(i as u8);
            }
            offset += len;
        }
        complete_frames(&mut state, frames);
        Ok(())
    }

    fn current_frame(&self) -> Result<u64, UsbError> {
        let state = self.handle.lock();
        if state.disconnected {
            return Err(UsbError::Disconnected);
        }
        Ok(state.current_frame)
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::Reset);
        state.take_fault(MockTransfer::Reset)?;
        state.claimed = None;
        Ok(())
    }

    fn reenumerate(&mut self) -> Result<(), UsbError> {
        let mut state = self.handle.lock();
        state.ops.push(MockOp::Reenumerate);
        if state.disconnected {
            return Err(UsbError::Disconnected);
        }
        state.claimed = None;
        Ok(())
    }
}

fn complete_frames(state: &mut MockState, frames: &mut [IsocFrame]) {
    let failed = std::mem::take(&mut state.failed_frames);
    for (i, frame) in frames.iter_mut().enumerate() {
        if failed.contains(&i) {
            frame.actual = 0;
            frame.status = FrameStatus::Error;
        } else {
            frame.actual = frame.requested;
            frame.status = FrameStatus::Ok;
        }
    }
}
