//! Upload engine.
//!
//! DFU mode:
//!   DNLOAD(chunk, wValue = index) → GETSTATUS until dfuDNLOAD-IDLE → ...
//!   → DNLOAD(empty) → GETSTATUS × N → port reset
//!
//! iBoot mode:
//!   vendor initiate request → bulk OUT 0x04 (interface 1 alt 1) per chunk

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::session::{Chunks, DfuSession, sequence_number};
use super::{Dialect, SendError};
use crate::channel::{ChannelState, TransferChannel};
use crate::config::EngineConfig;
use crate::error::UsbError;
use crate::events::{DfuEvent, DfuObserver, LogLevel, TracingObserver, TransferPhase};
use crate::protocol::constants::*;
use crate::protocol::{ControlPacket, DfuStatus};
use crate::transport::UsbBackend;

/// Drives uploads and commands over one channel.
pub struct DfuTransferEngine<'a, B: UsbBackend, O: DfuObserver = TracingObserver> {
    channel: &'a mut TransferChannel<B>,
    config: EngineConfig,
    observer: Arc<O>,
    dialect: Dialect,
    phase: TransferPhase,
}

impl<'a, B: UsbBackend> DfuTransferEngine<'a, B, TracingObserver> {
    /// Create an engine that reports progress through tracing.
    pub fn new(channel: &'a mut TransferChannel<B>, config: EngineConfig) -> Result<Self, UsbError> {
        Self::with_observer(channel, config, Arc::new(TracingObserver))
    }
}

impl<'a, B: UsbBackend, O: DfuObserver> DfuTransferEngine<'a, B, O> {
    /// Create an engine with a custom observer.
    ///
    /// Fails with `Unsupported` unless the device is an Apple DFU or
    /// recovery mode device.
    pub fn with_observer(
        channel: &'a mut TransferChannel<B>,
        config: EngineConfig,
        observer: Arc<O>,
    ) -> Result<Self, UsbError> {
        let dialect = Dialect::from_identity(channel.identity())?;
        debug!(device = %channel.identity(), dialect = %dialect, "Engine created");
        Ok(Self {
            channel,
            config,
            observer,
            dialect,
            phase: TransferPhase::Preparing,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn set_phase(&mut self, to: TransferPhase) {
        if self.phase != to {
            self.observer.on_event(&DfuEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn report_error(&mut self, error: &UsbError) {
        self.observer.on_event(&DfuEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.set_phase(TransferPhase::Error);
    }

    /// Bring the channel to `InterfaceClaimed` using the configured values.
    fn prepare(&mut self) -> Result<(), UsbError> {
        match self.channel.state() {
            ChannelState::Closed => return Err(UsbError::Closed),
            ChannelState::Open => {
                self.channel.set_configuration(self.config.configuration)?;
                self.channel
                    .set_interface(self.config.interface, self.config.alt_setting)?;
            }
            ChannelState::Configured => {
                self.channel
                    .set_interface(self.config.interface, self.config.alt_setting)?;
            }
            ChannelState::InterfaceClaimed => {}
        }
        Ok(())
    }

    /// `wIndex` of class requests: the claimed interface.
    fn control_index(&self) -> u16 {
        self.channel
            .interface()
            .map(|(interface, _)| interface)
            .unwrap_or(self.config.interface) as u16
    }

    fn require_dfu(&self, operation: &str) -> Result<(), UsbError> {
        if self.dialect != Dialect::Dfu {
            return Err(UsbError::unsupported(format!(
                "{operation} is not available in {} mode",
                self.dialect
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffer upload
    // ------------------------------------------------------------------

    /// Upload `buffer` in dialect-sized chunks.
    ///
    /// With `notify` set, a DFU-mode upload is finalized (end-of-image
    /// request, manifest status reads, optional reset). iBoot mode has no
    /// finalize step and ignores `notify`.
    #[instrument(skip(self, buffer), fields(dialect = %self.dialect, size = buffer.len()))]
    pub fn send_buffer(&mut self, buffer: &[u8], notify: bool) -> Result<DfuSession, SendError> {
        let mut session = DfuSession::new(self.dialect, buffer.len(), notify);
        info!(chunks = session.total_chunks(), chunk_size = session.chunk_size, "Sending buffer");

        self.set_phase(TransferPhase::Preparing);
        match self.run_upload(buffer, &mut session) {
            Ok(()) => {
                self.observer.on_event(&DfuEvent::Complete {
                    bytes_sent: session.bytes_sent,
                });
                self.set_phase(TransferPhase::Complete);
                Ok(session)
            }
            Err(error) => {
                warn!(error = %error, bytes_sent = session.bytes_sent, "Upload failed");
                self.report_error(&error);
                Err(SendError {
                    error,
                    bytes_sent: session.bytes_sent,
                })
            }
        }
    }

    fn run_upload(&mut self, buffer: &[u8], session: &mut DfuSession) -> Result<(), UsbError> {
        self.prepare()?;
        self.set_phase(TransferPhase::Uploading);
        match self.dialect {
            Dialect::Dfu => {
                self.upload_control(buffer, session)?;
                if session.notify {
                    self.finalize(session)?;
                }
                Ok(())
            }
            Dialect::IBoot => self.upload_bulk(buffer, session),
        }
    }

    fn emit_chunk(&self, index: usize, length: usize, session: &DfuSession) {
        self.observer.on_event(&DfuEvent::ChunkSent { index, length });
        self.observer.on_event(&DfuEvent::Progress {
            current: session.bytes_sent,
            total: session.total_size,
        });
    }

    fn upload_control(&mut self, buffer: &[u8], session: &mut DfuSession) -> Result<(), UsbError> {
        let timeout = self.config.control_timeout();
        let index = self.control_index();

        for (i, chunk) in Chunks::new(buffer, session.chunk_size) {
            let packet =
                ControlPacket::out(DFU_REQUEST_OUT, DFU_DNLOAD, sequence_number(i), index, chunk);
            let n = self.channel.control_transfer(packet, timeout)?;
            if n != chunk.len() {
                return Err(UsbError::Io {
                    message: format!("chunk {i}: device accepted {n} of {} bytes", chunk.len()),
                    transferred: n,
                });
            }
            session.record_chunk(n);
            self.emit_chunk(i, n, session);

            self.wait_until_idle()?;
        }
        Ok(())
    }

    fn upload_bulk(&mut self, buffer: &[u8], session: &mut DfuSession) -> Result<(), UsbError> {
        self.channel.control_transfer(
            ControlPacket::no_data(
                VENDOR_REQUEST_OUT_INTERFACE,
                RECOVERY_CMD_INITIATE_UPLOAD,
                0,
                0,
            ),
            self.config.control_timeout(),
        )?;

        let upload = (RECOVERY_UPLOAD_INTERFACE, RECOVERY_UPLOAD_ALT_SETTING);
        let previous = self.channel.interface();
        if previous != Some(upload) {
            self.channel.set_interface(upload.0, upload.1)?;
        }

        let result = self.write_chunks(buffer, session);

        if let Some((interface, alt_setting)) = previous.filter(|p| *p != upload) {
            if let Err(e) = self.channel.set_interface(interface, alt_setting) {
                self.log(
                    LogLevel::Warn,
                    format!("could not restore interface {interface}: {e}"),
                );
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    fn write_chunks(&mut self, buffer: &[u8], session: &mut DfuSession) -> Result<(), UsbError> {
        let timeout = self.config.bulk_timeout();
        for (i, chunk) in Chunks::new(buffer, session.chunk_size) {
            let n = self
                .channel
                .bulk_write(RECOVERY_UPLOAD_ENDPOINT, chunk, timeout)?;
            if n != chunk.len() {
                return Err(UsbError::Io {
                    message: format!("chunk {i}: wrote {n} of {} bytes", chunk.len()),
                    transferred: n,
                });
            }
            session.record_chunk(n);
            self.emit_chunk(i, n, session);
        }
        Ok(())
    }

    /// Poll GETSTATUS until the device is back in dfuDNLOAD-IDLE.
    ///
    /// Between reads the engine waits for the device's bwPollTimeout, at
    /// least the configured interval and at most one control timeout.
    fn wait_until_idle(&mut self) -> Result<DfuStatus, UsbError> {
        let retries = self.config.status_poll_retries.max(1);
        for attempt in 1..=retries {
            let status = self.read_status()?;
            self.observer.on_event(&DfuEvent::StatusPolled {
                attempt,
                status: status.status,
                state: status.state,
            });
            status.ok()?;
            if status.is_ready() {
                return Ok(status);
            }
            if attempt < retries {
                thread::sleep(self.poll_delay(&status));
            }
        }
        Err(UsbError::io(format!(
            "device not ready after {retries} status reads"
        )))
    }

    fn poll_delay(&self, status: &DfuStatus) -> Duration {
        Duration::from_millis(u64::from(status.poll_timeout))
            .min(self.config.control_timeout())
            .max(self.config.status_poll_interval())
    }

    fn read_status(&mut self) -> Result<DfuStatus, UsbError> {
        let mut buf = [0u8; DFU_STATUS_LEN as usize];
        let index = self.control_index();
        let n = self.channel.control_transfer(
            ControlPacket::input(DFU_REQUEST_IN, DFU_GETSTATUS, 0, index, &mut buf),
            self.config.control_timeout(),
        )?;
        DfuStatus::from_bytes(&buf[..n])
    }

    /// End-of-image request, manifest status reads, then reset.
    fn finalize(&mut self, session: &mut DfuSession) -> Result<(), UsbError> {
        self.set_phase(TransferPhase::Finalizing);
        let index = self.control_index();
        self.channel.control_transfer(
            ControlPacket::no_data(
                DFU_REQUEST_OUT,
                DFU_DNLOAD,
                sequence_number(session.chunks_sent),
                index,
            ),
            self.config.control_timeout(),
        )?;

        // The device starts manifesting here and may stop answering.
        for attempt in 1..=self.config.finalize_status_reads {
            match self.read_status() {
                Ok(status) => {
                    self.observer.on_event(&DfuEvent::StatusPolled {
                        attempt,
                        status: status.status,
                        state: status.state,
                    });
                    status.ok()?;
                }
                Err(e) => self.log(
                    LogLevel::Debug,
                    format!("manifest status read {attempt} failed: {e}"),
                ),
            }
        }
        session.finalized = true;

        if self.config.reset_after_finalize {
            match self.channel.reset_device() {
                Ok(()) => {}
                Err(UsbError::Disconnected) => {
                    self.log(LogLevel::Info, "device left the bus during reset");
                }
                Err(e) => return Err(e),
            }
        }
        info!("Image finalized");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands and DFU housekeeping
    // ------------------------------------------------------------------

    /// Send a NUL-terminated command string to iBoot.
    #[instrument(skip(self), fields(dialect = %self.dialect))]
    pub fn send_command(&mut self, command: &str) -> Result<(), UsbError> {
        if !self.dialect.accepts_commands() {
            return Err(UsbError::unsupported(format!(
                "{} mode does not accept commands",
                self.dialect
            )));
        }
        if command.contains('\0') {
            return Err(UsbError::unsupported("command contains NUL"));
        }
        if command.len() + 1 > MAX_COMMAND_LEN {
            return Err(UsbError::unsupported(format!(
                "command is {} bytes, limit is {}",
                command.len(),
                MAX_COMMAND_LEN - 1
            )));
        }

        let mut payload = Vec::with_capacity(command.len() + 1);
        payload.extend_from_slice(command.as_bytes());
        payload.push(0);

        self.set_phase(TransferPhase::Command);
        let result = self.prepare().and_then(|()| {
            self.channel.control_transfer(
                ControlPacket::out(VENDOR_REQUEST_OUT_DEVICE, RECOVERY_CMD_SEND, 0, 0, &payload),
                self.config.control_timeout(),
            )
        });
        match result {
            Ok(_) => {
                self.observer.on_event(&DfuEvent::CommandSent {
                    command: command.to_string(),
                });
                self.set_phase(TransferPhase::Complete);
                Ok(())
            }
            Err(e) => {
                self.report_error(&e);
                Err(e)
            }
        }
    }

    /// Read and decode the DFU status.
    pub fn get_status(&mut self) -> Result<DfuStatus, UsbError> {
        self.require_dfu("GETSTATUS")?;
        self.prepare()?;
        self.read_status()
    }

    /// Leave dfuERROR.
    pub fn clear_status(&mut self) -> Result<(), UsbError> {
        self.require_dfu("CLRSTATUS")?;
        self.prepare()?;
        self.class_request(DFU_CLRSTATUS)
    }

    /// Abandon an upload and return to dfuIDLE.
    pub fn abort(&mut self) -> Result<(), UsbError> {
        self.require_dfu("ABORT")?;
        self.prepare()?;
        self.class_request(DFU_ABORT)
    }

    fn class_request(&mut self, request: u8) -> Result<(), UsbError> {
        let index = self.control_index();
        self.channel.control_transfer(
            ControlPacket::no_data(DFU_REQUEST_OUT, request, 0, index),
            self.config.control_timeout(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::error::ErrorKind;
    use crate::events::{NullObserver, RecordingObserver};
    use std::time::Instant;
    use crate::protocol::{DfuState, SetupPacket};
    use crate::transport::{
        EndpointInfo, MockBackend, MockFault, MockHandle, MockOp, MockTransfer, TransferType,
    };

    const READY: [u8; 6] = [0, 0, 0, 0, 5, 0];
    const BUSY: [u8; 6] = [0, 0, 0, 0, 4, 0];
    const FAILED: [u8; 6] = [0x0E, 0, 0, 0, 10, 0];

    fn config() -> EngineConfig {
        EngineConfig {
            status_poll_interval_ms: 0,
            ..Default::default()
        }
    }

    fn dfu_channel() -> (TransferChannel<MockBackend>, MockHandle) {
        let backend = MockBackend::new(DeviceIdentity::APPLE_DFU);
        let handle = backend.handle();
        (TransferChannel::from_backend(backend), handle)
    }

    fn recovery_channel() -> (TransferChannel<MockBackend>, MockHandle) {
        let backend = MockBackend::new(DeviceIdentity::APPLE_RECOVERY);
        let handle = backend.handle();
        handle.set_endpoints(
            1,
            1,
            vec![
                EndpointInfo::new(0x04, TransferType::Bulk, 512),
                EndpointInfo::new(0x85, TransferType::Bulk, 512),
            ],
        );
        (TransferChannel::from_backend(backend), handle)
    }

    fn dnloads(handle: &MockHandle) -> Vec<(SetupPacket, Vec<u8>)> {
        handle
            .control_outs()
            .into_iter()
            .filter(|(s, _)| s.request_type == DFU_REQUEST_OUT && s.request == DFU_DNLOAD)
            .collect()
    }

    fn status_reads(handle: &MockHandle) -> usize {
        handle
            .ops()
            .iter()
            .filter(|op| matches!(op, MockOp::ControlIn { setup } if setup.request == DFU_GETSTATUS))
            .count()
    }

    #[test]
    fn test_dfu_two_chunks_then_finalize() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        let image = vec![0xA5u8; 4096];

        let session = {
            let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
            engine.send_buffer(&image, true).unwrap()
        };

        let dnloads = dnloads(&handle);
        assert_eq!(dnloads.len(), 3);
        assert_eq!(dnloads[0].0.value, 0);
        assert_eq!(dnloads[0].1.len(), 0x800);
        assert_eq!(dnloads[1].0.value, 1);
        assert_eq!(dnloads[1].1.len(), 0x800);
        // End of image
        assert_eq!(dnloads[2].0.length, 0);
        assert!(dnloads[2].1.is_empty());

        assert_eq!(status_reads(&handle), 2 + 3);
        assert_eq!(handle.ops().last(), Some(&MockOp::Reset));

        assert_eq!(session.bytes_sent, 4096);
        assert_eq!(session.chunks_sent, 2);
        assert!(session.finalized);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test]
    fn test_dfu_polls_through_busy() {
        let (mut channel, handle) = dfu_channel();
        handle.queue_control_in(&BUSY);
        handle.queue_control_in(&BUSY);
        handle.set_default_control_in(&READY);

        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        let session = engine.send_buffer(&[1, 2, 3], false).unwrap();

        assert_eq!(session.bytes_sent, 3);
        assert!(!session.finalized);
        assert_eq!(status_reads(&handle), 3);
        assert_eq!(dnloads(&handle).len(), 1);
    }

    #[test]
    fn test_dfu_retry_exhaustion_stops_upload() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&BUSY);
        let cfg = EngineConfig {
            status_poll_retries: 3,
            ..config()
        };

        let mut engine = DfuTransferEngine::new(&mut channel, cfg).unwrap();
        let err = engine.send_buffer(&vec![0u8; 6000], true).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.bytes_sent, 0x800);
        // No resend, no further chunks, no finalize
        assert_eq!(dnloads(&handle).len(), 1);
        assert_eq!(status_reads(&handle), 3);
    }

    #[test]
    fn test_dfu_error_state_is_unsuccessful() {
        let (mut channel, handle) = dfu_channel();
        handle.queue_control_in(&FAILED);

        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        let err = engine.send_buffer(&[0u8; 16], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsuccessful);
        assert!(matches!(
            err.error,
            UsbError::DeviceStatus {
                status: 0x0E,
                state: 10
            }
        ));
    }

    #[test]
    fn test_dfu_timeout_keeps_bytes_sent() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        handle.fail_nth(MockTransfer::ControlOut, 1, MockFault::Timeout);

        {
            let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
            let err = engine.send_buffer(&vec![0u8; 0x1800], true).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Io);
            assert_eq!(err.bytes_sent, 0x800);
        }
        assert_eq!(channel.state(), ChannelState::InterfaceClaimed);
    }

    #[test]
    fn test_empty_buffer() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        let cfg = EngineConfig {
            reset_after_finalize: false,
            ..config()
        };

        let mut engine = DfuTransferEngine::new(&mut channel, cfg).unwrap();
        let session = engine.send_buffer(&[], true).unwrap();
        assert_eq!(session.bytes_sent, 0);
        assert!(session.finalized);
        let dnloads = dnloads(&handle);
        assert_eq!(dnloads.len(), 1);
        assert_eq!(dnloads[0].0.length, 0);

        handle.clear_ops();
        let session = engine.send_buffer(&[], false).unwrap();
        assert_eq!(session.chunks_sent, 0);
        assert!(handle.ops().is_empty());
    }

    #[test]
    fn test_iboot_bulk_upload() {
        let (mut channel, handle) = recovery_channel();

        let session = {
            let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
            engine.send_buffer(&vec![0x11u8; 0x9000], true).unwrap()
        };

        assert_eq!(session.bytes_sent, 0x9000);
        assert!(!session.finalized);

        let writes = handle.bulk_outs();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, 0x04);
        assert_eq!(writes[0].1.len(), 0x8000);
        assert_eq!(writes[1].1.len(), 0x1000);

        let initiate = &handle.control_outs()[0].0;
        assert_eq!(initiate.request_type, VENDOR_REQUEST_OUT_INTERFACE);
        assert_eq!(initiate.request, RECOVERY_CMD_INITIATE_UPLOAD);

        // No status polls, no finalize, no reset
        assert_eq!(status_reads(&handle), 0);
        assert!(!handle.ops().contains(&MockOp::Reset));

        // Control interface restored
        assert_eq!(channel.interface(), Some((0, 0)));
        assert_eq!(
            handle
                .ops()
                .iter()
                .filter(|op| matches!(op, MockOp::ClaimInterface { .. }))
                .count(),
            3
        );
    }

    #[test]
    fn test_iboot_send_command() {
        let (mut channel, handle) = recovery_channel();
        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        engine.send_command("go").unwrap();

        let outs = handle.control_outs();
        assert_eq!(outs.len(), 1);
        let (setup, data) = &outs[0];
        assert_eq!(setup.request_type, 0x40);
        assert_eq!(setup.request, 0);
        assert_eq!(setup.length, 3);
        assert_eq!(data, b"go\0");
    }

    #[test]
    fn test_command_length_limit() {
        let (mut channel, handle) = recovery_channel();
        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();

        let err = engine.send_command(&"a".repeat(0x100)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = engine.send_command("set\0x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(handle.ops().is_empty());

        engine.send_command(&"a".repeat(0xFF)).unwrap();
        assert_eq!(handle.control_outs()[0].1.len(), 0x100);
    }

    #[test]
    fn test_dfu_rejects_commands_without_io() {
        let (mut channel, handle) = dfu_channel();
        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();

        let err = engine.send_command("reboot").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(handle.ops().is_empty());
    }

    #[test]
    fn test_unknown_device_rejected() {
        let mut channel = TransferChannel::from_backend(MockBackend::new(DeviceIdentity::new(
            0x05AC, 0x12A8,
        )));
        let err = DfuTransferEngine::new(&mut channel, config()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_status_housekeeping() {
        let (mut channel, handle) = dfu_channel();
        handle.queue_control_in(&FAILED);
        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();

        let status = engine.get_status().unwrap();
        assert_eq!(status.state, DfuState::Error);
        engine.clear_status().unwrap();
        engine.abort().unwrap();

        let requests: Vec<u8> = handle.control_outs().iter().map(|(s, _)| s.request).collect();
        assert_eq!(requests, vec![DFU_CLRSTATUS, DFU_ABORT]);
    }

    #[test]
    fn test_iboot_has_no_dfu_status() {
        let (mut channel, _handle) = recovery_channel();
        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        assert_eq!(engine.get_status().unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(engine.abort().unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_observer_sees_progress() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        let observer = Arc::new(RecordingObserver::new());

        let mut engine =
            DfuTransferEngine::with_observer(&mut channel, config(), Arc::clone(&observer))
                .unwrap();
        engine.send_buffer(&[0u8; 0x1000], false).unwrap();

        let events = observer.events();
        let chunks = events
            .iter()
            .filter(|e| matches!(e, DfuEvent::ChunkSent { .. }))
            .count();
        assert_eq!(chunks, 2);
        assert!(matches!(
            events.last(),
            Some(DfuEvent::PhaseChanged {
                to: TransferPhase::Complete,
                ..
            })
        ));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DfuEvent::Complete { bytes_sent: 0x1000 }))
        );
    }

    fn logs(observer: &RecordingObserver, wanted: LogLevel) -> usize {
        observer
            .events()
            .iter()
            .filter(|e| matches!(e, DfuEvent::Log { level, .. } if *level == wanted))
            .count()
    }

    #[test]
    fn test_status_poll_honors_device_poll_timeout() {
        let (mut channel, handle) = dfu_channel();
        // dfuDNBUSY, bwPollTimeout = 50 ms
        handle.queue_control_in(&[0, 50, 0, 0, 4, 0]);
        handle.set_default_control_in(&READY);

        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        let start = Instant::now();
        engine.send_buffer(&[1, 2, 3], false).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(status_reads(&handle), 2);
    }

    #[test]
    fn test_poll_delay_bounds() {
        let (mut channel, _handle) = dfu_channel();
        let cfg = EngineConfig {
            control_timeout_ms: 20,
            status_poll_interval_ms: 5,
            ..config()
        };
        let engine = DfuTransferEngine::new(&mut channel, cfg).unwrap();

        let slow = DfuStatus {
            poll_timeout: 0xFF_FFFF,
            ..Default::default()
        };
        assert_eq!(engine.poll_delay(&slow), Duration::from_millis(20));
        assert_eq!(engine.poll_delay(&DfuStatus::default()), Duration::from_millis(5));
    }

    #[test]
    fn test_finalize_rejected_status_is_unsuccessful() {
        let (mut channel, handle) = dfu_channel();
        handle.queue_control_in(&READY);
        handle.set_default_control_in(&FAILED);

        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        let err = engine.send_buffer(&[7u8; 3], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsuccessful);
        assert_eq!(err.bytes_sent, 3);
        assert_eq!(dnloads(&handle).len(), 2);
        assert!(!handle.ops().contains(&MockOp::Reset));
    }

    #[test]
    fn test_finalize_request_failure() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        // Second DNLOAD is the end-of-image request
        handle.fail_nth(MockTransfer::ControlOut, 1, MockFault::Stall);

        let mut engine =
            DfuTransferEngine::with_observer(&mut channel, config(), Arc::new(NullObserver))
                .unwrap();
        let err = engine.send_buffer(&[7u8; 3], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsuccessful);
        assert_eq!(err.bytes_sent, 3);
        assert_eq!(status_reads(&handle), 1);
        assert!(!handle.ops().contains(&MockOp::Reset));
    }

    #[test]
    fn test_manifest_read_failures_tolerated() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        handle.fail_nth(MockTransfer::ControlIn, 1, MockFault::Timeout);
        handle.fail_nth(MockTransfer::ControlIn, 2, MockFault::Disconnect);
        let observer = Arc::new(RecordingObserver::new());

        let session = {
            let mut engine =
                DfuTransferEngine::with_observer(&mut channel, config(), Arc::clone(&observer))
                    .unwrap();
            engine.send_buffer(&[7u8; 3], true).unwrap()
        };
        assert!(session.finalized);
        assert_eq!(status_reads(&handle), 1 + 3);
        assert_eq!(logs(&observer, LogLevel::Debug), 2);
    }

    #[test]
    fn test_reset_disconnect_counts_as_success() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        handle.fail_nth(MockTransfer::Reset, 0, MockFault::Disconnect);
        let observer = Arc::new(RecordingObserver::new());

        let session = {
            let mut engine =
                DfuTransferEngine::with_observer(&mut channel, config(), Arc::clone(&observer))
                    .unwrap();
            engine.send_buffer(&[7u8; 3], true).unwrap()
        };
        assert!(session.finalized);
        assert_eq!(handle.ops().last(), Some(&MockOp::Reset));
        assert_eq!(logs(&observer, LogLevel::Info), 1);
    }

    #[test]
    fn test_reset_failure_is_reported() {
        let (mut channel, handle) = dfu_channel();
        handle.set_default_control_in(&READY);
        handle.fail_nth(MockTransfer::Reset, 0, MockFault::Io);

        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        let err = engine.send_buffer(&[7u8; 3], true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.bytes_sent, 3);
    }

    #[test]
    fn test_iboot_bulk_failure_restores_interface() {
        let (mut channel, handle) = recovery_channel();
        handle.fail_nth(MockTransfer::BulkOut, 1, MockFault::Io);

        let err = {
            let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
            engine.send_buffer(&vec![0u8; 0x10000], false).unwrap_err()
        };
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.bytes_sent, 0x8000);
        assert_eq!(handle.bulk_outs().len(), 2);
        assert_eq!(channel.interface(), Some((0, 0)));
        assert_eq!(handle.claimed_interface(), Some((0, 0)));
    }

    #[test]
    fn test_restore_failure_after_upload_is_reported() {
        let (mut channel, handle) = recovery_channel();
        // Claims: control interface, upload interface, restore
        handle.fail_nth(MockTransfer::ClaimInterface, 2, MockFault::Io);
        let observer = Arc::new(RecordingObserver::new());

        let err = {
            let mut engine =
                DfuTransferEngine::with_observer(&mut channel, config(), Arc::clone(&observer))
                    .unwrap();
            engine.send_buffer(&[0u8; 0x100], false).unwrap_err()
        };
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.bytes_sent, 0x100);
        assert_eq!(logs(&observer, LogLevel::Warn), 1);
        assert_eq!(channel.interface(), Some((1, 1)));
    }

    #[test]
    fn test_restore_failure_keeps_upload_error() {
        let (mut channel, handle) = recovery_channel();
        handle.fail_nth(MockTransfer::BulkOut, 0, MockFault::Timeout);
        handle.fail_nth(MockTransfer::ClaimInterface, 2, MockFault::Io);

        let mut engine = DfuTransferEngine::new(&mut channel, config()).unwrap();
        let err = engine.send_buffer(&[0u8; 0x100], false).unwrap_err();
        assert!(matches!(err.error, UsbError::Timeout { .. }));
        assert_eq!(err.bytes_sent, 0);
    }
}
