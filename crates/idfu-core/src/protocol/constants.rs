//! Protocol constants for Apple DFU and iBoot recovery devices.
//!
//! Request codes follow the USB DFU 1.1 class specification; the recovery
//! mode opcodes are Apple vendor requests.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Apple Inc. Vendor ID
pub const APPLE_VENDOR_ID: u16 = 0x05AC;

/// Boot ROM in DFU mode
pub const DFU_PRODUCT_ID: u16 = 0x1227;

/// iBoot in recovery mode
pub const RECOVERY_PRODUCT_ID: u16 = 0x1281;

/// All product ids the transfer engine knows how to drive
pub const SUPPORTED_PIDS: &[u16] = &[DFU_PRODUCT_ID, RECOVERY_PRODUCT_ID];

// ============================================================================
// bmRequestType
// ============================================================================

/// Direction bit (bit 7): set for device-to-host.
pub const REQUEST_DIR_IN: u8 = 0x80;
pub const REQUEST_TYPE_MASK: u8 = 0x60;
pub const REQUEST_TYPE_SHIFT: u8 = 5;
pub const REQUEST_RECIPIENT_MASK: u8 = 0x1F;

/// Class request, host-to-device, interface recipient.
pub const DFU_REQUEST_OUT: u8 = 0x21;
/// Class request, device-to-host, interface recipient.
pub const DFU_REQUEST_IN: u8 = 0xA1;
/// Vendor request, host-to-device, device recipient.
pub const VENDOR_REQUEST_OUT_DEVICE: u8 = 0x40;
/// Vendor request, host-to-device, interface recipient.
pub const VENDOR_REQUEST_OUT_INTERFACE: u8 = 0x41;

// ============================================================================
// Standard Requests
// ============================================================================

pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
/// Length of a configuration descriptor header (bLength..bMaxPower).
pub const CONFIGURATION_HEADER_LEN: u16 = 9;

// ============================================================================
// DFU Class Requests
// ============================================================================

pub const DFU_DETACH: u8 = 0;
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_UPLOAD: u8 = 2;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;

/// GETSTATUS response: bStatus, bwPollTimeout[3], bState, iString
pub const DFU_STATUS_LEN: u16 = 6;

// ============================================================================
// Recovery Mode Vendor Requests
// ============================================================================

/// Send a NUL-terminated command string.
pub const RECOVERY_CMD_SEND: u8 = 0;
/// Announce a bulk upload.
pub const RECOVERY_CMD_INITIATE_UPLOAD: u8 = 0;

/// Bulk OUT endpoint used for recovery uploads
pub const RECOVERY_UPLOAD_ENDPOINT: u8 = 0x04;
/// Interface / alternate setting exposing the upload endpoint
pub const RECOVERY_UPLOAD_INTERFACE: u8 = 1;
pub const RECOVERY_UPLOAD_ALT_SETTING: u8 = 1;

/// Longest command payload including the NUL terminator.
pub const MAX_COMMAND_LEN: usize = 0x100;

// ============================================================================
// Size Constants
// ============================================================================

/// DFU mode chunk size
pub const DFU_CHUNK_SIZE: usize = 0x800;
/// Recovery mode bulk chunk size
pub const RECOVERY_CHUNK_SIZE: usize = 0x8000;

/// `wValue` carries the chunk index modulo this.
pub const SEQUENCE_WRAP: usize = 0x1_0000;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_STATUS_RETRIES: u32 = 20;
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_millis(1_000);
/// Status reads after the zero-length DNLOAD, moving the device into manifest.
pub const DEFAULT_FINALIZE_STATUS_READS: u32 = 3;
pub const DEFAULT_CONFIGURATION: u8 = 1;
pub const DEFAULT_INTERFACE: u8 = 0;
pub const DEFAULT_ALT_SETTING: u8 = 0;
