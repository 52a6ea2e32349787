//! Error taxonomy shared by every layer.
//!
//! `UsbError` carries the detail; `ErrorKind` is the small, stable status
//! surface callers switch on.

use std::fmt;

use thiserror::Error;

/// Stable status codes returned by every public operation.
///
/// The first four values are the legacy status codes and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    Success = 0,
    /// Transport failure: timeout, disconnect, short transfer.
    Io = 1,
    /// The device rejected a well-formed request.
    Unsuccessful = 2,
    /// Not applicable to the current dialect or channel state.
    Unsupported = 3,
    DeviceNotFound = 4,
    AccessDenied = 5,
    Enumeration = 6,
}

impl ErrorKind {
    /// Status of a finished operation.
    pub fn of<T>(result: &Result<T, UsbError>) -> Self {
        match result {
            Ok(_) => ErrorKind::Success,
            Err(e) => e.kind(),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Success => write!(f, "success"),
            ErrorKind::Io => write!(f, "I/O error"),
            ErrorKind::Unsuccessful => write!(f, "unsuccessful"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
            ErrorKind::DeviceNotFound => write!(f, "device not found"),
            ErrorKind::AccessDenied => write!(f, "access denied"),
            ErrorKind::Enumeration => write!(f, "enumeration error"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UsbError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Device handle is closed")]
    Closed,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Transfer failed after {transferred} bytes: {message}")]
    Io { message: String, transferred: usize },

    #[error("Timeout after {timeout_ms}ms ({transferred} bytes transferred)")]
    Timeout { timeout_ms: u64, transferred: usize },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Short buffer: device sent {actual} bytes into a {capacity} byte buffer")]
    ShortBuffer { capacity: usize, actual: usize },

    #[error("Request stalled by device")]
    Stall,

    #[error("Device reported status {status} in state {state}")]
    DeviceStatus { status: u8, state: u8 },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl UsbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UsbError::DeviceNotFound { .. } | UsbError::Closed => ErrorKind::DeviceNotFound,
            UsbError::AccessDenied(_) => ErrorKind::AccessDenied,
            UsbError::Enumeration(_) => ErrorKind::Enumeration,
            UsbError::Io { .. }
            | UsbError::Timeout { .. }
            | UsbError::Disconnected
            | UsbError::ShortBuffer { .. } => ErrorKind::Io,
            UsbError::Stall | UsbError::DeviceStatus { .. } => ErrorKind::Unsuccessful,
            UsbError::Unsupported(_) | UsbError::InvalidRequest(_) => ErrorKind::Unsupported,
        }
    }

    /// Bytes moved before the failure, where the transport reported it.
    pub fn transferred(&self) -> usize {
        match self {
            UsbError::Io { transferred, .. } | UsbError::Timeout { transferred, .. } => {
                *transferred
            }
            UsbError::ShortBuffer { capacity, .. } => *capacity,
            _ => 0,
        }
    }

    pub(crate) fn io(message: impl Into<String>) -> Self {
        UsbError::Io {
            message: message.into(),
            transferred: 0,
        }
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        UsbError::Unsupported(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        UsbError::InvalidRequest(message.into())
    }
}

/// Outcome of a single transfer primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    pub status: ErrorKind,
    pub bytes_transferred: u32,
}

impl From<&Result<usize, UsbError>> for TransferResult {
    fn from(result: &Result<usize, UsbError>) -> Self {
        let bytes = match result {
            Ok(n) => *n,
            Err(e) => e.transferred(),
        };
        Self {
            status: ErrorKind::of(result),
            bytes_transferred: u32::try_from(bytes).unwrap_or(u32::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_status_codes() {
        assert_eq!(ErrorKind::Success.code(), 0);
        assert_eq!(ErrorKind::Io.code(), 1);
        assert_eq!(ErrorKind::Unsuccessful.code(), 2);
        assert_eq!(ErrorKind::Unsupported.code(), 3);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(UsbError::Closed.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(UsbError::Stall.kind(), ErrorKind::Unsuccessful);
        assert_eq!(
            UsbError::ShortBuffer {
                capacity: 4,
                actual: 8
            }
            .kind(),
            ErrorKind::Io
        );
        assert_eq!(UsbError::invalid("bad").kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_transfer_result_keeps_partial_count() {
        let result: Result<usize, UsbError> = Err(UsbError::Timeout {
            timeout_ms: 100,
            transferred: 512,
        });
        let summary = TransferResult::from(&result);
        assert_eq!(summary.status, ErrorKind::Io);
        assert_eq!(summary.bytes_transferred, 512);

        let ok: Result<usize, UsbError> = Ok(64);
        assert_eq!(
            TransferResult::from(&ok),
            TransferResult {
                status: ErrorKind::Success,
                bytes_transferred: 64
            }
        );
    }
}
