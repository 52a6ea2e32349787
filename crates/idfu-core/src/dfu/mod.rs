//! DFU / iBoot image upload and command protocol.
//!
//! The engine borrows an open [`TransferChannel`](crate::channel::TransferChannel),
//! picks the dialect from the device identity, and drives chunked uploads
//! and recovery-mode commands over it.

mod dialect;
mod engine;
mod session;

use thiserror::Error;

pub use dialect::Dialect;
pub use engine::DfuTransferEngine;
pub use session::{Chunks, DfuSession, sequence_number};

use crate::error::{ErrorKind, UsbError};

/// A failed buffer upload, with the progress made before the failure.
#[derive(Error, Debug)]
#[error("{error} ({bytes_sent} bytes sent)")]
pub struct SendError {
    #[source]
    pub error: UsbError,
    pub bytes_sent: u64,
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
