//! Protocol module - wire formats and request codes.

pub mod constants;
pub mod setup;
pub mod status;

pub use constants::*;
pub use setup::{
    ControlData, ControlPacket, Direction, Recipient, RequestKind, SetupError, SetupPacket,
    request_type,
};
pub use status::{DfuState, DfuStatus};
