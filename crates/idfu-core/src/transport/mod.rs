//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBackend, MockFault, MockHandle, MockOp, MockTransfer};
pub use nusb::NusbBackend;
pub use traits::{EndpointInfo, FrameStatus, IsocFrame, TransferType, UsbBackend};
