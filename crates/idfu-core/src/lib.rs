//! iDFU-Core: USB transfer primitives and the Apple DFU/iBoot upload protocol.
//!
//! This crate talks to Apple devices sitting in the boot ROM's DFU mode
//! (`05AC:1227`) or in iBoot recovery mode (`05AC:1281`): it finds them,
//! opens them exclusively, and uploads images or sends recovery commands.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Request codes, setup packets, DFU status records
//! - **Transport**: USB backend abstraction (nusb, mock)
//! - **Channel**: State-checked control/bulk/isochronous transfers on one device
//! - **Catalog**: Enumeration, exclusive open, hot-plug monitoring
//! - **DFU**: Chunked upload engine for both dialects
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use idfu_core::{DeviceCatalog, DfuTransferEngine, EngineConfig, NusbCatalog};
//!
//! let catalog = NusbCatalog::new();
//! let mut channel = catalog.open_apple().expect("no device");
//! let mut engine = DfuTransferEngine::new(&mut channel, EngineConfig::default()).unwrap();
//!
//! let image = std::fs::read("iBSS.img4").unwrap();
//! let session = engine.send_buffer(&image, true).expect("upload failed");
//! println!("sent {} bytes", session.bytes_sent);
//! ```

pub mod catalog;
pub mod channel;
pub mod config;
pub mod device;
pub mod dfu;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use catalog::{DeviceCatalog, DeviceEvent, DeviceFilter, DeviceMonitor, MockCatalog, NusbCatalog};
pub use channel::{ChannelState, TransferChannel};
pub use config::EngineConfig;
pub use device::{DeviceDescriptor, DeviceIdentity};
pub use dfu::{DfuSession, DfuTransferEngine, Dialect, SendError};
pub use error::{ErrorKind, TransferResult, UsbError};
pub use events::{DfuEvent, DfuObserver, LogLevel, NullObserver, TracingObserver, TransferPhase};
pub use protocol::{ControlPacket, DfuState, DfuStatus, SetupPacket};
pub use transport::{MockBackend, MockHandle, NusbBackend, UsbBackend};
