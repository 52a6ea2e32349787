//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow a transfer without tight coupling to
//! the engine.

use std::fmt;

use crate::error::ErrorKind;
use crate::protocol::DfuState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of one engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Selecting configuration and interface.
    Preparing,
    /// Chunks in flight.
    Uploading,
    /// DFU end-of-image request and manifest status reads.
    Finalizing,
    /// Single control request carrying a command string.
    Command,
    Complete,
    Error,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::Preparing => write!(f, "Preparing"),
            TransferPhase::Uploading => write!(f, "Uploading"),
            TransferPhase::Finalizing => write!(f, "Finalizing"),
            TransferPhase::Command => write!(f, "Command"),
            TransferPhase::Complete => write!(f, "Complete"),
            TransferPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the transfer engine.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Phase changed.
    PhaseChanged {
        from: TransferPhase,
        to: TransferPhase,
    },
    /// One chunk accepted by the transport.
    ChunkSent { index: usize, length: usize },
    /// Progress update for the current buffer.
    Progress { current: u64, total: u64 },
    /// DFU status read after a chunk or during finalize.
    StatusPolled {
        attempt: u32,
        status: u8,
        state: DfuState,
    },
    /// Command string delivered.
    CommandSent { command: String },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { kind: ErrorKind, message: String },
    /// Buffer transfer finished.
    Complete { bytes_sent: u64 },
}

/// Observer trait for receiving engine events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            DfuEvent::ChunkSent { index, length } => {
                tracing::trace!(index, length, "Chunk sent");
            }
            DfuEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(progress = %format!("{}%", pct), current, total, "Progress");
            }
            DfuEvent::StatusPolled {
                attempt,
                status,
                state,
            } => {
                tracing::trace!(attempt, status, state = %state, "Status polled");
            }
            DfuEvent::CommandSent { command } => {
                tracing::info!(command = %command, "Command sent");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::Error { kind, message } => {
                tracing::error!(kind = %kind, "Error: {}", message);
            }
            DfuEvent::Complete { bytes_sent } => {
                tracing::info!(bytes_sent, "Transfer complete");
            }
        }
    }
}

/// Observer that records every event, for tests and scripted front ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
