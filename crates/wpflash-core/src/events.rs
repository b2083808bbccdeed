//! Event system for UI decoupling.
//!
//! CLI or GUI layers subscribe to flashing events without tight
//! coupling to the image models or protocol engines. Progress callbacks
//! are informational only and must never block a transfer loop.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// High-level phases of a servicing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Waiting for a device to enumerate.
    WaitingForDevice,
    /// Protocol handshake in progress.
    Handshake,
    /// Uploading a programmer/bootloader stage.
    ProgrammerUpload,
    /// Payload transfer (FFU chunks, partition data).
    Transfer,
    /// All operations complete.
    Complete,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::WaitingForDevice => write!(f, "Waiting for Device"),
            FlashPhase::Handshake => write!(f, "Handshake"),
            FlashPhase::ProgrammerUpload => write!(f, "Programmer Upload"),
            FlashPhase::Transfer => write!(f, "Transfer"),
            FlashPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted by the image models and protocol engines.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Progress update, in the unit of the current operation
    /// (sectors for partition streaming, chunks for FFU transfer).
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// All operations completed successfully.
    Complete,
}

/// Observer trait for receiving flash events.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that forwards events to `tracing`.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{pct}%"), "Progress");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}
