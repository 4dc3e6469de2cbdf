// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for the conductor.

use playout_timeline::ResolveError;
use thiserror::Error;

/// Errors raised by device integrations
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The device is not connected
    #[error("Device not connected")]
    NotConnected,

    /// Creating the device failed
    #[error("Failed to create device: {0}")]
    Creation(String),

    /// A device operation did not finish in time
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Any other device failure
    #[error("{0}")]
    Failed(String),
}

/// Errors surfaced by the conductor
#[derive(Debug, Error)]
pub enum ConductorError {
    /// `init` was called twice
    #[error("Conductor is already initialized")]
    AlreadyInitialized,

    /// The worker task is gone
    #[error("Conductor has stopped")]
    Stopped,

    /// Resolving the timeline failed
    #[error("Resolve failed: {0}")]
    Resolve(#[from] ResolveError),

    /// A device failed
    #[error("Error in device \"{device_id}\": {source}")]
    Device {
        /// Device ID
        device_id: String,
        /// Underlying error
        #[source]
        source: DeviceError,
    },

    /// The off-thread resolver task failed
    #[error("Resolver task failed: {0}")]
    ResolverTask(String),
}

impl ConductorError {
    /// Wrap a device error
    pub fn device(device_id: impl Into<String>, source: DeviceError) -> Self {
        Self::Device {
            device_id: device_id.into(),
            source,
        }
    }
}

/// Result type for conductor operations
pub type Result<T> = std::result::Result<T, ConductorError>;
