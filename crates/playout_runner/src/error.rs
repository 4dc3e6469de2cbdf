// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for the runner.

use playout_conductor::ConductorError;
use playout_timeline::ResolveError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or running a show
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The show file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Show file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The show file is not valid RON
    #[error("Invalid RON show file: {0}")]
    Ron(#[from] ron::error::SpannedError),

    /// The show file is not valid JSON
    #[error("Invalid JSON show file: {0}")]
    Json(#[from] serde_json::Error),

    /// The file extension is neither `.ron` nor `.json`
    #[error("Unknown show file format: {0}")]
    UnknownFormat(PathBuf),

    /// The show refers to a device that is not configured
    #[error("Layer \"{layer}\" maps to unknown device \"{device_id}\"")]
    UnknownDevice {
        /// Mapped layer
        layer: String,
        /// Missing device
        device_id: String,
    },

    /// The timeline does not resolve
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The conductor failed
    #[error(transparent)]
    Conductor(#[from] ConductorError),

    /// Waiting for ctrl-c failed
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(std::io::Error),
}

/// Result type for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;
