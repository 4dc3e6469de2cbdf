// SPDX-License-Identifier: MIT OR Apache-2.0
//! Show files: everything the conductor needs to play a programme.
//!
//! A show bundles options, devices, mappings, the timeline and the initial
//! datastore. Files are RON (`.ron`) or JSON (`.json`).

use crate::error::{Result, RunnerError};
use indexmap::IndexMap;
use playout_conductor::{ConductorOptions, Datastore, DeviceOptions};
use playout_timeline::{timeline_size, Mappings, TimelineObject};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A complete show description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowFile {
    /// Conductor options
    pub options: ConductorOptions,
    /// Device ID -> device configuration
    pub devices: IndexMap<String, DeviceOptions>,
    /// Layer -> device mappings
    pub mappings: Mappings,
    /// Timeline objects
    pub timeline: Vec<TimelineObject>,
    /// Initial datastore
    pub datastore: Datastore,
}

impl ShowFile {
    /// Load a show from disk, picking the format by extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| RunnerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let show = match path.extension().and_then(|e| e.to_str()) {
            Some("ron") => Self::from_ron(&content)?,
            Some("json") => Self::from_json(&content)?,
            _ => return Err(RunnerError::UnknownFormat(path.to_path_buf())),
        };
        tracing::debug!(path = %path.display(), objects = show.timeline.len(), "show loaded");
        Ok(show)
    }

    /// Parse a RON show
    pub fn from_ron(content: &str) -> Result<Self> {
        Ok(ron::from_str(content)?)
    }

    /// Parse a JSON show
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Check that every mapping targets a configured device
    pub fn validate(&self) -> Result<()> {
        for (layer, mapping) in &self.mappings {
            if !self.devices.contains_key(&mapping.device_id) {
                return Err(RunnerError::UnknownDevice {
                    layer: layer.clone(),
                    device_id: mapping.device_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Objects, nested children and keyframes in the timeline
    pub fn size(&self) -> usize {
        timeline_size(&self.timeline)
    }
}
