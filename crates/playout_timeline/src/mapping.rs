// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layer to device mappings.

use crate::object::DeviceType;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Binding of a layer to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Type of the target device
    pub device: DeviceType,
    /// Target device ID
    pub device_id: String,
    /// Device specific options (sub-target, channel, ...)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl Mapping {
    /// Map to a device
    pub fn new(device: DeviceType, device_id: impl Into<String>) -> Self {
        Self {
            device,
            device_id: device_id.into(),
            options: Value::Null,
        }
    }

    /// Set the device options
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// Layer name -> mapping
pub type Mappings = IndexMap<String, Mapping>;

/// Only the mappings that point at `device_id`
pub fn mappings_for_device(mappings: &Mappings, device_id: &str) -> Mappings {
    mappings
        .iter()
        .filter(|(_, m)| m.device_id == device_id)
        .map(|(layer, m)| (layer.clone(), m.clone()))
        .collect()
}
