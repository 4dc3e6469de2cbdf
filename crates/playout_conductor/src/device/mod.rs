// SPDX-License-Identifier: MIT OR Apache-2.0
//! Device integration surface.
//!
//! Device drivers are thin protocol clients living outside this crate. The
//! conductor only needs the capabilities in [`Device`]; connections are
//! created through a [`DeviceFactory`] and reconciled by the
//! [`DeviceRegistry`].

pub mod abstract_device;
pub mod registry;

pub use abstract_device::{AbstractCommand, AbstractCommandKind, AbstractDevice, AbstractDeviceFactory};
pub use registry::{DeviceConnection, DeviceRegistry};

use crate::error::DeviceError;
use async_trait::async_trait;
use playout_timeline::{DeviceType, Mappings, Time, TimelineState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Desired configuration of one device connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    /// Kind of device
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Log every command
    #[serde(default)]
    pub debug: bool,
    /// Log every state
    #[serde(default)]
    pub debug_state: bool,
    /// Disabled devices are not connected
    #[serde(default)]
    pub disable: bool,
    /// Driver specific options (host, port, ...)
    #[serde(default)]
    pub options: Value,
}

impl DeviceOptions {
    /// Options for a device type
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            debug: false,
            debug_state: false,
            disable: false,
            options: Value::Null,
        }
    }

    /// Whether two configs differ in more than the debug flags
    pub fn differs_beyond_debug(&self, other: &DeviceOptions) -> bool {
        self.device_type != other.device_type || self.disable != other.disable || self.options != other.options
    }

    /// Whether the debug flags differ
    pub fn debug_flags_differ(&self, other: &DeviceOptions) -> bool {
        self.debug != other.debug || self.debug_state != other.debug_state
    }
}

/// A connected device as seen by the conductor
#[async_trait]
pub trait Device: Send + Sync {
    /// Kind of device
    fn device_type(&self) -> DeviceType;

    /// A new state for `time` is about to be handed over
    async fn prepare_for_handle_state(&self, _time: Time) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Take over the state for this device; it is only the device's layers
    async fn handle_state(&self, state: TimelineState, mappings: Mappings) -> Result<(), DeviceError>;

    /// Nothing is scheduled after `time`; drop queued commands past it
    async fn clear_future(&self, _time: Time) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Prepare for going on air
    async fn make_ready(&self, _ok_to_destroy: bool, _activation_id: Option<String>) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Go off air
    async fn stand_down(&self, _ok_to_destroy: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Change logging verbosity
    fn set_debug_logging(&self, _debug: bool, _debug_state: bool) {}

    /// Close the connection
    async fn terminate(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Creates device connections from configuration
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Connect to a device
    async fn create_device(&self, device_id: &str, options: &DeviceOptions) -> Result<Arc<dyn Device>, DeviceError>;
}
