// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registry.
//!
//! The registry owns device metadata. The bridge only reads it, through the
//! [`DeviceRegistry`] trait; [`DeviceCatalog`] is the JSON file implementation
//! used by the service binary.

mod catalog;

pub use catalog::DeviceCatalog;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Suffix of the topic a device listens on for commands.
pub const COMMAND_SUFFIX: &str = "command";

/// Suffix of the topic a device reports its status on.
pub const STATUS_SUFFIX: &str = "status";

/// Suffix of the topic carrying a device's numeric level.
pub const VALUE_SUFFIX: &str = "value";

/// A device known to the registry.
///
/// Fields the bridge does not use are preserved in `extra`, so a catalog can
/// be loaded and saved without losing data.
///
/// # Examples
///
/// ```
/// use iot_bridge::registry::Device;
///
/// let device = Device::new("thermo", "iot/device/thermo")
///     .with_value_topic("temperature", "value/temperature");
///
/// assert_eq!(device.command_topic(), "iot/device/thermo/command");
/// assert_eq!(
///     device.state_topics(),
///     vec!["iot/device/thermo/status", "iot/device/thermo/value/temperature"]
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique device ID.
    pub id: String,
    /// Base topic prefix, usually `iot/device/<id>`.
    pub topic: String,
    /// Value name to topic suffix.
    #[serde(
        rename = "valueTopics",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub value_topics: BTreeMap<String, String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Device kind (`light`, `sensor`, ...).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Any other fields from the catalog.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    /// Creates a device with no value topics.
    #[must_use]
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            value_topics: BTreeMap::new(),
            name: None,
            kind: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Adds a value topic.
    #[must_use]
    pub fn with_value_topic(mut self, name: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.value_topics.insert(name.into(), suffix.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns `<topic>/command`.
    #[must_use]
    pub fn command_topic(&self) -> String {
        self.subtopic(COMMAND_SUFFIX)
    }

    /// Returns `<topic>/status`.
    #[must_use]
    pub fn status_topic(&self) -> String {
        self.subtopic(STATUS_SUFFIX)
    }

    /// Returns `<topic>/value`.
    #[must_use]
    pub fn value_topic(&self) -> String {
        self.subtopic(VALUE_SUFFIX)
    }

    /// Returns the topics the bridge subscribes to for this device: the
    /// status topic followed by one topic per value topic entry.
    #[must_use]
    pub fn state_topics(&self) -> Vec<String> {
        std::iter::once(self.status_topic())
            .chain(self.value_topics.values().map(|suffix| self.subtopic(suffix)))
            .collect()
    }

    fn subtopic(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.topic)
    }
}

/// Read access to device metadata.
pub trait DeviceRegistry: Send + Sync + 'static {
    /// Returns every registered device.
    fn list_devices(&self) -> Vec<Device>;

    /// Returns one device by ID.
    fn get_device(&self, id: &str) -> Option<Device>;
}
