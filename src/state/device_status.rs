// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device status tracking.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::DeviceUpdate;

/// Last known status of a device, as reported on the bus.
///
/// Every field holds raw payload text; no schema is imposed on what devices
/// publish. There is no "went offline" message in the protocol, so `online`
/// only ever becomes `true` through an update. Readers that need to detect
/// silent devices should compare `last_seen` against their own threshold, see
/// [`DeviceStatus::is_stale`].
///
/// # Examples
///
/// ```
/// use iot_bridge::state::{DeviceStatus, DeviceUpdate};
///
/// let mut status = DeviceStatus::new();
/// assert!(!status.online);
///
/// status.apply(&DeviceUpdate::Status("on".to_string()));
/// assert!(status.online);
/// assert_eq!(status.status.as_deref(), Some("on"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Whether the device has reported since it was registered.
    pub online: bool,
    /// When the device last published anything.
    pub last_seen: Option<DateTime<Utc>>,
    /// Last raw status payload.
    pub status: Option<String>,
    /// Last raw payload per value name.
    pub values: HashMap<String, String>,
}

impl DeviceStatus {
    /// Creates the status of a registered device that has not reported yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the status of a device first seen at `now`.
    #[must_use]
    pub fn seen_at(now: DateTime<Utc>) -> Self {
        Self {
            online: true,
            last_seen: Some(now),
            ..Self::default()
        }
    }

    /// Applies an update received now.
    pub fn apply(&mut self, update: &DeviceUpdate) {
        self.apply_at(update, Utc::now());
    }

    /// Applies an update received at `now`.
    ///
    /// Every update marks the device online and refreshes `last_seen` before
    /// touching its specific field.
    pub fn apply_at(&mut self, update: &DeviceUpdate, now: DateTime<Utc>) {
        self.online = true;
        self.last_seen = Some(now);

        match update {
            DeviceUpdate::Status(payload) => self.status = Some(payload.clone()),
            DeviceUpdate::Value { name, payload } => {
                self.values.insert(name.clone(), payload.clone());
            }
            DeviceUpdate::Seen => {}
        }
    }

    /// Returns the last payload reported for a value name.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns `true` if the device was online but has been silent for longer
    /// than `max_age` at `now`.
    ///
    /// Devices that never reported are not stale; they are simply offline.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(last_seen) = self.last_seen else {
            return false;
        };
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        self.online && now.signed_duration_since(last_seen) > max_age
    }
}
