// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Update instructions produced by the topic router.
//!
//! An [`UpdateInstruction`] names a device and the single field a bus message
//! should change. Instructions are plain data: they are produced without side
//! effects and applied later by the state store's writer.
//!
//! # Examples
//!
//! ```
//! use iot_bridge::state::{DeviceUpdate, UpdateInstruction};
//!
//! let update = UpdateInstruction::status("kitchen_light", "on");
//! assert_eq!(update.device_id, "kitchen_light");
//! assert_eq!(update.update, DeviceUpdate::Status("on".to_string()));
//! ```

/// A change to one field of a device's status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeviceUpdate {
    /// The device reported its status token (`iot/device/<id>/status`).
    Status(String),

    /// The device reported a named value (`iot/device/<id>/value/<name>`).
    Value {
        /// The value name (e.g., `temperature`).
        name: String,
        /// The raw payload.
        payload: String,
    },

    /// The device published something under its namespace that carries no
    /// specific field. It still counts as a sign of life.
    Seen,
}

/// A state update addressed to a device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpdateInstruction {
    /// The device the update applies to.
    pub device_id: String,
    /// The field change to apply.
    pub update: DeviceUpdate,
}

impl UpdateInstruction {
    /// Creates a status update.
    #[must_use]
    pub fn status(device_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            update: DeviceUpdate::Status(payload.into()),
        }
    }

    /// Creates a named value update.
    #[must_use]
    pub fn value(
        device_id: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            update: DeviceUpdate::Value {
                name: name.into(),
                payload: payload.into(),
            },
        }
    }

    /// Creates a liveness-only update.
    #[must_use]
    pub fn seen(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            update: DeviceUpdate::Seen,
        }
    }
}
