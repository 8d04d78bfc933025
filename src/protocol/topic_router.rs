// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic routing for device state messages.
//!
//! Devices report their state under the `iot/device/<id>` namespace:
//!
//! ```text
//! iot/device/kitchen_light/status            → on
//!                     ↓
//!              route(topic, payload)
//!                     ↓
//!     UpdateInstruction { kitchen_light, Status("on") }
//!
//! iot/device/living_room/value/temperature   → 21.5
//!                     ↓
//!     UpdateInstruction { living_room, Value { temperature, "21.5" } }
//! ```
//!
//! The bus may carry traffic this bridge does not own, so anything outside the
//! namespace is ignored rather than reported as an error.

use crate::state::{DeviceUpdate, UpdateInstruction};

/// First topic segment of the device namespace.
pub const NAMESPACE_ROOT: &str = "iot";

/// Second topic segment of the device namespace.
pub const NAMESPACE_KIND: &str = "device";

/// Maps a bus message to a device state update.
///
/// Returns `None` for topics outside `iot/device/<id>`. This function has no
/// side effects.
///
/// # Examples
///
/// ```
/// use iot_bridge::protocol::route;
/// use iot_bridge::state::UpdateInstruction;
///
/// let update = route("iot/device/lamp1/status", "on");
/// assert_eq!(update, Some(UpdateInstruction::status("lamp1", "on")));
///
/// assert_eq!(route("zigbee2mqtt/bridge/state", "online"), None);
/// ```
#[must_use]
pub fn route(topic: &str, payload: &str) -> Option<UpdateInstruction> {
    let Some(parsed) = ParsedTopic::parse(topic) else {
        tracing::trace!(topic = %topic, "Ignoring topic outside device namespace");
        return None;
    };

    let update = match parsed.rest.as_slice() {
        ["status", ..] => DeviceUpdate::Status(payload.to_string()),
        ["value", name, ..] if !name.is_empty() => DeviceUpdate::Value {
            name: (*name).to_string(),
            payload: payload.to_string(),
        },
        _ => DeviceUpdate::Seen,
    };

    Some(UpdateInstruction {
        device_id: parsed.device_id.to_string(),
        update,
    })
}

/// Parsed device topic components.
#[derive(Debug)]
struct ParsedTopic<'a> {
    /// The device ID (third segment).
    device_id: &'a str,
    /// Segments after the device ID.
    rest: Vec<&'a str>,
}

impl<'a> ParsedTopic<'a> {
    /// Parses a topic of the form `iot/device/<id>[/...]`.
    fn parse(topic: &'a str) -> Option<Self> {
        let mut parts = topic.split('/');
        let (root, kind, device_id) = (parts.next()?, parts.next()?, parts.next()?);

        if root != NAMESPACE_ROOT || kind != NAMESPACE_KIND || device_id.is_empty() {
            return None;
        }

        Some(Self {
            device_id,
            rest: parts.collect(),
        })
    }
}
