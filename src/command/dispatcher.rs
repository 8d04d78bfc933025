// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation of device control requests into bus publishes.

use std::sync::Arc;

use crate::protocol::{BusClient, Transport};
use crate::registry::DeviceRegistry;

use super::Command;

/// Result of [`CommandDispatcher::send_level`].
///
/// The two publishes are attempted independently, so either may fail alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelOutcome {
    /// Whether the `on`/`off` status publish was accepted.
    pub status_sent: bool,
    /// Whether the level value publish was accepted.
    pub value_sent: bool,
}

impl LevelOutcome {
    /// Returns `true` if both publishes were accepted.
    #[must_use]
    pub fn is_complete(self) -> bool {
        self.status_sent && self.value_sent
    }
}

/// Publishes device commands, resolving topics through the registry.
pub struct CommandDispatcher<T: Transport, R: DeviceRegistry> {
    bus: BusClient<T>,
    registry: Arc<R>,
}

impl<T: Transport, R: DeviceRegistry> Clone for CommandDispatcher<T, R> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Transport, R: DeviceRegistry> CommandDispatcher<T, R> {
    /// Creates a dispatcher publishing through `bus`.
    #[must_use]
    pub fn new(bus: BusClient<T>, registry: Arc<R>) -> Self {
        Self { bus, registry }
    }

    /// Publishes a command to `<device topic>/command`.
    ///
    /// Returns `false` if the device is unknown or the publish failed.
    pub async fn send_command(&self, device_id: &str, command: &Command) -> bool {
        let Some(device) = self.registry.get_device(device_id) else {
            tracing::warn!(device = %device_id, "Cannot send command: unknown device");
            return false;
        };

        let topic = device.command_topic();
        let payload = command.to_payload();
        tracing::debug!(device = %device_id, topic = %topic, "Sending command");

        self.bus.publish(&topic, &payload).await
    }

    /// Sets a device's level from a numeric string.
    ///
    /// Zero publishes `off` to `<topic>/status`, any other number `on`; the
    /// number is then published to `<topic>/value`. Returns `None` if `raw`
    /// is not a finite number or the device is unknown.
    pub async fn send_level(&self, device_id: &str, raw: &str) -> Option<LevelOutcome> {
        let Some(level) = parse_level(raw) else {
            tracing::warn!(device = %device_id, value = %raw, "Ignoring non-numeric level");
            return None;
        };

        let Some(device) = self.registry.get_device(device_id) else {
            tracing::warn!(device = %device_id, "Cannot set level: unknown device");
            return None;
        };

        #[allow(clippy::float_cmp)]
        let status = if level == 0.0 { "off" } else { "on" };

        let status_sent = self.bus.publish(&device.status_topic(), status).await;
        let value_sent = self
            .bus
            .publish(&device.value_topic(), &level.to_string())
            .await;

        Some(LevelOutcome {
            status_sent,
            value_sent,
        })
    }
}

impl<T: Transport, R: DeviceRegistry> std::fmt::Debug for CommandDispatcher<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

fn parse_level(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
