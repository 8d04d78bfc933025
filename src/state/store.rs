// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory device state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{DeviceStatus, DeviceUpdate, UpdateInstruction};

/// Table of device ID to last known [`DeviceStatus`].
///
/// The store is cheaply cloneable; clones share the same table. Reads take a
/// shared lock and return snapshots, so HTTP handlers can read while the bus
/// receive path writes. Updates coming from the bus go through a single writer
/// task (see [`DeviceStateStore::spawn_writer`]).
///
/// # Examples
///
/// ```
/// use iot_bridge::state::{DeviceStateStore, DeviceUpdate};
///
/// let store = DeviceStateStore::new();
/// store.register("lamp1");
/// store.apply_update("lamp1", &DeviceUpdate::Status("on".to_string()));
///
/// let status = store.get("lamp1").unwrap();
/// assert!(status.online);
/// assert_eq!(status.status.as_deref(), Some("on"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeviceStateStore {
    entries: Arc<RwLock<HashMap<String, DeviceStatus>>>,
}

impl DeviceStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an offline entry for a newly registered device.
    ///
    /// Returns `false` if the device already had an entry, which is kept as is.
    pub fn register(&self, device_id: impl Into<String>) -> bool {
        let device_id = device_id.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&device_id) {
            return false;
        }
        tracing::debug!(device = %device_id, "Registering device status");
        entries.insert(device_id, DeviceStatus::new());
        true
    }

    /// Removes the entry of a deregistered device.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, device_id: &str) -> bool {
        tracing::debug!(device = %device_id, "Removing device status");
        self.entries.write().remove(device_id).is_some()
    }

    /// Applies an update to a device.
    ///
    /// Unknown devices get a fresh entry: registration and the first message
    /// from a device can race, and the message must not be lost.
    pub fn apply_update(&self, device_id: &str, update: &DeviceUpdate) {
        let now = Utc::now();
        let mut entries = self.entries.write();
        match entries.get_mut(device_id) {
            Some(status) => status.apply_at(update, now),
            None => {
                tracing::debug!(device = %device_id, "Creating status for unregistered device");
                let mut status = DeviceStatus::seen_at(now);
                status.apply_at(update, now);
                entries.insert(device_id.to_string(), status);
            }
        }
    }

    /// Applies a routed instruction.
    pub fn apply(&self, instruction: &UpdateInstruction) {
        self.apply_update(&instruction.device_id, &instruction.update);
    }

    /// Returns a snapshot of one device's status.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<DeviceStatus> {
        self.entries.read().get(device_id).cloned()
    }

    /// Returns a snapshot of every device's status.
    #[must_use]
    pub fn get_all(&self) -> HashMap<String, DeviceStatus> {
        self.entries.read().clone()
    }

    /// Returns the number of tracked devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no device is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the IDs of online devices silent for longer than `max_age`.
    ///
    /// This is a read-only query: the store never marks devices offline by
    /// itself.
    #[must_use]
    pub fn stale_devices(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut stale: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, status)| status.is_stale(now, max_age))
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Spawns the task that applies bus updates to this store.
    ///
    /// The returned sender is the only way the receive path mutates device
    /// state. The task ends when every sender has been dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn_writer(&self, capacity: usize) -> mpsc::Sender<UpdateInstruction> {
        let (tx, mut rx) = mpsc::channel::<UpdateInstruction>(capacity);
        let store = self.clone();

        tokio::spawn(async move {
            tracing::debug!("Starting device state writer");
            while let Some(instruction) = rx.recv().await {
                tracing::trace!(
                    device = %instruction.device_id,
                    update = ?instruction.update,
                    "Applying device update"
                );
                store.apply(&instruction);
            }
            tracing::debug!("Device state writer stopped");
        });

        tx
    }
}
