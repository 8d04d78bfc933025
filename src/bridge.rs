// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bridge facade handed to the HTTP layer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::{Command, CommandDispatcher, LevelOutcome};
use crate::protocol::{BusClient, Transport};
use crate::registry::{Device, DeviceRegistry};
use crate::state::{DeviceStateStore, DeviceStatus};

/// Ties the device registry, the bus client and the state store together.
///
/// Creating a bridge registers every known device in the state store and
/// records its state topics for subscription; [`connect`](Self::connect)
/// activates them. Registry changes made afterwards are reported through
/// [`device_added`](Self::device_added) and
/// [`device_removed`](Self::device_removed).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use iot_bridge::{IotBridge, Command};
/// use iot_bridge::protocol::{BusClient, MqttTransport};
/// use iot_bridge::registry::DeviceCatalog;
///
/// # async fn example() -> iot_bridge::Result<()> {
/// let catalog = Arc::new(DeviceCatalog::load_or_create("static/config/devices.json").await?);
/// let bus = BusClient::builder(MqttTransport::from_url("mqtt://localhost:1883")?).build();
///
/// let bridge = IotBridge::new(bus, catalog);
/// if bridge.connect().await {
///     bridge.send_command("lamp1", &Command::from("on")).await;
/// }
///
/// for (id, status) in bridge.get_all_devices_status() {
///     println!("{id}: online={}", status.online);
/// }
/// # Ok(())
/// # }
/// ```
pub struct IotBridge<T: Transport, R: DeviceRegistry> {
    bus: BusClient<T>,
    registry: Arc<R>,
    dispatcher: CommandDispatcher<T, R>,
}

impl<T: Transport, R: DeviceRegistry> IotBridge<T, R> {
    /// Creates a bridge over an existing bus client and registry.
    #[must_use]
    pub fn new(bus: BusClient<T>, registry: Arc<R>) -> Self {
        let dispatcher = CommandDispatcher::new(bus.clone(), Arc::clone(&registry));
        let bridge = Self {
            bus,
            registry,
            dispatcher,
        };

        for device in bridge.registry.list_devices() {
            bridge.bus.state_store().register(device.id.as_str());
            for topic in device.state_topics() {
                bridge.bus.track_topic(topic);
            }
        }

        bridge
    }

    /// Connects to the broker after re-reading the registry.
    ///
    /// Returns `true` once connected; see [`BusClient::connect`].
    pub async fn connect(&self) -> bool {
        self.sync_devices().await;
        self.bus.connect().await
    }

    /// Disconnects from the broker; no reconnection is attempted afterwards.
    pub async fn disconnect(&self) {
        self.bus.disconnect().await;
    }

    /// Returns whether the bus client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    /// Returns a snapshot of every device's status.
    #[must_use]
    pub fn get_all_devices_status(&self) -> HashMap<String, DeviceStatus> {
        self.bus.devices_status()
    }

    /// Returns a snapshot of one device's status.
    #[must_use]
    pub fn get_device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.bus.state_store().get(device_id)
    }

    /// Publishes a command to a device. See [`CommandDispatcher::send_command`].
    pub async fn send_command(&self, device_id: &str, command: &Command) -> bool {
        self.dispatcher.send_command(device_id, command).await
    }

    /// Sets a device's level. See [`CommandDispatcher::send_level`].
    pub async fn send_level(&self, device_id: &str, raw: &str) -> Option<LevelOutcome> {
        self.dispatcher.send_level(device_id, raw).await
    }

    /// Registers every registry device and subscribes to its state topics.
    ///
    /// Existing state entries are kept. Returns `false` if any subscription
    /// failed; failed topics stay recorded for the next connect.
    pub async fn sync_devices(&self) -> bool {
        let devices = self.registry.list_devices();
        tracing::debug!(count = devices.len(), "Synchronizing devices");

        let mut all_ok = true;
        for device in &devices {
            all_ok &= self.device_added(device).await;
        }
        all_ok
    }

    /// Starts tracking a device added to the registry.
    pub async fn device_added(&self, device: &Device) -> bool {
        self.bus.state_store().register(device.id.as_str());

        let mut all_ok = true;
        for topic in device.state_topics() {
            all_ok &= self.bus.subscribe(topic).await;
        }
        all_ok
    }

    /// Stops tracking a device removed from the registry.
    pub async fn device_removed(&self, device: &Device) -> bool {
        tracing::info!(device = %device.id, "Removing device");
        self.bus.state_store().remove(&device.id);

        let mut all_ok = true;
        for topic in device.state_topics() {
            all_ok &= self.bus.unsubscribe(&topic).await;
        }
        all_ok
    }

    /// Returns the bus client.
    #[must_use]
    pub fn bus(&self) -> &BusClient<T> {
        &self.bus
    }

    /// Returns the device registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Returns the device state store.
    #[must_use]
    pub fn state_store(&self) -> &DeviceStateStore {
        self.bus.state_store()
    }
}

impl<T: Transport, R: DeviceRegistry> std::fmt::Debug for IotBridge<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IotBridge")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}
