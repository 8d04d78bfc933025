// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `iot_bridge` - MQTT client and device state synchronization for an
//! HTTP-to-IoT bridge.
//!
//! The bridge keeps one connection to an MQTT broker, subscribes to the state
//! topics of every known device, and tracks what each device last reported.
//! HTTP handlers read that state and send commands through [`IotBridge`].
//!
//! # Features
//!
//! - **Connection lifecycle**: bounded connect, clean disconnect, automatic
//!   reconnection with exponential backoff after an unexpected loss
//! - **Subscriptions**: recorded while offline and restored on every connect
//! - **Device state**: `online`, `lastSeen`, raw status and named values,
//!   updated from `iot/device/<id>/...` topics
//! - **Commands**: text or JSON commands, plus an on/off level helper
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use iot_bridge::{Command, IotBridge};
//! use iot_bridge::protocol::{BusClient, MqttTransport};
//! use iot_bridge::registry::DeviceCatalog;
//!
//! #[tokio::main]
//! async fn main() -> iot_bridge::Result<()> {
//!     let catalog = Arc::new(DeviceCatalog::load_or_create("static/config/devices.json").await?);
//!     let transport = MqttTransport::builder()
//!         .host("192.168.1.50")
//!         .credentials("bridge", "secret")
//!         .build()?;
//!
//!     let bridge = IotBridge::new(BusClient::builder(transport).build(), catalog);
//!     if !bridge.connect().await {
//!         bridge.bus().connect_in_background();
//!     }
//!
//!     bridge.send_command("kitchen_light", &Command::from("on")).await;
//!     if let Some(status) = bridge.get_device_status("kitchen_light") {
//!         println!("kitchen light online: {}", status.online);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Raw bus access
//!
//! ```no_run
//! use iot_bridge::protocol::{BusClient, MqttTransport};
//!
//! # async fn example() -> iot_bridge::Result<()> {
//! let bus = BusClient::builder(MqttTransport::from_url("mqtt://localhost:1883")?).build();
//!
//! bus.subscribe_with("home/+/alarm", |payload, topic| {
//!     println!("alarm on {topic}: {payload}");
//! })
//! .await;
//!
//! bus.connect().await;
//! # Ok(())
//! # }
//! ```

mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod state;

pub use bridge::IotBridge;
pub use command::{Command, CommandDispatcher, LevelOutcome};
pub use config::Settings;
pub use error::{ConfigError, Error, ProtocolError, RegistryError, Result};
pub use protocol::{BusClient, BusClientBuilder, ConnectionState, ReconnectionPolicy};
pub use registry::{Device, DeviceCatalog, DeviceRegistry};
pub use state::{DeviceStateStore, DeviceStatus, DeviceUpdate, UpdateInstruction};
