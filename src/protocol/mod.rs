// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message bus protocol layer.
//!
//! This module connects the bridge to the publish/subscribe bus and turns
//! inbound traffic into device state updates.
//!
//! # Components
//!
//! - [`BusClient`]: connection lifecycle, publish/subscribe, reconnection
//! - [`route`]: maps `iot/device/<id>/...` topics to state updates
//! - [`ReconnectionPolicy`]: backoff schedule after an unexpected disconnect
//! - [`Transport`]: the seam beneath the client; [`MqttTransport`] is the
//!   production implementation

mod bus_client;
#[cfg(feature = "mqtt")]
mod mqtt;
mod reconnect;
mod subscription;
#[cfg(test)]
pub(crate) mod testing;
mod topic_router;
mod transport;

pub use bus_client::{BusClient, BusClientBuilder, BusConfig, ConnectionState};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttEvents, MqttLink, MqttTransport, MqttTransportBuilder};
pub use reconnect::ReconnectionPolicy;
pub use subscription::MessageHandler;
pub use topic_router::{NAMESPACE_KIND, NAMESPACE_ROOT, route};
pub use transport::{DisconnectReason, EventStream, Link, Transport, TransportEvent};
