// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport backed by `rumqttc`.
//!
//! # Examples
//!
//! ```no_run
//! use iot_bridge::protocol::{BusClient, MqttTransport};
//!
//! # async fn example() -> iot_bridge::Result<()> {
//! let transport = MqttTransport::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("user", "password")
//!     .build()?;
//!
//! let bus = BusClient::builder(transport).build();
//! if bus.connect().await {
//!     println!("Connected to MQTT broker");
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};

use crate::error::ProtocolError;

use super::transport::{DisconnectReason, EventStream, Link, Transport, TransportEvent};

/// Quality of service used for every publish and subscribe.
const QOS: QoS = QoS::AtLeastOnce;

/// Configuration for MQTT sessions.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(60),
            request_capacity: 64,
        }
    }
}

/// Opens MQTT sessions to one broker.
///
/// Every session uses a fresh client ID and a clean session; subscriptions
/// are restored by the bus client after each connect.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    config: MqttConfig,
}

impl MqttTransport {
    /// Creates a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> MqttTransportBuilder {
        MqttTransportBuilder::default()
    }

    /// Creates a transport from a broker URL such as `mqtt://host:1883`.
    ///
    /// The `mqtt://` and `tcp://` schemes are accepted; the port defaults to
    /// 1883.
    ///
    /// # Errors
    ///
    /// Returns error if the URL has no host or an invalid port.
    pub fn from_url(url: &str) -> Result<Self, ProtocolError> {
        let (host, port) = parse_broker_url(url)?;
        Self::builder().host(host).port(port).build()
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Returns whether authentication is configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.config.credentials.is_some()
    }
}

impl Transport for MqttTransport {
    type Link = MqttLink;
    type Events = MqttEvents;

    fn open(&self) -> Result<(MqttLink, MqttEvents), ProtocolError> {
        let client_id = format!("iot_bridge_{}", uuid::Uuid::new_v4().simple());

        let mut mqtt_options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some((ref username, ref password)) = self.config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, self.config.request_capacity);

        tracing::debug!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %client_id,
            "Opening MQTT session"
        );

        Ok((
            MqttLink { client },
            MqttEvents {
                event_loop,
                connected: false,
                finished: false,
            },
        ))
    }
}

/// Request side of an MQTT session.
#[derive(Debug, Clone)]
pub struct MqttLink {
    client: AsyncClient,
}

impl Link for MqttLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), ProtocolError> {
        self.client
            .publish(topic, QOS, false, payload)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        self.client
            .subscribe(topic, QOS)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.client.disconnect().await.map_err(ProtocolError::Mqtt)
    }
}

/// Event side of an MQTT session.
///
/// Polling stops at the first connection error: `rumqttc` would otherwise
/// reconnect on its own, bypassing the bus client's reconnection policy.
pub struct MqttEvents {
    event_loop: EventLoop,
    connected: bool,
    finished: bool,
}

impl std::fmt::Debug for MqttEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttEvents")
            .field("connected", &self.connected)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EventStream for MqttEvents {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    tracing::debug!(?connack, "MQTT connection acknowledged");
                    if connack.code == ConnectReturnCode::Success {
                        self.connected = true;
                        return Some(TransportEvent::Connected);
                    }
                    self.finished = true;
                    return Some(TransportEvent::Refused(format!("{:?}", connack.code)));
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    tracing::debug!(?suback, "MQTT subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match String::from_utf8(publish.payload.to_vec()) {
                        Ok(payload) => {
                            return Some(TransportEvent::Message {
                                topic: publish.topic,
                                payload,
                            });
                        }
                        Err(_) => {
                            tracing::warn!(topic = %publish.topic, "Dropping non-UTF-8 payload");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.finished = true;
                    return Some(TransportEvent::Disconnected(DisconnectReason::Unexpected(
                        "broker closed the session".to_string(),
                    )));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.finished = true;
                    return Some(TransportEvent::Disconnected(DisconnectReason::Normal));
                }
                Ok(_) => {}
                Err(e) => {
                    self.finished = true;
                    let reason = e.to_string();
                    return Some(if self.connected {
                        TransportEvent::Disconnected(DisconnectReason::Unexpected(reason))
                    } else {
                        TransportEvent::Refused(reason)
                    });
                }
            }
        }
    }
}

/// Builder for [`MqttTransport`].
#[derive(Debug, Default)]
pub struct MqttTransportBuilder {
    config: MqttConfig,
}

impl MqttTransportBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 60 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets how many requests may be queued per session (default: 64).
    #[must_use]
    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.config.request_capacity = capacity.max(1);
        self
    }

    /// Builds the transport. No connection is made until a session is opened.
    ///
    /// # Errors
    ///
    /// Returns error if the host is not set or the keep-alive is shorter than
    /// one second.
    pub fn build(self) -> Result<MqttTransport, ProtocolError> {
        if self.config.host.is_empty() {
            return Err(ProtocolError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }
        if self.config.keep_alive < Duration::from_secs(1) {
            return Err(ProtocolError::InvalidAddress(
                "MQTT keep-alive must be at least one second".to_string(),
            ));
        }
        Ok(MqttTransport {
            config: self.config,
        })
    }
}

/// Splits a broker URL into host and port.
fn parse_broker_url(url: &str) -> Result<(String, u16), ProtocolError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = if let Some((h, p)) = url.rsplit_once(':') {
        let port = p
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(format!("Invalid port: {p}")))?;
        (h.to_string(), port)
    } else {
        (url.to_string(), 1883)
    };

    if host.is_empty() {
        return Err(ProtocolError::InvalidAddress(
            "MQTT broker host is required".to_string(),
        ));
    }

    Ok((host, port))
}
