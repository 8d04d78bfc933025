// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Service settings.
//!
//! Settings are read from the JSON file named by `IOT_BRIDGE_CONFIG` (all
//! fields optional), then overridden by environment variables:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `MQTT_BROKER` | `broker.host` |
//! | `MQTT_PORT` | `broker.port` |
//! | `MQTT_USER` | `broker.username` |
//! | `MQTT_PASSWORD` | `broker.password` |
//! | `IOT_DEVICES_FILE` | `devices_file` |
//! | `IOT_LOG` | `log_filter` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::ReconnectionPolicy;

/// Environment variable naming the settings file.
pub const CONFIG_PATH_VAR: &str = "IOT_BRIDGE_CONFIG";

/// Top-level service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker connection.
    pub broker: BrokerSettings,
    /// Path of the JSON device catalog.
    pub devices_file: PathBuf,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Bound on the initial connect, in seconds.
    pub connect_timeout_secs: u64,
    /// Reconnection after an unexpected disconnect.
    pub reconnect: ReconnectSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            devices_file: PathBuf::from("static/config/devices.json"),
            log_filter: "info".to_string(),
            connect_timeout_secs: 5,
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Username, used only together with `password`.
    pub username: Option<String>,
    /// Password, used only together with `username`.
    pub password: Option<String>,
    /// MQTT keep-alive interval, in seconds.
    pub keep_alive_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 60,
        }
    }
}

/// Reconnection settings, mapped onto [`ReconnectionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Whether to reconnect after an unexpected disconnect.
    pub enabled: bool,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first attempt, in seconds.
    pub initial_delay_secs: u64,
    /// Upper bound on the backoff delay, in seconds.
    pub max_delay_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: None,
            initial_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl Settings {
    /// Loads settings from `IOT_BRIDGE_CONFIG` (if set) and the environment.
    ///
    /// # Errors
    ///
    /// Returns error if the settings file cannot be read or parsed, or an
    /// environment variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Loads settings from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies overrides, looking each variable up with `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `MQTT_PORT` is not a port
    /// number.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "MQTT_PORT".to_string(),
                message: format!("{port:?} is not a port number"),
            })?;
        }
        if let Some(username) = lookup("MQTT_USER") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(path) = lookup("IOT_DEVICES_FILE") {
            self.devices_file = PathBuf::from(path);
        }
        if let Some(filter) = lookup("IOT_LOG") {
            self.log_filter = filter;
        }
        Ok(())
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the reconnection policy.
    #[must_use]
    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        if !self.reconnect.enabled {
            return ReconnectionPolicy::disabled();
        }

        let policy = ReconnectionPolicy::new()
            .with_initial_delay(Duration::from_secs(self.reconnect.initial_delay_secs))
            .with_max_delay(Duration::from_secs(self.reconnect.max_delay_secs));

        match self.reconnect.max_retries {
            Some(max) => policy.with_max_retries(max),
            None => policy.with_infinite_retries(),
        }
    }

    /// Builds the MQTT transport.
    ///
    /// Credentials are used only when both a user and a password are set.
    ///
    /// # Errors
    ///
    /// Returns error if the broker host is empty or the keep-alive is zero.
    #[cfg(feature = "mqtt")]
    pub fn mqtt_transport(
        &self,
    ) -> Result<crate::protocol::MqttTransport, crate::error::ProtocolError> {
        let mut builder = crate::protocol::MqttTransport::builder()
            .host(self.broker.host.as_str())
            .port(self.broker.port)
            .keep_alive(Duration::from_secs(self.broker.keep_alive_secs));

        if let (Some(username), Some(password)) = (&self.broker.username, &self.broker.password) {
            builder = builder.credentials(username.as_str(), password.as_str());
        }

        builder.build()
    }
}
