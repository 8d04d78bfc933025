// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the bridge.
//!
//! Failures inside the crate are typed and propagated with `?`. The public
//! bridge surface converts them into logged events plus boolean or optional
//! results, because bus connectivity is best-effort and must never take the
//! serving process down.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Error talking to the message bus.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error loading or modifying the device catalog.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error loading service settings.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by the bus transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The MQTT client rejected a request.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not accept the connection in time.
    #[error("connection timed out after {0} ms")]
    Timeout(u64),

    /// Invalid broker address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No live connection to the broker.
    #[error("not connected to the broker")]
    NotConnected,

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors raised by the JSON device catalog.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Reading or writing the catalog file failed.
    #[error("catalog I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The catalog file is not valid JSON.
    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A device with this ID already exists.
    #[error("device {0} already exists")]
    DuplicateDevice(String),

    /// No device with this ID exists.
    #[error("device {0} not found")]
    DeviceNotFound(String),
}

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the settings file failed.
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file is not valid JSON.
    #[error("settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A setting has an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// The setting or environment variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::Timeout(5000);
        assert_eq!(err.to_string(), "connection timed out after 5000 ms");
    }

    #[test]
    fn error_from_registry_error() {
        let err: Error = RegistryError::DeviceNotFound("lamp1".to_string()).into();
        assert!(matches!(err, Error::Registry(RegistryError::DeviceNotFound(_))));
        assert_eq!(err.to_string(), "registry error: device lamp1 not found");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "MQTT_PORT".to_string(),
            message: "not a number".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value for MQTT_PORT: not a number");
    }
}
