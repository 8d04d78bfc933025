// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device commands.
//!
//! A [`Command`] is published to the device's command topic
//! (`<topic>/command`). The [`CommandDispatcher`] resolves the topic through
//! the device registry and publishes through the bus client.
//!
//! # Command payloads
//!
//! | Command | Payload |
//! |---------|---------|
//! | `Command::Text("on")` | `on` |
//! | `Command::Structured({"brightness": 80})` | `{"brightness":80}` |
//!
//! # Examples
//!
//! ```
//! use iot_bridge::command::Command;
//! use serde_json::json;
//!
//! assert_eq!(Command::from("toggle").to_payload(), "toggle");
//!
//! let cmd = Command::from(json!({"mode": "auto", "target": 21.5}));
//! assert_eq!(cmd.to_payload(), r#"{"mode":"auto","target":21.5}"#);
//! ```

mod dispatcher;

pub use dispatcher::{CommandDispatcher, LevelOutcome};

use serde::{Deserialize, Serialize};

/// A command sent to a device.
///
/// Deserializes from either a JSON string or a JSON object, which is what
/// HTTP clients send in the `command` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// Opaque text, published verbatim.
    Text(String),
    /// Structured command, published as compact JSON.
    Structured(serde_json::Map<String, serde_json::Value>),
}

impl Command {
    /// Returns the text published on the command topic.
    #[must_use]
    pub fn to_payload(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(map) => serde_json::Value::Object(map.clone()).to_string(),
        }
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<serde_json::Value> for Command {
    /// Objects become structured commands; strings are kept as text; any other
    /// JSON value is published in its JSON text form.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self::Structured(map),
            serde_json::Value::String(text) => Self::Text(text),
            other => Self::Text(other.to_string()),
        }
    }
}
