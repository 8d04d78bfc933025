// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device state tracking.
//!
//! [`UpdateInstruction`]s produced by the topic router are applied to the
//! [`DeviceStateStore`], which keeps one [`DeviceStatus`] per known device.
//!
//! # Examples
//!
//! ```
//! use iot_bridge::state::{DeviceStateStore, UpdateInstruction};
//!
//! let store = DeviceStateStore::new();
//! store.apply(&UpdateInstruction::value("thermo", "temperature", "21.5"));
//!
//! let status = store.get("thermo").unwrap();
//! assert_eq!(status.value("temperature"), Some("21.5"));
//! ```

mod device_status;
mod store;
mod update;

pub use device_status::DeviceStatus;
pub use store::DeviceStateStore;
pub use update::{DeviceUpdate, UpdateInstruction};
