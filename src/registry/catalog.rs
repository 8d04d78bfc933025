// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON file device catalog.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

use super::{Device, DeviceRegistry};

/// On-disk layout of the catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    devices: Vec<Device>,
    /// Rooms are owned by the UI; the catalog only carries them through.
    #[serde(default)]
    rooms: Vec<serde_json::Value>,
}

/// Device registry backed by a JSON file of the form
/// `{"devices": [...], "rooms": [...]}`.
///
/// Every mutation is written back to the file. If the write fails the
/// in-memory catalog is restored, so memory and disk never disagree.
///
/// # Examples
///
/// ```no_run
/// use iot_bridge::registry::{Device, DeviceCatalog, DeviceRegistry};
///
/// # async fn example() -> Result<(), iot_bridge::error::RegistryError> {
/// let catalog = DeviceCatalog::load_or_create("static/config/devices.json").await?;
/// catalog
///     .add_device(Device::new("lamp1", "iot/device/lamp1"))
///     .await?;
///
/// assert!(catalog.get_device("lamp1").is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DeviceCatalog {
    path: Option<PathBuf>,
    data: RwLock<CatalogFile>,
    /// Serializes mutate-then-save sequences.
    write_lock: tokio::sync::Mutex<()>,
}

impl DeviceCatalog {
    /// Creates an in-memory catalog that is never saved.
    #[must_use]
    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self::with_data(
            None,
            CatalogFile {
                devices,
                rooms: Vec::new(),
            },
        )
    }

    /// Loads an existing catalog file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not a valid catalog.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let data: CatalogFile = serde_json::from_str(&content)?;

        tracing::info!(
            path = %path.display(),
            devices = data.devices.len(),
            rooms = data.rooms.len(),
            "Loaded device catalog"
        );

        Ok(Self::with_data(Some(path.to_path_buf()), data))
    }

    /// Loads a catalog file, creating an empty one if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created, read, or parsed.
    pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();

        if !tokio::fs::try_exists(path).await? {
            tracing::info!(path = %path.display(), "Creating empty device catalog");
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let empty = serde_json::to_string_pretty(&CatalogFile::default())?;
            tokio::fs::write(path, empty).await?;
        }

        Self::open(path).await
    }

    /// Returns the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the rooms stored alongside the devices.
    #[must_use]
    pub fn rooms(&self) -> Vec<serde_json::Value> {
        self.data.read().rooms.clone()
    }

    /// Adds a device and saves the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateDevice`] if the ID is taken, or an
    /// I/O error if saving fails.
    pub async fn add_device(&self, device: Device) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;

        let previous = {
            let mut data = self.data.write();
            if data.devices.iter().any(|d| d.id == device.id) {
                return Err(RegistryError::DuplicateDevice(device.id));
            }
            let previous = data.clone();
            data.devices.push(device);
            previous
        };

        self.save_or_restore(previous).await
    }

    /// Replaces a device and saves the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DeviceNotFound`] if no device has this ID, or
    /// an I/O error if saving fails.
    pub async fn update_device(&self, id: &str, device: Device) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;

        let previous = {
            let mut data = self.data.write();
            let previous = data.clone();
            let Some(slot) = data.devices.iter_mut().find(|d| d.id == id) else {
                return Err(RegistryError::DeviceNotFound(id.to_string()));
            };
            *slot = device;
            previous
        };

        self.save_or_restore(previous).await
    }

    /// Removes a device, saves the catalog, and returns the removed device.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DeviceNotFound`] if no device has this ID, or
    /// an I/O error if saving fails.
    pub async fn remove_device(&self, id: &str) -> Result<Device, RegistryError> {
        let _guard = self.write_lock.lock().await;

        let (previous, removed) = {
            let mut data = self.data.write();
            let Some(index) = data.devices.iter().position(|d| d.id == id) else {
                return Err(RegistryError::DeviceNotFound(id.to_string()));
            };
            let previous = data.clone();
            let removed = data.devices.remove(index);
            (previous, removed)
        };

        self.save_or_restore(previous).await?;
        Ok(removed)
    }

    fn with_data(path: Option<PathBuf>, data: CatalogFile) -> Self {
        Self {
            path,
            data: RwLock::new(data),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn save_or_restore(&self, previous: CatalogFile) -> Result<(), RegistryError> {
        let result = self.save().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Failed to save device catalog, restoring previous state");
            *self.data.write() = previous;
        }
        result
    }

    async fn save(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(&*self.data.read())?;
        tokio::fs::write(path, content).await?;

        tracing::debug!(path = %path.display(), "Saved device catalog");
        Ok(())
    }
}

impl DeviceRegistry for DeviceCatalog {
    fn list_devices(&self) -> Vec<Device> {
        self.data.read().devices.clone()
    }

    fn get_device(&self, id: &str) -> Option<Device> {
        self.data.read().devices.iter().find(|d| d.id == id).cloned()
    }
}
