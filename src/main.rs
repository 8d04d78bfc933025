// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge service: connects the device catalog to the MQTT broker and keeps
//! device state in sync until interrupted.

use std::sync::Arc;

use iot_bridge::{BusClient, DeviceCatalog, DeviceRegistry, IotBridge, Settings};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> iot_bridge::Result<()> {
    let settings = Settings::from_env()?;
    init_tracing(&settings.log_filter);

    tracing::info!(
        host = %settings.broker.host,
        port = settings.broker.port,
        devices_file = %settings.devices_file.display(),
        "Starting IoT bridge"
    );

    let catalog = Arc::new(DeviceCatalog::load_or_create(&settings.devices_file).await?);
    tracing::info!(devices = catalog.list_devices().len(), "Device catalog ready");

    let bus = BusClient::builder(settings.mqtt_transport()?)
        .connect_timeout(settings.connect_timeout())
        .reconnection(settings.reconnection_policy())
        .build();

    let bridge = IotBridge::new(bus, catalog);
    if !bridge.connect().await {
        tracing::warn!("Broker unavailable, retrying in the background");
        bridge.bus().connect_in_background();
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down");
    bridge.disconnect().await;
    Ok(())
}
