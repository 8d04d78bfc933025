// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message bus client.
//!
//! The [`BusClient`] owns the single broker connection and its lifecycle:
//!
//! ```text
//!                 connect()
//!  Disconnected ────────────► Connecting ──── Connected event ───► Connected
//!       ▲                         │                                  │
//!       │   refused / timeout     │                                  │
//!       ├─────────────────────────┘                                  │
//!       │                                                            │
//!       ├──── disconnect() ──────────────────────────────────────────┤
//!       │                                                            │
//!       └──── unexpected loss (reconnect loop armed) ◄───────────────┘
//! ```
//!
//! Each session has one receive task. It routes every inbound message to the
//! device state store (through the writer channel) and, independently, to the
//! handlers registered for the topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ProtocolError;
use crate::state::{DeviceStateStore, DeviceStatus, UpdateInstruction};

use super::reconnect::ReconnectionPolicy;
use super::subscription::{MessageHandler, SubscriptionTable};
use super::topic_router;
use super::transport::{DisconnectReason, EventStream, Link, Transport, TransportEvent};

/// Default bound on the wait in [`BusClient::connect`].
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the channel feeding the state store writer.
const DEFAULT_UPDATE_CAPACITY: usize = 256;

/// How long [`BusClient::disconnect`] lets the receive task flush the
/// disconnect request before aborting it.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Connection state of the bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport session.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Ready to publish and subscribe.
    Connected,
}

impl ConnectionState {
    /// Returns true if the client is connected.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Settings for a [`BusClient`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bound on the wait in [`BusClient::connect`].
    pub connect_timeout: Duration,
    /// Policy applied after an unexpected disconnect.
    pub reconnection: ReconnectionPolicy,
    /// Capacity of the state update channel.
    pub update_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnection: ReconnectionPolicy::default(),
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

/// Client for the publish/subscribe message bus.
///
/// `BusClient` is cheaply cloneable (via `Arc`); clones share the connection,
/// the subscription table and the state store.
///
/// Every fallible operation reports failure as `false` after logging it:
/// bus connectivity is best-effort and callers such as HTTP handlers only
/// need a yes/no answer.
///
/// # Examples
///
/// ```no_run
/// use iot_bridge::protocol::{BusClient, MqttTransport};
///
/// # async fn example() -> iot_bridge::Result<()> {
/// let bus = BusClient::builder(MqttTransport::from_url("mqtt://localhost:1883")?).build();
///
/// // Subscriptions made before connecting are activated on connect
/// bus.subscribe_with("home/doorbell/status", |payload, topic| {
///     println!("{topic}: {payload}");
/// })
/// .await;
///
/// if bus.connect().await {
///     bus.publish("home/lamp1/command", "on").await;
/// }
///
/// bus.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct BusClient<T: Transport> {
    inner: Arc<BusClientInner<T>>,
}

struct BusClientInner<T: Transport> {
    transport: T,
    config: BusConfig,
    /// Current connection state, observable through `watch_state`.
    state: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionTable,
    /// The live session, if any.
    session: Mutex<Option<Session<T::Link>>>,
    /// Source of session generation numbers.
    generation: AtomicU64,
    /// Cleared by `disconnect()` while holding `session`; a session is only
    /// installed while set.
    wanted: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    store: DeviceStateStore,
    updates: mpsc::Sender<UpdateInstruction>,
}

struct Session<L> {
    generation: u64,
    link: Arc<L>,
    receiver: JoinHandle<()>,
}

impl<T: Transport> Clone for BusClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> BusClient<T> {
    /// Creates a new builder for a client over the given transport.
    #[must_use]
    pub fn builder(transport: T) -> BusClientBuilder<T> {
        BusClientBuilder {
            transport,
            config: BusConfig::default(),
            store: None,
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to the broker, waiting at most the configured timeout.
    ///
    /// Returns `true` once the broker has accepted the connection. Returns
    /// `true` immediately if already connected. Concurrent callers share the
    /// same handshake.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to message bus");
                false
            }
        }
    }

    /// Connects to the broker, reporting why a connection failed.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be started, the broker refuses the
    /// connection, or the handshake does not finish within the timeout.
    pub async fn try_connect(&self) -> Result<(), ProtocolError> {
        self.inner.wanted.store(true, Ordering::Release);
        self.establish().await
    }

    /// Arms the reconnection loop without waiting for a connection.
    ///
    /// The first attempt is made after the policy's initial delay. Useful when
    /// an initial [`connect`](Self::connect) failed and the caller wants the
    /// client to keep trying in the background.
    pub fn connect_in_background(&self) {
        self.inner.wanted.store(true, Ordering::Release);
        self.schedule_reconnect();
    }

    /// Disconnects from the broker.
    ///
    /// Cancels any pending reconnection; the client stays disconnected until
    /// the next explicit [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        // Cleared under the slot lock so that no session can be installed
        // once this returns.
        let session = {
            let mut slot = self.inner.session.lock();
            self.inner.wanted.store(false, Ordering::Release);
            slot.take()
        };

        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }

        if let Some(session) = session {
            tracing::info!("Disconnecting from message bus");
            if let Err(e) = session.link.disconnect().await {
                tracing::warn!(error = %e, "Failed to send disconnect request");
            }
            let mut receiver = session.receiver;
            if tokio::time::timeout(DISCONNECT_GRACE, &mut receiver)
                .await
                .is_err()
            {
                receiver.abort();
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Returns whether the client is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver notified on every connection state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns the configuration of this client.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // =========================================================================
    // Publish / Subscribe
    // =========================================================================

    /// Publishes a message.
    ///
    /// Returns `false` if the client is not connected or the transport
    /// rejects the request. Success means the request was accepted locally,
    /// not that the broker received it.
    pub async fn publish(&self, topic: &str, message: &str) -> bool {
        match self.try_publish(topic, message).await {
            Ok(()) => true,
            Err(ProtocolError::NotConnected) => {
                tracing::warn!(topic = %topic, "Cannot publish: not connected to message bus");
                false
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to publish message");
                false
            }
        }
    }

    /// Publishes a message, reporting why it could not be sent.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotConnected`] if there is no live session,
    /// or the transport's error if it rejects the request.
    pub async fn try_publish(&self, topic: &str, message: &str) -> Result<(), ProtocolError> {
        let link = self.connected_link().ok_or(ProtocolError::NotConnected)?;
        link.publish(topic, message).await?;
        tracing::info!(topic = %topic, payload = %message, "Published message");
        Ok(())
    }

    /// Subscribes to a topic filter.
    ///
    /// A handler already registered for the topic is kept. When disconnected
    /// the subscription is recorded and activated on the next successful
    /// connect. Returns `false` only if an immediate transport
    /// subscribe failed; the topic then stays recorded for the next connect.
    pub async fn subscribe(&self, topic: impl Into<String>) -> bool {
        self.add_subscription(topic.into(), None).await
    }

    /// Subscribes to a topic filter with a handler.
    ///
    /// The handler receives `(payload, topic)` for every matching message, in
    /// addition to the regular device state routing.
    pub async fn subscribe_with<F>(&self, topic: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.add_subscription(topic.into(), Some(Arc::new(handler)))
            .await
    }

    /// Removes a subscription.
    ///
    /// Unknown topics are a no-op. Returns `false` only if the transport
    /// rejected the unsubscribe request.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        if !self.inner.subscriptions.remove(topic) {
            tracing::debug!(topic = %topic, "Ignoring unsubscribe for unknown topic");
            return true;
        }

        let Some(link) = self.connected_link() else {
            tracing::debug!(topic = %topic, "Removed deferred subscription");
            return true;
        };

        match link.unsubscribe(topic).await {
            Ok(()) => {
                tracing::info!(topic = %topic, "Unsubscribed from topic");
                true
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Failed to unsubscribe");
                false
            }
        }
    }

    /// Returns every topic in the subscription table, sorted.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.subscriptions.topics()
    }

    /// Returns `true` if the topic filter is in the subscription table.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.subscriptions.contains(topic)
    }

    /// Records a topic for subscription without contacting the transport.
    ///
    /// An existing handler for the topic is kept.
    pub(crate) fn track_topic(&self, topic: impl Into<String>) {
        self.inner.subscriptions.ensure(topic);
    }

    async fn add_subscription(&self, topic: String, handler: Option<MessageHandler>) -> bool {
        match handler {
            Some(handler) => self.inner.subscriptions.insert(topic.clone(), Some(handler)),
            None => self.inner.subscriptions.ensure(topic.clone()),
        }

        let Some(link) = self.connected_link() else {
            tracing::debug!(topic = %topic, "Deferring subscription until connected");
            return true;
        };

        match link.subscribe(&topic).await {
            Ok(()) => {
                tracing::info!(topic = %topic, "Subscribed to topic");
                true
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Failed to subscribe");
                false
            }
        }
    }

    // =========================================================================
    // Device State
    // =========================================================================

    /// Returns the state store fed by this client.
    #[must_use]
    pub fn state_store(&self) -> &DeviceStateStore {
        &self.inner.store
    }

    /// Returns a snapshot of every device's status.
    #[must_use]
    pub fn devices_status(&self) -> HashMap<String, DeviceStatus> {
        self.inner.store.get_all()
    }

    // =========================================================================
    // Session management
    // =========================================================================

    /// Drives the state machine to Connected or reports why it could not.
    async fn establish(&self) -> Result<(), ProtocolError> {
        let mut state_rx = self.inner.state.subscribe();

        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        let generation = if claimed {
            tracing::info!("Connecting to message bus");
            match self.open_session() {
                Ok(generation) => Some(generation),
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let timeout = self.inner.config.connect_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map(|result| result.map(|state| state.is_connected()));

        match outcome {
            Ok(Ok(true)) => {
                tracing::info!("Connected to message bus");
                Ok(())
            }
            Ok(Ok(false)) => Err(ProtocolError::ConnectionFailed(
                "broker did not accept the connection".to_string(),
            )),
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed(
                "connection state channel closed".to_string(),
            )),
            Err(_) => {
                if let Some(generation) = generation {
                    self.abandon_session(generation);
                }
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                Err(ProtocolError::Timeout(timeout_ms))
            }
        }
    }

    /// Opens a transport session and spawns its receive task.
    ///
    /// Fails without installing anything if `disconnect()` ran while the
    /// transport was opening.
    fn open_session(&self) -> Result<u64, ProtocolError> {
        let (link, events) = self.inner.transport.open()?;
        let link = Arc::new(link);

        // The slot is filled before the receive task can observe it.
        let mut slot = self.inner.session.lock();
        if !self.inner.wanted.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionFailed(
                "disconnect requested while connecting".to_string(),
            ));
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let receiver = tokio::spawn(run_session(
            self.clone(),
            generation,
            Arc::clone(&link),
            events,
        ));
        let previous = slot.replace(Session {
            generation,
            link,
            receiver,
        });
        drop(slot);

        if let Some(previous) = previous {
            tracing::debug!(generation = previous.generation, "Replacing stale session");
            previous.receiver.abort();
        }

        Ok(generation)
    }

    /// Drops a session whose handshake timed out.
    fn abandon_session(&self, generation: u64) {
        let session = {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };

        if let Some(session) = session {
            tracing::debug!(generation, "Abandoning session after handshake timeout");
            session.receiver.abort();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Returns `true` if `generation` is the live session.
    fn owns_session(&self, generation: u64) -> bool {
        self.inner
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    /// Marks the session as Connected and restores subscriptions.
    fn session_connected(&self, link: &Arc<T::Link>) {
        self.set_state(ConnectionState::Connected);

        let topics = self.inner.subscriptions.topics();
        if topics.is_empty() {
            return;
        }

        let client = self.clone();
        let link = Arc::clone(link);
        tokio::spawn(async move {
            for topic in topics {
                // Skip topics unsubscribed since the snapshot
                if !client.inner.subscriptions.contains(&topic) {
                    continue;
                }
                match link.subscribe(&topic).await {
                    Ok(()) => tracing::debug!(topic = %topic, "Restored subscription"),
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Failed to restore subscription");
                    }
                }
            }
        });
    }

    /// Clears the session slot after its receive task ended.
    fn session_ended(&self, generation: u64, lost: bool) {
        let ended = {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };

        if ended.is_none() {
            return;
        }

        self.set_state(ConnectionState::Disconnected);

        if lost && self.inner.wanted.load(Ordering::Acquire) {
            self.schedule_reconnect();
        }
    }

    /// Routes an inbound message to the state store and topic handlers.
    async fn dispatch(&self, topic: &str, payload: &str) {
        tracing::debug!(topic = %topic, payload = %payload, "Message received");

        if let Some(instruction) = topic_router::route(topic, payload)
            && self.inner.updates.send(instruction).await.is_err()
        {
            tracing::warn!(topic = %topic, "Device state writer has stopped");
        }

        for handler in self.inner.subscriptions.handlers_for(topic) {
            handler(payload, topic);
        }
    }

    /// Returns the link of the live session if connected.
    fn connected_link(&self) -> Option<Arc<T::Link>> {
        if !self.is_connected() {
            return None;
        }
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.link))
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?*current, to = ?state, "Connection state changed");
                *current = state;
                true
            }
        });
    }

    // =========================================================================
    // Reconnection
    // =========================================================================

    /// Starts the reconnect loop, replacing any previous one.
    fn schedule_reconnect(&self) {
        if !self.inner.config.reconnection.enabled {
            tracing::warn!("Automatic reconnection is disabled");
            return;
        }

        let client = self.clone();
        let task = tokio::spawn(async move { client.reconnect_loop().await });
        if let Some(previous) = self.inner.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(&self) {
        let policy = &self.inner.config.reconnection;
        let mut attempt = 0;

        while policy.should_retry(attempt) {
            let delay = policy.jittered_delay(attempt);
            #[allow(clippy::cast_possible_truncation)]
            let delay_ms = delay.as_millis() as u64;
            tracing::info!(attempt = attempt + 1, delay_ms, "Scheduling reconnection");
            tokio::time::sleep(delay).await;

            if !self.inner.wanted.load(Ordering::Acquire)
                || self.connection_state() != ConnectionState::Disconnected
            {
                tracing::debug!("Reconnection no longer needed");
                return;
            }

            match self.establish().await {
                Ok(()) => {
                    tracing::info!(attempt = attempt + 1, "Reconnected to message bus");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Reconnection attempt failed");
                }
            }

            if !self.inner.wanted.load(Ordering::Acquire) {
                tracing::debug!("Reconnection cancelled");
                return;
            }
            attempt += 1;
        }

        tracing::error!(attempts = attempt, "Giving up on reconnection");
    }
}

impl<T: Transport> std::fmt::Debug for BusClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("state", &self.connection_state())
            .field("subscriptions", &self.inner.subscriptions)
            .finish_non_exhaustive()
    }
}

/// Receive loop of one transport session.
async fn run_session<T: Transport>(
    client: BusClient<T>,
    generation: u64,
    link: Arc<T::Link>,
    mut events: T::Events,
) {
    let mut connected = false;

    while let Some(event) = events.next_event().await {
        if !client.owns_session(generation) {
            tracing::trace!(generation, ?event, "Ignoring event from superseded session");
            continue;
        }

        match event {
            TransportEvent::Connected if !client.inner.wanted.load(Ordering::Acquire) => {
                tracing::debug!(generation, "Closing session accepted after disconnect");
                if let Err(e) = link.disconnect().await {
                    tracing::warn!(error = %e, "Failed to send disconnect request");
                }
                client.session_ended(generation, false);
                return;
            }
            TransportEvent::Connected => {
                connected = true;
                client.session_connected(&link);
            }
            TransportEvent::Refused(reason) => {
                tracing::warn!(reason = %reason, "Broker refused connection");
                break;
            }
            TransportEvent::Message { topic, payload } => {
                client.dispatch(&topic, &payload).await;
            }
            TransportEvent::Disconnected(DisconnectReason::Normal) => {
                tracing::info!("Disconnected from message bus");
                client.session_ended(generation, false);
                return;
            }
            TransportEvent::Disconnected(DisconnectReason::Unexpected(reason)) => {
                tracing::warn!(reason = %reason, "Unexpected disconnect from message bus");
                break;
            }
        }
    }

    client.session_ended(generation, connected);
}

/// Builder for [`BusClient`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use iot_bridge::protocol::{BusClient, MqttTransport, ReconnectionPolicy};
///
/// # fn example() -> iot_bridge::Result<()> {
/// let bus = BusClient::builder(MqttTransport::from_url("mqtt://localhost")?)
///     .connect_timeout(Duration::from_secs(3))
///     .reconnection(ReconnectionPolicy::new().with_max_retries(20))
///     .build();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BusClientBuilder<T> {
    transport: T,
    config: BusConfig,
    store: Option<DeviceStateStore>,
}

impl<T: Transport> BusClientBuilder<T> {
    /// Sets the bound on the wait in `connect()` (default: 5 seconds).
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    pub fn reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.config.reconnection = policy;
        self
    }

    /// Sets the capacity of the state update channel (default: 256).
    #[must_use]
    pub fn update_capacity(mut self, capacity: usize) -> Self {
        self.config.update_capacity = capacity.max(1);
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Feeds an existing state store instead of a new one.
    #[must_use]
    pub fn state_store(mut self, store: DeviceStateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the client. It starts disconnected.
    ///
    /// Must be called from within a Tokio runtime: the state store writer task
    /// is spawned here.
    #[must_use]
    pub fn build(self) -> BusClient<T> {
        let store = self.store.unwrap_or_default();
        let updates = store.spawn_writer(self.config.update_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        BusClient {
            inner: Arc::new(BusClientInner {
                transport: self.transport,
                config: self.config,
                state,
                subscriptions: SubscriptionTable::default(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                wanted: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                store,
                updates,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{Handshake, MockTransport, TransportCall, settle};
    use std::sync::atomic::AtomicU32;

    fn client(transport: &MockTransport) -> BusClient<MockTransport> {
        BusClient::builder(transport.clone())
            .reconnection(ReconnectionPolicy::new().without_jitter())
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn starts_disconnected() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
        assert!(!bus.is_connected());
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_succeeds() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        assert!(bus.connect().await);
        assert!(bus.is_connected());
        assert_eq!(transport.opens(), 1);

        // Already connected: no new session
        assert!(bus.connect().await);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_refused_reports_failure() {
        let transport = MockTransport::new();
        transport.set_default(Handshake::Refuse);
        let bus = client(&transport);

        assert!(!bus.connect().await);
        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let transport = MockTransport::new();
        transport.set_default(Handshake::Hang);
        let bus = client(&transport);

        let started = tokio::time::Instant::now();
        let err = bus.try_connect().await.unwrap_err();

        assert!(matches!(err, ProtocolError::Timeout(5000)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_handshake() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        let (a, b) = tokio::join!(bus.connect(), bus.connect());
        assert!(a && b);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_subscription_is_activated_on_connect() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        let received = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&received);
        assert!(
            bus.subscribe_with("home/doorbell/status", move |payload, topic| {
                assert_eq!(payload, "ring");
                assert_eq!(topic, "home/doorbell/status");
                r.fetch_add(1, Ordering::SeqCst);
            })
            .await
        );
        assert!(transport.calls().is_empty());

        assert!(bus.connect().await);
        settle().await;

        assert!(
            transport
                .calls()
                .contains(&TransportCall::Subscribe("home/doorbell/status".to_string()))
        );

        transport.inject("home/doorbell/status", "ring");
        settle().await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_connected_is_immediate() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        assert!(bus.connect().await);
        settle().await;

        assert!(bus.subscribe("home/lamp1/status").await);
        assert_eq!(
            transport.calls(),
            vec![TransportCall::Subscribe("home/lamp1/status".to_string())]
        );
        assert_eq!(bus.subscribed_topics(), vec!["home/lamp1/status".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_removes_topic() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        bus.subscribe("home/lamp1/status").await;
        assert!(bus.connect().await);
        settle().await;

        assert!(bus.unsubscribe("home/lamp1/status").await);
        assert!(bus.subscribed_topics().is_empty());
        assert!(
            transport
                .calls()
                .contains(&TransportCall::Unsubscribe("home/lamp1/status".to_string()))
        );

        // Unknown topic is a no-op
        assert!(bus.unsubscribe("never/subscribed").await);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_subscribe_keeps_existing_handler() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        let received = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&received);
        bus.subscribe_with("iot/device/lamp1/status", move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        bus.subscribe("iot/device/lamp1/status").await;
        assert!(bus.is_subscribed("iot/device/lamp1/status"));
        assert!(bus.connect().await);

        transport.inject("iot/device/lamp1/status", "off");
        settle().await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_requires_connection() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        assert!(!bus.publish("home/lamp1/command", "on").await);

        assert!(bus.connect().await);
        assert!(bus.publish("home/lamp1/command", "on").await);
        assert_eq!(
            transport.published(),
            vec![("home/lamp1/command".to_string(), "on".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn try_publish_reports_not_connected() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        let err = bus.try_publish("home/lamp1/command", "on").await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected));

        assert!(bus.connect().await);
        bus.try_publish("home/lamp1/command", "on").await.unwrap();

        transport.fail_requests(true);
        let err = bus.try_publish("home/lamp1/command", "on").await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_returns_false() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        assert!(bus.connect().await);

        transport.fail_requests(true);
        assert!(!bus.publish("home/lamp1/command", "on").await);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_message_updates_state_and_handler() {
        let transport = MockTransport::new();
        let bus = client(&transport);

        let received = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&received);
        bus.subscribe_with("iot/device/lamp1/status", move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert!(bus.connect().await);

        transport.inject("iot/device/lamp1/status", "on");
        settle().await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        let status = bus.state_store().get("lamp1").unwrap();
        assert_eq!(status.status.as_deref(), Some("on"));
        assert!(status.online);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_topic_does_not_touch_state() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        assert!(bus.connect().await);

        transport.inject("zigbee2mqtt/bridge/state", "online");
        transport.inject("iot", "x");
        settle().await;

        assert!(bus.devices_status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_disconnect_reconnects_after_delay() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        bus.subscribe("home/lamp1/status").await;
        assert!(bus.connect().await);
        settle().await;

        transport.drop_connection("keep-alive timeout");
        settle().await;
        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.opens(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.opens(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.opens(), 2);
        assert!(bus.is_connected());

        // Subscriptions are restored on the new session
        let subscribes = transport
            .calls()
            .iter()
            .filter(|call| **call == TransportCall::Subscribe("home/lamp1/status".to_string()))
            .count();
        assert_eq!(subscribes, 2);

        // No further attempts once connected
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_with_backoff() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        assert!(bus.connect().await);

        transport.script([Handshake::Refuse, Handshake::Refuse, Handshake::Accept]);
        transport.drop_connection("broker restarted");
        settle().await;

        // Attempts at t=5s (refused) and t=15s (refused), then t=35s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.opens(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.opens(), 3);
        assert!(!bus.is_connected());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.opens(), 4);
        assert!(bus.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_does_not_reconnect() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        assert!(bus.connect().await);

        bus.disconnect().await;
        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
        assert!(transport.calls().contains(&TransportCall::Disconnect));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 1);
        assert!(!bus.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        assert!(bus.connect().await);

        transport.drop_connection("network down");
        settle().await;
        bus.disconnect().await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_policy_never_reconnects() {
        let transport = MockTransport::new();
        let bus = BusClient::builder(transport.clone())
            .reconnection(ReconnectionPolicy::disabled())
            .build();
        assert!(bus.connect().await);

        transport.drop_connection("network down");
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_in_background_keeps_trying() {
        let transport = MockTransport::new();
        transport.set_default(Handshake::Refuse);
        let bus = client(&transport);

        assert!(!bus.connect().await);
        transport.set_default(Handshake::Accept);
        bus.connect_in_background();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(bus.is_connected());
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_skips_topics_unsubscribed_meanwhile() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        bus.subscribe("home/lamp1/status").await;
        bus.subscribe("home/lamp2/status").await;

        // The restore pass stalls on lamp1 with lamp2 still in its snapshot
        transport.hold_subscribes();
        assert!(bus.connect().await);
        settle().await;

        assert!(bus.unsubscribe("home/lamp2/status").await);
        transport.release_subscribes();
        settle().await;

        let calls = transport.calls();
        assert!(calls.contains(&TransportCall::Subscribe("home/lamp1/status".to_string())));
        assert!(calls.contains(&TransportCall::Unsubscribe("home/lamp2/status".to_string())));
        assert!(!calls.contains(&TransportCall::Subscribe("home/lamp2/status".to_string())));
        assert_eq!(bus.subscribed_topics(), vec!["home/lamp1/status".to_string()]);
    }

    /// Transport whose next `open()` blocks its thread until released.
    struct GatedTransport {
        inner: MockTransport,
        armed: AtomicBool,
        entered: tokio::sync::Notify,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Transport for Arc<GatedTransport> {
        type Link = <MockTransport as Transport>::Link;
        type Events = <MockTransport as Transport>::Events;

        fn open(&self) -> Result<(Self::Link, Self::Events), ProtocolError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                let _ = self.release.lock().recv();
            }
            self.inner.open()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_during_reconnect_attempt_stays_disconnected() {
        let transport = MockTransport::new();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let gated = Arc::new(GatedTransport {
            inner: transport.clone(),
            armed: AtomicBool::new(false),
            entered: tokio::sync::Notify::new(),
            release: Mutex::new(release_rx),
        });
        let bus = BusClient::builder(Arc::clone(&gated))
            .reconnection(
                ReconnectionPolicy::new()
                    .with_initial_delay(Duration::from_millis(10))
                    .without_jitter(),
            )
            .build();
        assert!(bus.connect().await);

        gated.armed.store(true, Ordering::SeqCst);
        transport.drop_connection("network down");
        tokio::time::timeout(Duration::from_secs(5), gated.entered.notified())
            .await
            .unwrap();

        // The reconnect attempt is inside open() on another thread
        bus.disconnect().await;
        release_tx.send(()).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.opens(), 2);
        assert!(!bus.publish("home/lamp1/command", "on").await);
    }

    #[tokio::test(start_paused = true)]
    async fn session_accepted_after_disconnect_is_closed() {
        let transport = MockTransport::new();
        transport.set_default(Handshake::Hang);
        let bus = client(&transport);

        // Install a session by hand, then let disconnect() clear the intent
        // without seeing it, as if the slot were filled concurrently.
        bus.inner.wanted.store(true, Ordering::Release);
        bus.open_session().unwrap();
        bus.inner.wanted.store(false, Ordering::Release);

        transport.accept_current();
        settle().await;

        assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
        assert!(transport.calls().contains(&TransportCall::Disconnect));
        assert!(!bus.owns_session(1));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_state_observes_transitions() {
        let transport = MockTransport::new();
        let bus = client(&transport);
        let mut rx = bus.watch_state();

        assert!(bus.connect().await);
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        bus.disconnect().await;
        rx.wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }
}
