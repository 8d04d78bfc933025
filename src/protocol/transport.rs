// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport abstraction beneath the bus client.
//!
//! A [`Transport`] opens sessions. Each session is a [`Link`] used to send
//! requests and an [`EventStream`] carrying what the broker sends back. The
//! bus client owns the connection state machine; transports only report
//! what happened on the wire.

use std::future::Future;

use crate::error::ProtocolError;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client asked to disconnect.
    Normal,
    /// The connection was lost (network error, broker shutdown, keep-alive
    /// timeout, ...).
    Unexpected(String),
}

/// Something that happened on a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection.
    Connected,
    /// The handshake failed before the session was established.
    Refused(String),
    /// A message arrived on a subscribed topic.
    Message {
        /// The topic the message was published to.
        topic: String,
        /// The UTF-8 payload.
        payload: String,
    },
    /// The session ended after being established.
    Disconnected(DisconnectReason),
}

/// Factory for transport sessions.
pub trait Transport: Send + Sync + 'static {
    /// Request side of a session.
    type Link: Link;
    /// Event side of a session.
    type Events: EventStream;

    /// Starts a new session.
    ///
    /// The handshake completes asynchronously: the session reports
    /// [`TransportEvent::Connected`] or [`TransportEvent::Refused`] on its
    /// event stream.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot even be started (e.g., invalid
    /// options).
    fn open(&self) -> Result<(Self::Link, Self::Events), ProtocolError>;
}

/// Request side of a transport session.
///
/// Requests complete once the transport has accepted them locally; they do not
/// wait for broker acknowledgment.
pub trait Link: Send + Sync + 'static {
    /// Publishes a message.
    fn publish(
        &self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Subscribes to a topic filter.
    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Unsubscribes from a topic filter.
    fn unsubscribe(&self, topic: &str)
    -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Closes the session gracefully.
    fn disconnect(&self) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}

/// Event side of a transport session.
pub trait EventStream: Send + 'static {
    /// Waits for the next event.
    ///
    /// Returns `None` once the session has ended and no more events will come.
    fn next_event(&mut self) -> impl Future<Output = Option<TransportEvent>> + Send;
}
