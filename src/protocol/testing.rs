// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::error::ProtocolError;

use super::transport::{DisconnectReason, EventStream, Link, Transport, TransportEvent};

/// How the broker answers the next session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    Refuse,
    /// Never answers.
    Hang,
}

/// A request recorded by a [`MockLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Publish(String, String),
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

#[derive(Debug)]
struct MockState {
    script: Mutex<VecDeque<Handshake>>,
    default: Mutex<Handshake>,
    opens: AtomicUsize,
    calls: Mutex<Vec<TransportCall>>,
    fail: AtomicBool,
    current: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    /// While set, link subscribes wait for it to be notified.
    subscribe_gate: Mutex<Option<Arc<Notify>>>,
}

/// Scriptable transport; clones share the same state.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(VecDeque::new()),
                default: Mutex::new(Handshake::Accept),
                opens: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                current: Mutex::new(None),
                subscribe_gate: Mutex::new(None),
            }),
        }
    }

    /// Sets the answer used once the script is exhausted.
    pub fn set_default(&self, handshake: Handshake) {
        *self.state.default.lock() = handshake;
    }

    /// Queues answers for the next sessions, in order.
    pub fn script(&self, handshakes: impl IntoIterator<Item = Handshake>) {
        self.state.script.lock().extend(handshakes);
    }

    /// Makes every link request fail.
    pub fn fail_requests(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.calls.lock().clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish(topic, payload) => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Delivers a message on the current session.
    pub fn inject(&self, topic: &str, payload: &str) {
        if let Some(tx) = self.state.current.lock().as_ref() {
            let _ = tx.send(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    /// Answers a hanging handshake on the current session.
    pub fn accept_current(&self) {
        if let Some(tx) = self.state.current.lock().as_ref() {
            let _ = tx.send(TransportEvent::Connected);
        }
    }

    /// Holds every link subscribe until [`release_subscribes`](Self::release_subscribes).
    pub fn hold_subscribes(&self) {
        *self.state.subscribe_gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn release_subscribes(&self) {
        if let Some(gate) = self.state.subscribe_gate.lock().take() {
            gate.notify_waiters();
        }
    }

    /// Ends the current session as if the network failed.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(tx) = self.state.current.lock().take() {
            let _ = tx.send(TransportEvent::Disconnected(DisconnectReason::Unexpected(
                reason.to_string(),
            )));
        }
    }
}

impl Transport for MockTransport {
    type Link = MockLink;
    type Events = MockEvents;

    fn open(&self) -> Result<(MockLink, MockEvents), ProtocolError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        let handshake = self
            .state
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.state.default.lock());

        let (tx, rx) = mpsc::unbounded_channel();
        match handshake {
            Handshake::Accept => {
                let _ = tx.send(TransportEvent::Connected);
            }
            Handshake::Refuse => {
                let _ = tx.send(TransportEvent::Refused("not authorized".to_string()));
            }
            Handshake::Hang => {}
        }
        *self.state.current.lock() = Some(tx.clone());

        Ok((
            MockLink {
                state: Arc::clone(&self.state),
                events: tx,
            },
            MockEvents { rx },
        ))
    }
}

#[derive(Debug)]
pub struct MockLink {
    state: Arc<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockLink {
    fn record(&self, call: TransportCall) -> Result<(), ProtocolError> {
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionFailed("injected failure".to_string()));
        }
        self.state.calls.lock().push(call);
        Ok(())
    }
}

impl Link for MockLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), ProtocolError> {
        self.record(TransportCall::Publish(topic.to_string(), payload.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        let gate = self.state.subscribe_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(TransportCall::Subscribe(topic.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        self.record(TransportCall::Unsubscribe(topic.to_string()))
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.record(TransportCall::Disconnect)?;
        let _ = self
            .events
            .send(TransportEvent::Disconnected(DisconnectReason::Normal));
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream for MockEvents {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Lets spawned tasks run until they are idle.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
