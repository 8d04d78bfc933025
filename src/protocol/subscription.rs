// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription bookkeeping for the bus client.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Callback invoked with `(payload, topic)` for messages on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Topics the client should be subscribed to, with optional handlers.
///
/// The table is the source of truth for what must be subscribed, whether or
/// not the transport is currently connected: every entry is either active on
/// the broker or waiting for the next resubscription pass.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: RwLock<HashMap<String, Option<MessageHandler>>>,
}

impl SubscriptionTable {
    /// Adds or replaces a topic entry.
    pub fn insert(&self, topic: impl Into<String>, handler: Option<MessageHandler>) {
        self.entries.write().insert(topic.into(), handler);
    }

    /// Adds a topic without a handler, keeping an existing handler if present.
    pub fn ensure(&self, topic: impl Into<String>) {
        self.entries.write().entry(topic.into()).or_insert(None);
    }

    /// Removes a topic. Returns `true` if it was present.
    pub fn remove(&self, topic: &str) -> bool {
        self.entries.write().remove(topic).is_some()
    }

    /// Returns `true` if the topic is in the table.
    pub fn contains(&self, topic: &str) -> bool {
        self.entries.read().contains_key(topic)
    }

    /// Returns all topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Returns the handlers whose filter matches `topic`.
    ///
    /// Handlers are cloned out so they can be called without holding the lock.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .filter_map(|(_, handler)| handler.clone())
            .collect()
    }
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("topics", &self.topics())
            .finish()
    }
}

/// Returns `true` if an MQTT topic filter matches a concrete topic.
///
/// Supports the `+` (single level) and `#` (remaining levels) wildcards.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exact_filter_matches() {
        assert!(topic_matches("home/lamp1/status", "home/lamp1/status"));
        assert!(!topic_matches("home/lamp1/status", "home/lamp1/value"));
        assert!(!topic_matches("home/lamp1", "home/lamp1/status"));
    }

    #[test]
    fn wildcard_filters_match() {
        assert!(topic_matches("home/+/status", "home/lamp1/status"));
        assert!(!topic_matches("home/+/status", "home/a/b/status"));
        assert!(topic_matches("iot/device/#", "iot/device/lamp1/value/level"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("iot/+", "iot"));
    }

    #[test]
    fn ensure_keeps_existing_handler() {
        let table = SubscriptionTable::default();
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        table.insert(
            "home/lamp1/status",
            Some(Arc::new(move |_: &str, _: &str| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        table.ensure("home/lamp1/status");

        for handler in table.handlers_for("home/lamp1/status") {
            handler("on", "home/lamp1/status");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_for_skips_entries_without_handler() {
        let table = SubscriptionTable::default();
        table.ensure("home/lamp1/status");
        assert!(table.contains("home/lamp1/status"));
        assert!(table.handlers_for("home/lamp1/status").is_empty());
    }

    #[test]
    fn remove_and_topics() {
        let table = SubscriptionTable::default();
        table.ensure("b");
        table.ensure("a");
        assert_eq!(table.topics(), vec!["a".to_string(), "b".to_string()]);
        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert_eq!(table.topics(), vec!["b".to_string()]);
    }
}
