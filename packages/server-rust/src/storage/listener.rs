//! Change listener trait and composite implementation.
//!
//! Defines [`ChangeListener`], the capability the [`LedgerStore`](super::LedgerStore)
//! uses to tell the outside world that an entity's value changed, and
//! [`CompositeChangeListener`] which fans notifications out to several
//! listeners in registration order.

use std::sync::Arc;

use ledger_core::{Key, Record};

/// Receiver of change notifications (message-bus publishers, indexers).
///
/// Called synchronously on the caller's task, so implementations should
/// hand work off rather than block.
///
/// Used as `Arc<dyn ChangeListener>`.
pub trait ChangeListener: Send + Sync {
    /// An entity's value changed. `reason` is the opaque tag passed to
    /// [`LedgerStore::update`](super::LedgerStore::update).
    fn publish_change(&self, key: &Key, record: &Record, reason: &str);

    /// Free-form broadcast for events that are not tied to one entity.
    fn publish(&self, message: &str, args: &[String]);

    /// Release resources. Called once during store shutdown.
    fn shutdown(&self) {}
}

/// Fans every notification out to a fixed list of listeners.
#[derive(Default, Clone)]
pub struct CompositeChangeListener {
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl CompositeChangeListener {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn ChangeListener>>) -> Self {
        Self { listeners }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl ChangeListener for CompositeChangeListener {
    fn publish_change(&self, key: &Key, record: &Record, reason: &str) {
        for listener in &self.listeners {
            listener.publish_change(key, record, reason);
        }
    }

    fn publish(&self, message: &str, args: &[String]) {
        for listener in &self.listeners {
            listener.publish(message, args);
        }
    }

    fn shutdown(&self) {
        for listener in &self.listeners {
            listener.shutdown();
        }
    }
}
