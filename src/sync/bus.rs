//! Notification bus for per-item sync outcomes.
//!
//! The engine publishes one [`SyncEvent`] per processed item. Observers
//! subscribe with a handler or a channel and get a [`Subscription`] back;
//! dropping the subscription unsubscribes.

use crossbeam_channel::{unbounded, Receiver};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::sync::changes::ChangeType;
use crate::sync::metadata::ItemId;

/// A change that was applied to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub item_id: ItemId,
    pub change_type: ChangeType,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

/// Why an item was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A filesystem operation failed.
    Io,
    /// The source content vanished after detection.
    SourceMissing,
    /// The item lost a conflict against the destination.
    ConflictLoser,
    /// The content to be replaced could not be moved to the recycle area.
    RecycleFailed,
    /// A deleted directory still has entries on the destination.
    DirectoryNotEmpty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::Io => "I/O error",
            SkipReason::SourceMissing => "source missing",
            SkipReason::ConflictLoser => "lost conflict",
            SkipReason::RecycleFailed => "could not recycle existing content",
            SkipReason::DirectoryNotEmpty => "directory not empty",
        };
        f.write_str(text)
    }
}

/// A change that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChange {
    pub item_id: ItemId,
    pub change_type: ChangeType,
    pub path: String,
    pub reason: SkipReason,
    pub underlying_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Applied(AppliedChange),
    Skipped(SkippedChange),
}

impl SyncEvent {
    pub fn item_id(&self) -> ItemId {
        match self {
            SyncEvent::Applied(change) => change.item_id,
            SyncEvent::Skipped(change) => change.item_id,
        }
    }
}

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// Publish/subscribe channel for [`SyncEvent`]s. Cheap to clone; clones share
/// subscribers.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<Mutex<BusInner>>,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    // A handler that panicked while the lock was held must not disable the bus
    fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
        inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handler, called synchronously for every published event.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut inner = Self::lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handlers.push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Subscribe through an unbounded channel. Events arrive in publish order.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe_channel(&self) -> (Subscription, Receiver<SyncEvent>) {
        let (tx, rx) = unbounded();
        let subscription = self.subscribe(move |event| {
            // Receiver gone: nothing left to notify
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver `event` to every current subscriber.
    pub fn publish(&self, event: &SyncEvent) {
        // Call handlers outside the lock so they may subscribe or unsubscribe
        let handlers: Vec<Handler> = Self::lock(&self.inner)
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        Self::lock(&self.inner).handlers.len()
    }
}

/// Scoped registration on a [`NotificationBus`].
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<Mutex<BusInner>>,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now instead of at drop.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            NotificationBus::lock(&inner).handlers.retain(|(id, _)| *id != self.id);
        }
    }
}
