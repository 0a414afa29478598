//! Diagnostics fan-out.
//!
//! A [`DiagnosticsBus`] is a named publisher of leveled text messages.
//! Subscribers attach with a minimum level and receive every message at or
//! above it; messages published while nobody qualifies are discarded without
//! formatting cost beyond the message itself. Buses can be chained so that
//! everything published on one is forwarded to another's subscribers with
//! the original sender name preserved.
//!
//! # Levels
//!
//! Levels are plain `usize` values; higher means more important. The
//! conventional thresholds live in [`level`]: [`level::WARNING`] and
//! [`level::ERROR`].
//!
//! # Contexts
//!
//! [`DiagnosticsContext`] pushes a label onto the bus for as long as the
//! scope value is alive. Every message published in the meantime is
//! prefixed with the active labels, outermost first:
//!
//! ```
//! use ferrule_core::{DiagnosticsBus, DiagnosticsContext};
//!
//! let bus = DiagnosticsBus::new("worker");
//! let _scope = DiagnosticsContext::new(&bus, "handshake");
//! bus.publish(0, "retrying");   // delivered as "handshake: retrying"
//! ```
//!
//! # Thread safety
//!
//! Publication is safe from any thread. Delivery happens directly on the
//! publishing thread, so messages from a single thread arrive in order.
//! The bus's internal lock is never held while a subscriber delegate runs,
//! so delegates are free to call back into the bus.

use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

/// Conventional severity thresholds for diagnostic messages.
pub mod level {
    /// Messages at or above this level describe conditions worth a look.
    pub const WARNING: usize = 5;
    /// Messages at or above this level describe failures.
    pub const ERROR: usize = 10;
}

/// The type of function called to deliver diagnostic messages.
///
/// Arguments are the sender name, the message level, and the message text.
pub type DiagnosticDelegate = Arc<dyn Fn(&str, usize, &str) + Send + Sync>;

new_key_type! {
    /// A unique identifier for a diagnostics subscription.
    ///
    /// Returned by [`DiagnosticsBus::subscribe`] and accepted by
    /// [`DiagnosticsBus::unsubscribe`]. The ID remains valid until the
    /// subscription is explicitly removed.
    pub struct SubscriptionId;
}

/// Internal storage for a single subscription.
struct Subscription {
    delegate: DiagnosticDelegate,
    min_level: usize,
}

struct BusInner {
    name: String,
    subscriptions: Mutex<SlotMap<SubscriptionId, Subscription>>,
    contexts: Mutex<Vec<String>>,
}

impl BusInner {
    /// Fan a message out to every qualifying subscriber, with the lock
    /// released before any delegate runs.
    fn deliver(&self, sender: &str, level: usize, message: &str) {
        let delegates: Vec<DiagnosticDelegate> = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .values()
                .filter(|subscription| subscription.min_level <= level)
                .map(|subscription| Arc::clone(&subscription.delegate))
                .collect()
        };
        tracing::trace!(
            target: "ferrule_core::diagnostics",
            sender,
            level,
            subscribers = delegates.len(),
            "delivering diagnostic message"
        );
        for delegate in delegates {
            delegate(sender, level, message);
        }
    }
}

/// A named publisher of leveled diagnostic messages.
///
/// Cloning a bus produces another handle to the same subscriber set and
/// context stack; components hand clones to helpers that need to publish
/// on their behalf.
#[derive(Clone)]
pub struct DiagnosticsBus {
    inner: Arc<BusInner>,
}

impl DiagnosticsBus {
    /// Create a new bus. `name` is attached to every message published
    /// through it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                subscriptions: Mutex::new(SlotMap::with_key()),
                contexts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The sender name attached to published messages.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Subscribe a delegate to messages at or above `min_level`.
    ///
    /// Returns a [`SubscriptionId`] that can be passed to
    /// [`unsubscribe`](Self::unsubscribe) later.
    pub fn subscribe<F>(&self, delegate: F, min_level: usize) -> SubscriptionId
    where
        F: Fn(&str, usize, &str) + Send + Sync + 'static,
    {
        self.subscribe_delegate(Arc::new(delegate), min_level)
    }

    /// Subscribe an already-shared delegate, such as one returned by
    /// [`chain`](Self::chain).
    pub fn subscribe_delegate(
        &self,
        delegate: DiagnosticDelegate,
        min_level: usize,
    ) -> SubscriptionId {
        self.inner.subscriptions.lock().insert(Subscription {
            delegate,
            min_level,
        })
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if the subscription was found and removed. The
    /// subscriber receives nothing published after this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.lock().remove(id).is_some()
    }

    /// Subscribe with automatic removal when the returned guard is dropped.
    pub fn subscribe_scoped<F>(&self, delegate: F, min_level: usize) -> SubscriptionGuard
    where
        F: Fn(&str, usize, &str) + Send + Sync + 'static,
    {
        SubscriptionGuard {
            bus: self.clone(),
            id: self.subscribe(delegate, min_level),
        }
    }

    /// The lowest minimum level over all active subscriptions, or
    /// `usize::MAX` when there are none.
    pub fn min_level(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .values()
            .map(|subscription| subscription.min_level)
            .min()
            .unwrap_or(usize::MAX)
    }

    /// Publish a message to every subscriber whose minimum level allows it.
    ///
    /// The message is prefixed with the active context labels, outermost
    /// first, each separated by `": "`.
    pub fn publish(&self, level: usize, message: impl AsRef<str>) {
        if level < self.min_level() {
            return;
        }
        let message = {
            let contexts = self.inner.contexts.lock();
            let mut prefixed = String::new();
            for context in contexts.iter() {
                prefixed.push_str(context);
                prefixed.push_str(": ");
            }
            prefixed.push_str(message.as_ref());
            prefixed
        };
        self.inner.deliver(&self.inner.name, level, &message);
    }

    /// Return a delegate that forwards messages into this bus's
    /// subscribers, preserving the original sender name and level.
    ///
    /// Subscribing the returned delegate to another bus chains the two
    /// together. Forwarded messages are not prefixed with this bus's
    /// contexts; labels describe the sender that created the message.
    pub fn chain(&self) -> DiagnosticDelegate {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |sender, level, message| {
            inner.deliver(sender, level, message);
        })
    }

    /// Push a label onto the context stack.
    ///
    /// Prefer [`DiagnosticsContext`], which pops on every exit path.
    pub fn push_context(&self, label: impl Into<String>) {
        self.inner.contexts.lock().push(label.into());
    }

    /// Remove the most recently pushed context label.
    pub fn pop_context(&self) {
        self.inner.contexts.lock().pop();
    }
}

impl std::fmt::Debug for DiagnosticsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsBus")
            .field("name", &self.inner.name)
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish()
    }
}

/// A subscription that is removed from its bus when dropped.
///
/// Created by [`DiagnosticsBus::subscribe_scoped`].
pub struct SubscriptionGuard {
    bus: DiagnosticsBus,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    /// The underlying subscription ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let _ = self.bus.unsubscribe(self.id);
    }
}

/// A scope that labels everything published on a bus while it is alive.
///
/// Construction pushes the label, drop pops it, so the label is removed on
/// every exit path including unwinding.
pub struct DiagnosticsContext {
    bus: DiagnosticsBus,
}

impl DiagnosticsContext {
    /// Push `label` onto `bus` for the lifetime of the returned scope.
    pub fn new(bus: &DiagnosticsBus, label: impl Into<String>) -> Self {
        bus.push_context(label);
        Self { bus: bus.clone() }
    }
}

impl Drop for DiagnosticsContext {
    fn drop(&mut self) {
        self.bus.pop_context();
    }
}
