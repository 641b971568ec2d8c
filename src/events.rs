//! Session notifications.
//!
//! The client publishes a small set of lifecycle events that UI code reacts to, such as
//! routing back to a login screen. Listeners run synchronously on the emitting task and
//! outside the bus lock, so a listener may subscribe or unsubscribe without deadlocking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Events published on the client's [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// Token refresh failed; the credentials and cache have been cleared.
    SessionExpired,
    /// The host called [`logout`](crate::ApiClient::logout).
    Logout,
}

impl ClientEvent {
    pub fn name(self) -> &'static str {
        match self {
            ClientEvent::SessionExpired => "session-expired",
            ClientEvent::Logout => "logout",
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Publish/subscribe registry owned by one client.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Forward events into a channel. The subscription lapses on its own once the
    /// receiver is dropped and the next event is emitted.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(*event);
        });
        (id, rx)
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: ClientEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        tracing::debug!(event = %event, listeners = snapshot.len(), "client event");
        for listener in snapshot {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("listeners", &self.listener_count()).finish()
    }
}
