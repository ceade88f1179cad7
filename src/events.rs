//! Event listener registry.
//!
//! Provides a per-instance pub/sub facility mapping an event kind to an
//! ordered list of listeners. Dispatch is synchronous and always runs
//! against a snapshot of the listener list taken before the first listener
//! is invoked, so listeners may add or remove listeners (or dispatch again)
//! without affecting the pass in progress.
//!
//! # Usage
//!
//! ```ignore
//! let target = EventTarget::<TransportEvent>::new();
//!
//! let id = target.add_event_listener(TransportEventKind::Open, |_| {
//!     log::info!("socket open");
//! });
//!
//! target.dispatch_event(&TransportEvent::Open);
//! target.remove_event_listener(TransportEventKind::Open, id);
//! ```
//!
//! # Default action
//!
//! A listener registered with [`EventTarget::add_event_listener_with`]
//! returns a [`DefaultAction`]. `dispatch_event` returns `false` if any
//! listener returned [`DefaultAction::Prevent`], `true` otherwise. Every
//! listener in the snapshot runs regardless.
//!
//! # Deadlock Prevention
//!
//! [`EventTarget`] collects the listeners under its lock, then releases the
//! lock before invoking any of them.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An event that can be dispatched through an [`EventRegistry`].
pub trait Event: 'static {
    /// Discriminant used to key listener lists.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The kind of this event.
    fn kind(&self) -> Self::Kind;
}

/// Value returned by a listener to allow or suppress the default action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultAction {
    /// Let the default action proceed.
    #[default]
    Allow,
    /// Mark the event as "default prevented".
    Prevent,
}

/// Unique identifier for a registered listener.
///
/// Returned by `add_event_listener`; pass it back to
/// `remove_event_listener` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt_{}", self.0)
    }
}

/// A registered listener callback.
pub type Listener<E> = Arc<dyn Fn(&E) -> DefaultAction + Send + Sync>;

/// Storage for event listeners, keyed by event kind.
pub struct EventRegistry<E: Event> {
    /// Map of event kind -> ordered list of (listener_id, listener).
    listeners: HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>,
    /// Counter for generating unique listener IDs.
    next_id: u64,
}

impl<E: Event> Default for EventRegistry<E> {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<E: Event> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("kinds", &self.listeners.len())
            .field("total_listeners", &self.listener_count())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<E: Event> EventRegistry<E> {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that never prevents the default action.
    ///
    /// Registering the same closure twice queues it twice.
    pub fn add_event_listener<F>(&mut self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add_event_listener_with(kind, move |event| {
            callback(event);
            DefaultAction::Allow
        })
    }

    /// Register a listener whose return value may prevent the default action.
    pub fn add_event_listener_with<F>(&mut self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) -> DefaultAction + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(callback))
    }

    /// Register an already shared listener.
    ///
    /// The same `Arc` may be registered more than once; each registration
    /// gets its own id and is invoked once per dispatch.
    pub fn add_listener(&mut self, kind: E::Kind, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        self.listeners.entry(kind).or_default().push((id, listener));

        log::trace!("Registered listener '{}' for {:?}", id, kind);
        id
    }

    /// Remove a listener.
    ///
    /// Safe to call with a kind or id that isn't registered (returns `false`).
    pub fn remove_event_listener(&mut self, kind: E::Kind, id: ListenerId) -> bool {
        let Some(stack) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let Some(index) = stack.iter().position(|(listener_id, _)| *listener_id == id) else {
            return false;
        };
        stack.remove(index);
        if stack.is_empty() {
            self.listeners.remove(&kind);
        }
        log::trace!("Unregistered listener '{}' for {:?}", id, kind);
        true
    }

    /// Copy of the listeners currently registered for `kind`, in order.
    #[must_use]
    pub fn snapshot(&self, kind: E::Kind) -> Vec<Listener<E>> {
        self.listeners
            .get(&kind)
            .map(|stack| stack.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// Invoke every listener registered for the event's kind.
    ///
    /// Returns `false` if any listener prevented the default action.
    pub fn dispatch_event(&self, event: &E) -> bool {
        invoke_all(&self.snapshot(event.kind()), event)
    }

    /// Check if any listeners are registered for a kind.
    #[must_use]
    pub fn has_listeners(&self, kind: E::Kind) -> bool {
        self.listeners.get(&kind).is_some_and(|v| !v.is_empty())
    }

    /// Total number of registered listeners across all kinds.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }
}

/// Run each listener in order, aggregating the default-action verdicts.
fn invoke_all<E>(listeners: &[Listener<E>], event: &E) -> bool {
    let mut prevented = false;
    for listener in listeners {
        if listener(event) == DefaultAction::Prevent {
            prevented = true;
        }
    }
    !prevented
}

/// Thread-safe event target.
///
/// Wraps an [`EventRegistry`] behind a mutex that is never held while a
/// listener runs.
pub struct EventTarget<E: Event> {
    registry: Mutex<EventRegistry<E>>,
}

impl<E: Event> Default for EventTarget<E> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(EventRegistry::new()),
        }
    }
}

impl<E: Event> fmt::Debug for EventTarget<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("registry", &*self.lock())
            .finish()
    }
}

impl<E: Event> EventTarget<E> {
    /// Create a new event target with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EventRegistry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`EventRegistry::add_event_listener`].
    pub fn add_event_listener<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.lock().add_event_listener(kind, callback)
    }

    /// See [`EventRegistry::add_event_listener_with`].
    pub fn add_event_listener_with<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) -> DefaultAction + Send + Sync + 'static,
    {
        self.lock().add_event_listener_with(kind, callback)
    }

    /// See [`EventRegistry::add_listener`].
    pub fn add_listener(&self, kind: E::Kind, listener: Listener<E>) -> ListenerId {
        self.lock().add_listener(kind, listener)
    }

    /// See [`EventRegistry::remove_event_listener`].
    pub fn remove_event_listener(&self, kind: E::Kind, id: ListenerId) -> bool {
        self.lock().remove_event_listener(kind, id)
    }

    /// Dispatch an event to a snapshot of the registered listeners.
    pub fn dispatch_event(&self, event: &E) -> bool {
        let listeners = self.lock().snapshot(event.kind());
        // Lock released here
        invoke_all(&listeners, event)
    }

    /// See [`EventRegistry::has_listeners`].
    #[must_use]
    pub fn has_listeners(&self, kind: E::Kind) -> bool {
        self.lock().has_listeners(kind)
    }

    /// See [`EventRegistry::listener_count`].
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listener_count()
    }
}
