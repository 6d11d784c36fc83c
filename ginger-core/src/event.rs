//! Typed event emitter with namespaced keys and explicit listener handles.
//!
//! Keys are written `name` or `name:namespace`, e.g. `changed:` or
//! `insertBefore:parade:1:animals`. Every registration returns a
//! [`ListenerId`]; callers keep it and hand it back to [`Emitter::off`] when
//! they stop listening.
//!
//! Handlers are invoked after the registry lock is released, so a handler may
//! register or remove listeners on the same emitter.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `(name, namespace)` pair identifying an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub name: String,
    pub namespace: Option<String>,
}

impl EventKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: None }
    }

    /// `name:namespace`, e.g. `resync:zoo:1:animals`.
    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: Some(namespace.into()) }
    }
}

impl From<&str> for EventKey {
    fn from(key: &str) -> Self {
        match key.split_once(':') {
            Some((name, "")) => EventKey::new(name),
            Some((name, ns)) => EventKey::namespaced(name, ns),
            None => EventKey::new(key),
        }
    }
}

impl From<String> for EventKey {
    fn from(key: String) -> Self {
        EventKey::from(key.as_str())
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}", self.name, ns),
            None => write!(f, "{}:", self.name),
        }
    }
}

/// Handle returned by every registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E> {
    id: ListenerId,
    handler: Handler<E>,
    once: bool,
}

pub struct Emitter<E> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKey, Vec<Listener<E>>>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = lock(&self.listeners);
        f.debug_struct("Emitter")
            .field("keys", &listeners.len())
            .field("listeners", &listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register `handler` for `key`. Returns a handle for [`Emitter::off`].
    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(key.into(), Arc::new(handler), false)
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(key.into(), Arc::new(handler), true)
    }

    fn register(&self, key: EventKey, handler: Handler<E>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners)
            .entry(key)
            .or_default()
            .push(Listener { id, handler, once });
        id
    }

    /// Remove a single listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let mut removed = false;
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|l| l.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Remove every listener registered under `key`.
    pub fn off_key(&self, key: impl Into<EventKey>) -> usize {
        lock(&self.listeners)
            .remove(&key.into())
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }

    /// Listeners registered for exactly `key`.
    pub fn listener_count(&self, key: impl Into<EventKey>) -> usize {
        lock(&self.listeners).get(&key.into()).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }

    /// Invoke every handler registered under `key`. Returns how many ran.
    pub fn emit(&self, key: impl Into<EventKey>, event: &E) -> usize {
        let key = key.into();
        let handlers: Vec<Handler<E>> = {
            let mut listeners = lock(&self.listeners);
            let Some(list) = listeners.get_mut(&key) else {
                return 0;
            };
            let handlers = list.iter().map(|l| Arc::clone(&l.handler)).collect();
            list.retain(|l| !l.once);
            if list.is_empty() {
                listeners.remove(&key);
            }
            handlers
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}
