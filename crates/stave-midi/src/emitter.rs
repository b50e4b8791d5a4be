//! Typed publish/subscribe.
//!
//! An event type implements [`EventMap`]: each variant is one event name and
//! carries that event's payload. Handler tables are copy-on-write behind an
//! `ArcSwap`, so `emit` never takes a lock and always iterates a snapshot.
//! Writers (subscribe/unsubscribe) serialize on a mutex.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// Maps an event value to the name it is published under.
pub trait EventMap: Send + Sync + 'static {
    type Name: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn name(&self) -> Self::Name;
}

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E: EventMap> {
    id: u64,
    handler: Handler<E>,
}

impl<E: EventMap> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

type Table<E> = HashMap<<E as EventMap>::Name, Arc<[Entry<E>]>>;

struct Inner<E: EventMap> {
    table: ArcSwap<Table<E>>,
    write_lock: Mutex<u64>,
}

impl<E: EventMap> Inner<E> {
    /// Apply `f` to a private copy of the list for `name` and publish it.
    fn update<R>(&self, name: E::Name, f: impl FnOnce(&mut Vec<Entry<E>>, &mut u64) -> R) -> R {
        let mut next_id = self.write_lock.lock();
        let current = self.table.load_full();
        let mut entries: Vec<Entry<E>> = current
            .get(&name)
            .map(|list| list.to_vec())
            .unwrap_or_default();

        let result = f(&mut entries, &mut *next_id);

        let mut table = (*current).clone();
        if entries.is_empty() {
            table.remove(&name);
        } else {
            table.insert(name, entries.into());
        }
        self.table.store(Arc::new(table));
        result
    }

    fn remove_id(&self, name: E::Name, id: u64) -> bool {
        self.update(name, |entries, _| {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            entries.len() != before
        })
    }
}

/// Generic typed event emitter. Cloning shares the same handler table.
pub struct EventEmitter<E: EventMap> {
    inner: Arc<Inner<E>>,
}

impl<E: EventMap> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: EventMap> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: ArcSwap::from_pointee(HashMap::new()),
                write_lock: Mutex::new(0),
            }),
        }
    }

    /// Register `handler` for `name`.
    ///
    /// Subscribing the same handler (same `Arc`) twice is idempotent: the
    /// returned subscription refers to the existing registration.
    pub fn subscribe(&self, name: E::Name, handler: Handler<E>) -> Subscription<E> {
        let id = self.inner.update(name, |entries, next_id| {
            if let Some(existing) = entries
                .iter()
                .find(|entry| Arc::ptr_eq(&entry.handler, &handler))
            {
                return existing.id;
            }
            *next_id += 1;
            entries.push(Entry {
                id: *next_id,
                handler,
            });
            *next_id
        });

        Subscription {
            emitter: Arc::downgrade(&self.inner),
            name,
            id,
        }
    }

    /// Convenience wrapper around [`subscribe`](Self::subscribe) for closures.
    pub fn on<F>(&self, name: E::Name, handler: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(handler))
    }

    /// Remove `handler` from `name`. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, name: E::Name, handler: &Handler<E>) -> bool {
        self.inner.update(name, |entries, _| {
            let before = entries.len();
            entries.retain(|entry| !Arc::ptr_eq(&entry.handler, handler));
            entries.len() != before
        })
    }

    /// Invoke every handler registered for the event's name, in subscription
    /// order. Returns the number of handlers invoked.
    ///
    /// Handlers added while this call is running are not invoked by it.
    pub fn emit(&self, event: &E) -> usize {
        let table = self.inner.table.load();
        let Some(entries) = table.get(&event.name()).cloned() else {
            return 0;
        };
        drop(table);

        for entry in entries.iter() {
            (entry.handler)(event);
        }
        entries.len()
    }

    /// Drop all handlers for `name`, or every handler when `name` is `None`.
    pub fn remove_all(&self, name: Option<E::Name>) {
        let _guard = self.inner.write_lock.lock();
        match name {
            Some(name) => {
                let current = self.inner.table.load_full();
                if current.contains_key(&name) {
                    let mut table = (*current).clone();
                    table.remove(&name);
                    self.inner.table.store(Arc::new(table));
                }
            }
            None => self.inner.table.store(Arc::new(HashMap::new())),
        }
    }

    pub fn listener_count(&self, name: E::Name) -> usize {
        self.inner
            .table
            .load()
            .get(&name)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

impl<E: EventMap> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventMap> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.load();
        let counts: HashMap<E::Name, usize> =
            table.iter().map(|(name, list)| (*name, list.len())).collect();
        f.debug_struct("EventEmitter")
            .field("listeners", &counts)
            .finish()
    }
}

/// Handle returned by [`EventEmitter::subscribe`].
///
/// Dropping it does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription<E: EventMap> {
    emitter: Weak<Inner<E>>,
    name: E::Name,
    id: u64,
}

impl<E: EventMap> Subscription<E> {
    /// Returns `false` if already unsubscribed or the emitter is gone.
    pub fn unsubscribe(&self) -> bool {
        match self.emitter.upgrade() {
            Some(inner) => inner.remove_id(self.name, self.id),
            None => false,
        }
    }

    pub fn name(&self) -> E::Name {
        self.name
    }
}

impl<E: EventMap> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}
