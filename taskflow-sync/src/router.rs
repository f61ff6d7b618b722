//! Name-keyed observer table.
//!
//! Handlers for the same event run in registration order, once per inbound
//! message. Nothing is buffered: a handler registered after a message was
//! dispatched never sees it. Unknown event names are ignored.
//!
//! Every registration returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the handler, so a discarded owner
//! never leaves a live callback behind.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use serde_json::Value;

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Table<T> {
    next_id: u64,
    routes: HashMap<String, Vec<(u64, Handler<T>)>>,
    /// Handlers currently executing, per dispatching thread
    running: HashMap<ThreadId, usize>,
}

impl<T> Table<T> {
    fn remove(&mut self, event: &str, id: u64) {
        if let Some(handlers) = self.routes.get_mut(event) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                self.routes.remove(event);
            }
        }
    }

    fn contains(&self, event: &str, id: u64) -> bool {
        self.routes
            .get(event)
            .is_some_and(|handlers| handlers.iter().any(|(hid, _)| *hid == id))
    }
}

struct Shared<T> {
    table: Mutex<Table<T>>,
    idle: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks one handler as executing until dropped.
struct Running<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for Running<'_, T> {
    fn drop(&mut self) {
        let mut table = self.shared.lock();
        let me = thread::current().id();
        if let Some(count) = table.running.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                table.running.remove(&me);
            }
        }
        self.shared.idle.notify_all();
    }
}

/// Dispatch table from event name to handlers. Cloning shares the table.
pub struct EventRouter<T = Value> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventRouter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> Default for EventRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EventRouter<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table {
                    next_id: 0,
                    routes: HashMap::new(),
                    running: HashMap::new(),
                }),
                idle: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        self.shared.lock()
    }

    /// Register `handler` for `event`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = {
            let mut table = self.lock();
            let id = table.next_id;
            table.next_id += 1;
            table
                .routes
                .entry(event.clone())
                .or_default()
                .push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.lock().remove(&event, id);
                }
            })),
        }
    }

    /// Remove every handler for `event`. Returns how many were removed.
    pub fn off(&self, event: &str) -> usize {
        self.lock().routes.remove(event).map_or(0, |h| h.len())
    }

    /// Remove every handler for every event.
    ///
    /// Blocks until handlers already running on other threads return, so
    /// no handler of this router executes once `clear` has returned. A
    /// handler may call `clear` on its own router.
    pub fn clear(&self) {
        let me = thread::current().id();
        let mut table = self.lock();
        table.routes.clear();
        let mine = table.running.remove(&me);
        while !table.running.is_empty() {
            table = self
                .shared
                .idle
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(count) = mine {
            table.running.insert(me, count);
        }
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().routes.get(event).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().routes.is_empty()
    }

    /// Claim a handler for execution if it is still registered.
    fn enter(&self, event: &str, id: u64) -> Option<Running<'_, T>> {
        let mut table = self.lock();
        if !table.contains(event, id) {
            return None;
        }
        *table.running.entry(thread::current().id()).or_insert(0) += 1;
        Some(Running {
            shared: &self.shared,
        })
    }

    /// Invoke every handler for `event`. Returns how many ran.
    ///
    /// Handlers run outside the table lock, so they may subscribe or
    /// unsubscribe without deadlocking. A handler removed while an earlier
    /// one runs is skipped.
    pub fn dispatch(&self, event: &str, payload: &T) -> usize {
        let handlers: Vec<(u64, Handler<T>)> = match self.lock().routes.get(event) {
            Some(handlers) => handlers.clone(),
            None => {
                log::trace!("no handlers for {event}");
                return 0;
            }
        };
        let mut ran = 0;
        for (id, handler) in &handlers {
            let Some(_running) = self.enter(event, *id) else {
                continue;
            };
            handler(payload);
            ran += 1;
        }
        ran
    }
}

/// Registration handle. Releasing it removes exactly one handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Keep the handler registered for the router's lifetime.
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
