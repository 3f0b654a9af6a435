//! Listener tables with explicit unsubscribe handles.
//!
//! Listeners run synchronously inside `emit`, in registration order. The
//! table lock is released before any listener runs, so a listener may
//! subscribe, unsubscribe or emit again without deadlocking.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

/// Synchronous fan-out to registered listeners.
pub struct Emitter<T> {
    table: Arc<ListenerTable<T>>,
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(ListenerTable {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is dropped or unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.listeners.lock().push((id, Arc::new(listener)));

        let weak: Weak<ListenerTable<T>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = weak.upgrade() {
                table.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Call every listener with `value`. Returns the number of listeners called.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Listener<T>> = self
            .table
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in &snapshot {
            listener(value);
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        self.table.listeners.lock().len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by every `subscribe`/`on_*` call.
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that owns nothing.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Combine several subscriptions into one handle.
    pub fn merge(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || drop(subscriptions))
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for as long as its emitter lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_in_registration_order() {
        let emitter = Emitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let _a = emitter.subscribe(move |v| s1.lock().push(("a", *v)));
        let s2 = seen.clone();
        let _b = emitter.subscribe(move |v| s2.lock().push(("b", *v)));

        assert_eq!(emitter.emit(&7), 2);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let emitter = Emitter::<()>::new();
        let sub = emitter.subscribe(|_| {});
        assert_eq!(emitter.listener_count(), 1);
        drop(sub);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_detach_keeps_listener() {
        let emitter = Emitter::<()>::new();
        emitter.subscribe(|_| {}).detach();
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_reentrantly() {
        let emitter = Arc::new(Emitter::<()>::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_clone = slot.clone();
        let sub = emitter.subscribe(move |_| {
            slot_clone.lock().take();
        });
        *slot.lock() = Some(sub);

        emitter.emit(&());
        assert_eq!(emitter.listener_count(), 0);
    }
}
