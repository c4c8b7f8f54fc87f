// src/client/store.rs
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::DelegateError;

pub const DEFAULT_MAX_SUBSCRIBERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: T,
    listeners: Vec<(SubscriptionId, Listener<T>)>,
    next_id: u64,
}

/// Shared value with a bounded list of synchronously notified subscribers.
///
/// Listeners run after the lock is released, so they may read the store again.
pub struct Store<T> {
    inner: Mutex<Inner<T>>,
    max_subscribers: usize,
}

impl<T: Clone + Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone> Store<T> {
    pub fn new(value: T) -> Self {
        Self::with_max_subscribers(value, DEFAULT_MAX_SUBSCRIBERS)
    }

    pub fn with_max_subscribers(value: T, max_subscribers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                value,
                listeners: Vec::new(),
                next_id: 0,
            }),
            max_subscribers,
        }
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Replaces the value and notifies every subscriber.
    pub fn set(&self, value: T) {
        let (snapshot, listeners) = {
            let mut inner = self.lock();
            inner.value = value;
            (inner.value.clone(), Self::listeners(&inner))
        };
        notify(&snapshot, &listeners);
    }

    /// Mutates in place; subscribers are notified only when `f` reports a change.
    pub fn modify(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let notification = {
            let mut inner = self.lock();
            if f(&mut inner.value) {
                Some((inner.value.clone(), Self::listeners(&inner)))
            } else {
                None
            }
        };
        match notification {
            Some((snapshot, listeners)) => {
                notify(&snapshot, &listeners);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, DelegateError> {
        let mut inner = self.lock();
        if inner.listeners.len() >= self.max_subscribers {
            return Err(DelegateError::SubscriberLimit(self.max_subscribers));
        }
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _)| *existing != id);
        inner.listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(inner: &Inner<T>) -> Vec<Listener<T>> {
        inner.listeners.iter().map(|(_, l)| l.clone()).collect()
    }
}

fn notify<T>(value: &T, listeners: &[Listener<T>]) {
    for listener in listeners {
        listener(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_see_every_set() {
        let store = Store::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |v| sink.lock().unwrap().push(*v)).unwrap();

        store.set(1);
        store.set(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.get(), 2);
    }

    #[test]
    fn unchanged_modify_is_silent() {
        let store = Store::new(5u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store
            .subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(!store.modify(|_| false));
        assert!(store.modify(|v| {
            *v += 1;
            true
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(), 6);
    }

    #[test]
    fn subscriber_list_is_bounded() {
        let store = Store::with_max_subscribers((), 2);
        let first = store.subscribe(|_| {}).unwrap();
        store.subscribe(|_| {}).unwrap();
        assert!(matches!(
            store.subscribe(|_| {}),
            Err(DelegateError::SubscriberLimit(2))
        ));

        assert!(store.unsubscribe(first));
        assert!(!store.unsubscribe(first));
        assert!(store.subscribe(|_| {}).is_ok());
    }

    #[test]
    fn listener_may_read_the_store() {
        let store = Arc::new(Store::new(0u32));
        let reader = store.clone();
        let observed = Arc::new(AtomicUsize::new(0));
        let out = observed.clone();
        store
            .subscribe(move |_| out.store(reader.get() as usize, Ordering::SeqCst))
            .unwrap();
        store.set(9);
        assert_eq!(observed.load(Ordering::SeqCst), 9);
    }
}
