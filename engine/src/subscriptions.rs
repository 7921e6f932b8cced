//! Callback registries and subscription handles.

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A list of callbacks notified in subscription order.
///
/// Callbacks run outside the registry lock, so they may subscribe or
/// unsubscribe while being notified.
pub struct Subscribers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.push((id, Arc::new(callback)));
            id
        };

        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().callbacks.retain(|(cid, _)| *cid != id);
            }
        })
    }

    /// Notify every current subscriber.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .registry
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    /// Drop every callback. Outstanding [`Subscription`]s become no-ops.
    pub fn clear(&self) {
        self.registry.lock().callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.registry.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to an active subscription.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
/// Unsubscribing more than once is a no-op.
#[must_use = "a subscription stays active until unsubscribe() is called"]
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn empty() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    /// One handle cancelling all of `subscriptions`, in order.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        })
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }

    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

/// Orders deliveries to one subscriber.
///
/// Hold [`DeliveryGate::enter`] while delivering; a delivery from another
/// thread waits for the current one to finish. Used so that an initial value
/// always reaches a subscriber before anything emitted after subscribing.
/// Re-entering from the delivering thread does not block.
#[derive(Clone, Default)]
pub(crate) struct DeliveryGate(Arc<ReentrantMutex<()>>);

impl DeliveryGate {
    pub(crate) fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_in_subscription_order() {
        let subscribers = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            subscribers.subscribe(move |v| seen.lock().push(("a", *v)))
        };
        let b = {
            let seen = seen.clone();
            subscribers.subscribe(move |v| seen.lock().push(("b", *v)))
        };

        subscribers.emit(&1);
        a.unsubscribe();
        subscribers.emit(&2);

        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("b", 2)]);
        b.unsubscribe();
        assert!(subscribers.is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let calls = calls.clone();
            Subscription::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(subscription.is_active());
        subscription.unsubscribe();
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
    }

    #[test]
    fn callbacks_may_unsubscribe_themselves() {
        let subscribers = Subscribers::<()>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let slot = slot.clone();
            let calls = calls.clone();
            subscribers.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().take() {
                    own.unsubscribe();
                }
            })
        };
        *slot.lock() = Some(subscription);

        subscribers.emit(&());
        subscribers.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn combined_handle() {
        let subscribers = Subscribers::<()>::new();
        let all = Subscription::all(vec![
            subscribers.subscribe(|_| {}),
            subscribers.subscribe(|_| {}),
        ]);
        assert_eq!(subscribers.len(), 2);
        all.unsubscribe();
        assert!(subscribers.is_empty());
    }
}
