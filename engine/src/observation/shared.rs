//! One source, many subscribers.

use crate::subscriptions::{DeliveryGate, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Source<T> = Box<dyn Fn(Emitter<T>) -> Subscription + Send + Sync>;

struct SharedState<T> {
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
    last: Option<T>,
    source: Option<Subscription>,
    /// Bumped every time the source starts or stops; emitters of an older
    /// run are ignored.
    generation: u64,
}

/// Reference-counted subscription to a source, replaying the latest value.
///
/// The first subscriber starts the source; later ones share it and receive
/// the latest value right away. When the last subscriber leaves, the source
/// is stopped and the latest value forgotten.
pub struct SharedSubscribable<T> {
    source: Source<T>,
    state: Arc<Mutex<SharedState<T>>>,
    gate: DeliveryGate,
}

/// Sends values from a running source to the current subscribers.
pub struct Emitter<T> {
    state: Weak<Mutex<SharedState<T>>>,
    gate: DeliveryGate,
    generation: u64,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            gate: self.gate.clone(),
            generation: self.generation,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Emitter<T> {
    pub fn emit(&self, value: T) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let _delivering = self.gate.enter();
        let subscribers: Vec<Callback<T>> = {
            let mut state = state.lock();
            if state.generation != self.generation {
                return;
            }
            state.last = Some(value.clone());
            state.subscribers.iter().map(|(_, s)| s.clone()).collect()
        };
        for subscriber in subscribers {
            subscriber(&value);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SharedSubscribable<T> {
    pub fn new(source: impl Fn(Emitter<T>) -> Subscription + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
            state: Arc::new(Mutex::new(SharedState {
                next_id: 0,
                subscribers: Vec::new(),
                last: None,
                source: None,
                generation: 0,
            })),
            gate: DeliveryGate::default(),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let callback: Callback<T> = Arc::new(callback);
        let _delivering = self.gate.enter();

        let (id, start, replay) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push((id, callback.clone()));
            if state.subscribers.len() == 1 {
                state.generation += 1;
                (id, Some(state.generation), None)
            } else {
                (id, None, state.last.clone())
            }
        };

        if let Some(generation) = start {
            let emitter = Emitter {
                state: Arc::downgrade(&self.state),
                gate: self.gate.clone(),
                generation,
            };
            let source = (self.source)(emitter);
            let mut state = self.state.lock();
            if state.generation == generation {
                state.source = Some(source);
            } else {
                drop(state);
                source.unsubscribe();
            }
        } else if let Some(value) = replay {
            callback(&value);
        }

        let state = Arc::downgrade(&self.state);
        Subscription::new(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let stopped = {
                let mut state = state.lock();
                state.subscribers.retain(|(sid, _)| *sid != id);
                if state.subscribers.is_empty() {
                    state.generation += 1;
                    state.last = None;
                    state.source.take()
                } else {
                    None
                }
            };
            if let Some(source) = stopped {
                source.unsubscribe();
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().source.is_some()
    }
}
