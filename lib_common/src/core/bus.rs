//! # Publish/Subscribe Bus
//!
//! In-process fan-out between the connection manager (the only producer) and
//! any number of subscriber adapters.
//!
//! ## Core Design Principles:
//!
//! 1.  **Typed topics**: one registration method per topic (`on_status`,
//!     `on_data`, `on_event`), each returning a `Subscription` handle. There is
//!     no stringly-typed event name anywhere.
//!
//! 2.  **Zero-Copy Fan-out**: a published record is wrapped in an `Arc` once;
//!     every listener receives a clone of the pointer, never of the record.
//!
//! 3.  **Synchronous unregister**: listeners are invoked while the listener
//!     list is locked, and unsubscribing takes the same lock. Once
//!     `Subscription::unsubscribe` (or its `Drop`) returns, that callback will
//!     never run again.
//!
//! Callbacks must not block and must not call back into the bus. The
//! subscriber adapter satisfies both by forwarding into an unbounded channel.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::weather::model::{Observation, StatusEvent, WeatherEvent};

/// The three bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connection/health transitions.
    Status,
    /// Normalized observations.
    Data,
    /// Discrete weather events.
    Event,
}

/// Any record carried by the bus, tagged by topic.
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// See `Topic::Status`.
    Status(Arc<StatusEvent>),
    /// See `Topic::Data`.
    Data(Arc<Observation>),
    /// See `Topic::Event`.
    Event(Arc<WeatherEvent>),
}

impl BusMessage {
    /// Topic this message travels on.
    pub fn topic(&self) -> Topic {
        match self {
            BusMessage::Status(_) => Topic::Status,
            BusMessage::Data(_) => Topic::Data,
            BusMessage::Event(_) => Topic::Event,
        }
    }
}

type Callback<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;

struct Listener<T> {
    id: u64,
    callback: Callback<T>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    status: Vec<Listener<StatusEvent>>,
    data: Vec<Listener<Observation>>,
    event: Vec<Listener<WeatherEvent>>,
}

impl Listeners {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, topic: Topic, id: u64) -> bool {
        fn retain<T>(list: &mut Vec<Listener<T>>, id: u64) -> bool {
            let before = list.len();
            list.retain(|l| l.id != id);
            list.len() != before
        }

        match topic {
            Topic::Status => retain(&mut self.status, id),
            Topic::Data => retain(&mut self.data, id),
            Topic::Event => retain(&mut self.event, id),
        }
    }
}

fn deliver<T>(listeners: &[Listener<T>], record: &Arc<T>) -> usize {
    for listener in listeners {
        (listener.callback)(record);
    }
    listeners.len()
}

/// # Core Bus
///
/// Cheap to clone; all clones share one listener list.
#[derive(Clone, Default)]
pub struct Bus {
    listeners: Arc<Mutex<Listeners>>,
}

impl Bus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        // A panicking callback poisons the lock but leaves the list intact.
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscription(&self, topic: Topic, id: u64) -> Subscription {
        Subscription {
            id,
            topic,
            listeners: Arc::downgrade(&self.listeners),
            active: true,
        }
    }

    /// Registers a callback for `status` records.
    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<StatusEvent>) + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        let id = listeners.allocate_id();
        listeners.status.push(Listener {
            id,
            callback: Box::new(callback),
        });
        drop(listeners);
        self.subscription(Topic::Status, id)
    }

    /// Registers a callback for `data` records.
    pub fn on_data<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<Observation>) + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        let id = listeners.allocate_id();
        listeners.data.push(Listener {
            id,
            callback: Box::new(callback),
        });
        drop(listeners);
        self.subscription(Topic::Data, id)
    }

    /// Registers a callback for `event` records.
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<WeatherEvent>) + Send + Sync + 'static,
    {
        let mut listeners = self.lock();
        let id = listeners.allocate_id();
        listeners.event.push(Listener {
            id,
            callback: Box::new(callback),
        });
        drop(listeners);
        self.subscription(Topic::Event, id)
    }

    /// Registers one callback for all three topics.
    pub fn on_all<F>(&self, callback: F) -> Vec<Subscription>
    where
        F: Fn(BusMessage) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let status_cb = Arc::clone(&callback);
        let data_cb = Arc::clone(&callback);
        vec![
            self.on_status(move |s| status_cb(BusMessage::Status(Arc::clone(s)))),
            self.on_data(move |d| data_cb(BusMessage::Data(Arc::clone(d)))),
            self.on_event(move |e| callback(BusMessage::Event(Arc::clone(e)))),
        ]
    }

    /// Delivers a status record to every status listener. Returns how many
    /// listeners were called.
    pub fn publish_status(&self, status: StatusEvent) -> usize {
        let record = Arc::new(status);
        deliver(&self.lock().status, &record)
    }

    /// Delivers an observation to every data listener.
    pub fn publish_data(&self, observation: Observation) -> usize {
        let record = Arc::new(observation);
        deliver(&self.lock().data, &record)
    }

    /// Delivers a weather event to every event listener.
    pub fn publish_event(&self, event: WeatherEvent) -> usize {
        let record = Arc::new(event);
        deliver(&self.lock().event, &record)
    }

    /// Total registered callbacks across all topics.
    pub fn listener_count(&self) -> usize {
        let listeners = self.lock();
        listeners.status.len() + listeners.data.len() + listeners.event.len()
    }
}

/// Handle returned by every registration. Unsubscribes on `unsubscribe()` or
/// when dropped.
pub struct Subscription {
    id: u64,
    topic: Topic,
    listeners: Weak<Mutex<Listeners>>,
    active: bool,
}

impl Subscription {
    /// Topic this subscription listens on.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Removes the callback. Synchronous: no delivery happens after return.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.remove(self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weather::model::ConnectionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&c), c)
    }

    #[test]
    fn topics_are_isolated() {
        let bus = Bus::new();
        let (status_hits, s) = counter();
        let (data_hits, d) = counter();
        let _a = bus.on_status(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let _b = bus.on_data(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_status(StatusEvent::global(ConnectionStatus::Connected, None));
        bus.publish_status(StatusEvent::global(ConnectionStatus::Disconnected, None));
        bus.publish_data(Observation::default());

        assert_eq!(status_hits.load(Ordering::SeqCst), 2);
        assert_eq!(data_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_delivery_after_unsubscribe() {
        let bus = Bus::new();
        let (hits, h) = counter();
        let sub = bus.on_data(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_data(Observation::default());
        sub.unsubscribe();

        for _ in 0..5 {
            assert_eq!(bus.publish_data(Observation::default()), 0);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let bus = Bus::new();
        {
            let _subs = bus.on_all(|_| {});
            assert_eq!(bus.listener_count(), 3);
        }
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn one_record_is_shared_by_all_listeners() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::<Arc<Observation>>::new()));
        let mut subs = Vec::new();
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            subs.push(bus.on_data(move |obs| seen.lock().unwrap().push(Arc::clone(obs))));
        }
        assert_eq!(bus.publish_data(Observation::default()), 3);

        let seen = seen.lock().unwrap();
        assert!(Arc::ptr_eq(&seen[0], &seen[1]));
        assert!(Arc::ptr_eq(&seen[1], &seen[2]));
    }
}
