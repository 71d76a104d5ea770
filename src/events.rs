//! the in-process event bus. Mirrors `events/tus-events.go`'s
//! `TusEventBroadcaster`: a bounded channel per listener, a blocking
//! sequential fan-out on publish, so a slow subscriber applies backpressure
//! to the whole bus rather than being silently dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::metadata::Metadata;

const BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub enum Event {
    Created { id: String, size: Option<u64>, offset: u64, metadata: Metadata },
    Progress { id: String, size: Option<u64>, offset: u64, metadata: Metadata },
    Finished { id: String, size: Option<u64>, offset: u64, metadata: Metadata },
    Terminated { id: String, size: Option<u64>, offset: u64, metadata: Metadata },
}

impl Event {
    pub fn id(&self) -> &str {
        match self {
            Event::Created { id, .. } | Event::Progress { id, .. } | Event::Finished { id, .. } | Event::Terminated { id, .. } => id,
        }
    }
}

pub type Subscription = mpsc::Receiver<Event>;

/// Opaque handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct EventBus {
    listeners: Mutex<Vec<(SubscriptionId, mpsc::Sender<Event>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { listeners: Mutex::new(Vec::new()), next_id: AtomicU64::new(0), closed: AtomicBool::new(false) }
    }

    /// Registers a new listener and returns its id and receiving half. The
    /// listener is also removed automatically once its receiver is dropped
    /// and a subsequent publish observes the send failing.
    pub fn subscribe(&self) -> (SubscriptionId, Subscription) {
        let (tx, rx) = mpsc::channel(BUFFER_SIZE);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((id, tx));
        (id, rx)
    }

    /// Removes a listener immediately. Idempotent: unsubscribing an id
    /// that's already gone (or was never registered) is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().retain(|(existing, _)| *existing != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Publishes `event` to every live listener in turn, blocking on a full
    /// channel. Listeners whose receiver has been dropped are pruned. A
    /// no-op once `close` has been called.
    pub async fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let senders: Vec<(SubscriptionId, mpsc::Sender<Event>)> = self.listeners.lock().unwrap().clone();
        let mut dead = Vec::new();
        for (id, tx) in &senders {
            if tx.send(event.clone()).await.is_err() {
                dead.push(*id);
            }
        }
        if !dead.is_empty() {
            self.listeners.lock().unwrap().retain(|(id, _)| !dead.contains(id));
        }
    }

    /// Drops every listener and makes subsequent `publish` calls a no-op,
    /// so a publisher never blocks against consumers nobody is draining.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Event {
        Event::Created { id: id.to_owned(), size: Some(10), offset: 0, metadata: Metadata::new() }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();
        bus.publish(sample("a")).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id(), "a");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);
        drop(rx);
        bus.publish(sample("a")).await;
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_the_event() {
        let bus = EventBus::new();
        let (_id1, mut rx1) = bus.subscribe();
        let (_id2, mut rx2) = bus.subscribe();
        bus.publish(sample("x")).await;
        assert_eq!(rx1.recv().await.unwrap().id(), "x");
        assert_eq!(rx2.recv().await.unwrap().id(), "x");
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_listener_immediately() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);
        assert_eq!(bus.listener_count(), 0);

        bus.publish(sample("a")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let (id, _rx) = bus.subscribe();
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn close_drops_listeners_and_publish_becomes_a_no_op() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();
        bus.close();
        assert_eq!(bus.listener_count(), 0);

        bus.publish(sample("a")).await;
        assert!(rx.try_recv().is_err());
    }
}
