//! An in-process bus that republishes pod watch events to subscribers
//! interested in a particular pod.
//!
//! Delivery is bounded: each subscriber has a fixed-size buffer and a send
//! waits at most a timeout before the event is dropped for that subscriber.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use startup_scaler_controller_k8s_api::{Pod, ResourceId};
use tokio::{
    sync::{mpsc, RwLock},
    time,
};

pub const DEFAULT_SEND_TIMEOUT: time::Duration = time::Duration::from_secs(3);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Generic,
}

#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub pod: Arc<Pod>,
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: RwLock<HashMap<Key, Vec<Subscriber>>>,
    send_timeout: time::Duration,
    next_id: AtomicU64,
}

/// Receives events for one pod until it is unsubscribed.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pod: ResourceId,
    kinds: Vec<EventKind>,
    rx: mpsc::Receiver<Event>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Key {
    pod: ResourceId,
    kind: EventKind,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

// === impl EventBus ===

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT)
    }
}

impl EventBus {
    pub fn new(send_timeout: time::Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            send_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(
        &self,
        pod: ResourceId,
        kinds: &[EventKind],
        capacity: usize,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write().await;
        for &kind in kinds {
            subscribers
                .entry(Key {
                    pod: pod.clone(),
                    kind,
                })
                .or_default()
                .push(Subscriber { id, tx: tx.clone() });
        }

        Subscription {
            id,
            pod,
            kinds: kinds.to_vec(),
            rx,
        }
    }

    /// Removes a subscription. Its receiver observes the channel closing once
    /// buffered events are drained.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.write().await;
        for &kind in &subscription.kinds {
            let key = Key {
                pod: subscription.pod.clone(),
                kind,
            };
            if let Some(subs) = subscribers.get_mut(&key) {
                subs.retain(|s| s.id != subscription.id);
                if subs.is_empty() {
                    subscribers.remove(&key);
                }
            }
        }
    }

    /// Removes every subscription.
    pub async fn clear(&self) {
        self.subscribers.write().await.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.values().map(Vec::len).sum()
    }

    /// Delivers `event` to every subscriber of its pod and kind. Each delivery
    /// waits at most `timeout`, or the bus default when `None`.
    pub async fn publish(&self, event: Event, timeout: Option<time::Duration>) {
        let timeout = timeout.unwrap_or(self.send_timeout);
        let key = Key {
            pod: ResourceId::from_pod(&event.pod),
            kind: event.kind,
        };

        let subscribers = self.subscribers.read().await;
        let Some(subs) = subscribers.get(&key) else {
            return;
        };
        for sub in subs {
            match sub.tx.send_timeout(event.clone(), timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(pod = %key.pod, kind = ?key.kind, subscriber = sub.id, ?timeout, "Timed out delivering event");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    tracing::debug!(pod = %key.pod, kind = ?key.kind, subscriber = sub.id, "Subscriber dropped");
                }
            }
        }
    }
}

// === impl Subscription ===

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
