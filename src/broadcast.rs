//! Fan-out of rate changes to any number of independent observers.
//!
//! Published readings are numbered and handed to every live subscriber in the
//! same order. Each subscriber has its own mailbox and worker, and its handler
//! runs on the blocking pool, so a slow or panicking handler only ever delays
//! itself. Update N is offered to every subscriber, and the dispatcher waits
//! (up to the delivery timeout) for all of them to finish N before offering
//! N+1.
//!
//! That cross-subscriber ordering only holds within the timeout. A handler
//! that overruns it is left behind, so the others may already see N+1 while
//! it is still on N. It still gets every update, in order, from its own
//! mailbox.

use crate::core::rate::{RateReading, RateUpdate, ReadingOrigin};
use futures::Stream;
use futures::future::join_all;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

type RateHandler = Arc<dyn Fn(&RateUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Delivery {
    update: RateUpdate,
    /// Replayed updates are not part of a barrier and carry no ack.
    ack: Option<oneshot::Sender<()>>,
}

struct SubscriberEntry {
    id: SubscriptionId,
    mailbox: mpsc::UnboundedSender<Delivery>,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    subscribers: Vec<SubscriberEntry>,
    latest: Option<RateUpdate>,
    next_id: u64,
}

impl Registry {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        match self.subscribers.iter().position(|entry| entry.id == id) {
            Some(index) => {
                let entry = self.subscribers.remove(index);
                entry.active.store(false, Ordering::Release);
                debug!(subscription = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }
}

// Handlers never run under this lock, so a poisoned guard still holds
// consistent data.
fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Many-readers broadcast of authoritative rate changes.
///
/// Must be created inside a Tokio runtime.
pub struct ChangeBroadcaster {
    registry: Arc<Mutex<Registry>>,
    publisher: mpsc::UnboundedSender<(RateReading, ReadingOrigin)>,
}

impl ChangeBroadcaster {
    pub fn new(delivery_timeout: Duration) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (publisher, inbox) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::clone(&registry), inbox, delivery_timeout));
        Self {
            registry,
            publisher,
        }
    }

    /// Queues a reading for delivery. Readings that are not a usable price
    /// are dropped here and never reach subscribers.
    pub fn publish(&self, reading: RateReading, origin: ReadingOrigin) -> bool {
        if !reading.is_valid() {
            debug!(value = reading.value_usd, "Not broadcasting unusable rate");
            return false;
        }
        self.publisher.send((reading, origin)).is_ok()
    }

    /// Registers `handler`. If an update has already been delivered, the
    /// latest one is replayed to the new handler first.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RateUpdate) + Send + Sync + 'static,
    {
        let (mailbox, deliveries) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let id = {
            let mut registry = lock(&self.registry);
            let id = SubscriptionId(registry.next_id);
            registry.next_id += 1;
            if let Some(latest) = registry.latest {
                let _ = mailbox.send(Delivery {
                    update: latest,
                    ack: None,
                });
            }
            registry.subscribers.push(SubscriberEntry {
                id,
                mailbox,
                active: Arc::clone(&active),
            });
            id
        };
        debug!(subscription = %id, "Subscriber added");

        tokio::spawn(run_subscriber(
            id,
            Arc::new(handler),
            Arc::clone(&active),
            deliveries,
        ));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            active,
        }
    }

    /// Removes a handler. Safe to call from inside that handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.registry).remove(id)
    }

    /// Updates as a stream; the stream owns its subscription.
    pub fn changes(&self) -> RateStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |update| {
            let _ = sender.send(*update);
        });
        RateStream {
            receiver,
            _subscription: subscription,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT)
    }
}

async fn dispatch(
    registry: Arc<Mutex<Registry>>,
    mut inbox: mpsc::UnboundedReceiver<(RateReading, ReadingOrigin)>,
    delivery_timeout: Duration,
) {
    let mut sequence = 0u64;
    while let Some((reading, origin)) = inbox.recv().await {
        sequence += 1;
        let update = RateUpdate {
            reading,
            origin,
            sequence,
        };

        let pending = {
            let mut registry = lock(&registry);
            registry.latest = Some(update);
            let mut pending = Vec::with_capacity(registry.subscribers.len());
            registry.subscribers.retain(|entry| {
                let (ack, done) = oneshot::channel();
                let delivery = Delivery {
                    update,
                    ack: Some(ack),
                };
                match entry.mailbox.send(delivery) {
                    Ok(()) => {
                        pending.push((entry.id, done));
                        true
                    }
                    Err(_) => {
                        debug!(subscription = %entry.id, "Dropping dead subscriber");
                        false
                    }
                }
            });
            pending
        };
        debug!(sequence, subscribers = pending.len(), "Delivering rate update");

        join_all(pending.into_iter().map(|(id, done)| async move {
            if timeout(delivery_timeout, done).await.is_err() {
                warn!(
                    subscription = %id,
                    sequence,
                    "Subscriber is slow, continuing without waiting"
                );
            }
        }))
        .await;
    }
    debug!("Broadcaster closed");
}

async fn run_subscriber(
    id: SubscriptionId,
    handler: RateHandler,
    active: Arc<AtomicBool>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }
        let handler = Arc::clone(&handler);
        let update = delivery.update;
        if let Err(e) = tokio::task::spawn_blocking(move || handler(&update)).await {
            error!(subscription = %id, sequence = update.sequence, error = %e, "Rate subscriber failed");
        }
        if let Some(ack) = delivery.ack {
            let _ = ack.send(());
        }
    }
}

/// Handle to one registered handler; dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Mutex<Registry>>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes the handler now; returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.detach()
    }

    fn detach(&mut self) -> bool {
        self.active.store(false, Ordering::Release);
        self.registry
            .upgrade()
            .is_some_and(|registry| lock(&registry).remove(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Stream of rate updates backed by its own subscription.
pub struct RateStream {
    receiver: mpsc::UnboundedReceiver<RateUpdate>,
    _subscription: Subscription,
}

impl Stream for RateStream {
    type Item = RateUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
