//! Fan-out of engine metric events to per-collection stream subscribers.
//!
//! A single actor task owns the subscriber table and multiplexes three
//! queues: subscribe, unsubscribe and events. Each subscriber has its own
//! bounded queue that the actor never waits on; a consumer that stops reading
//! loses its own events and nobody else's.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ControllerError;
use crate::model::MetricEvent;
use crate::shutdown::ShutdownReceiver;

/// Events queued for one subscriber before further events are dropped for it.
const SUBSCRIBER_BUFFER: usize = 256;

pub type SubscriberId = u64;

struct SubscribeRequest {
    collection_id: i64,
    subscriber_id: SubscriberId,
    delivery: mpsc::Sender<MetricEvent>,
    registered: oneshot::Sender<()>,
}

struct UnsubscribeRequest {
    collection_id: i64,
    subscriber_id: SubscriberId,
}

/// Receiving end handed to an API stream consumer.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    collection_id: i64,
    events: mpsc::Receiver<MetricEvent>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub const fn collection_id(&self) -> i64 {
        self.collection_id
    }

    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<MetricEvent> {
        self.events.recv().await
    }
}

/// Cloneable handle used by metric readers and API streams.
#[derive(Debug, Clone)]
pub struct MetricBroker {
    subscribe_tx: mpsc::UnboundedSender<SubscribeRequest>,
    unsubscribe_tx: mpsc::UnboundedSender<UnsubscribeRequest>,
    event_tx: mpsc::UnboundedSender<MetricEvent>,
    next_id: Arc<AtomicU64>,
}

impl MetricBroker {
    /// Start the broker task; it runs until shutdown or until every handle is dropped.
    #[must_use]
    pub fn spawn(shutdown_rx: ShutdownReceiver) -> (Self, JoinHandle<()>) {
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_broker(
            subscribe_rx,
            unsubscribe_rx,
            event_rx,
            shutdown_rx,
        ));
        let broker = Self {
            subscribe_tx,
            unsubscribe_tx,
            event_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (broker, handle)
    }

    /// Register a subscriber; events published after this returns are delivered.
    ///
    /// # Errors
    ///
    /// Returns `BrokerClosed` when the broker task has stopped.
    pub async fn subscribe(&self, collection_id: i64) -> Result<Subscription, ControllerError> {
        let subscriber_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (delivery, events) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (registered, registered_rx) = oneshot::channel();
        self.subscribe_tx
            .send(SubscribeRequest {
                collection_id,
                subscriber_id,
                delivery,
                registered,
            })
            .map_err(|_err| ControllerError::BrokerClosed)?;
        registered_rx
            .await
            .map_err(|_err| ControllerError::BrokerClosed)?;
        Ok(Subscription {
            id: subscriber_id,
            collection_id,
            events,
        })
    }

    /// Remove a subscriber; its receiver ends once queued events drain.
    ///
    /// # Errors
    ///
    /// Returns `BrokerClosed` when the broker task has stopped.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<(), ControllerError> {
        self.unsubscribe_tx
            .send(UnsubscribeRequest {
                collection_id: subscription.collection_id,
                subscriber_id: subscription.id,
            })
            .map_err(|_err| ControllerError::BrokerClosed)
    }

    /// # Errors
    ///
    /// Returns `BrokerClosed` when the broker task has stopped.
    pub fn publish(&self, event: MetricEvent) -> Result<(), ControllerError> {
        self.event_tx
            .send(event)
            .map_err(|_err| ControllerError::BrokerClosed)
    }
}

struct Delivery {
    events: mpsc::Sender<MetricEvent>,
    dropped: u64,
}

type SubscriberTable = HashMap<i64, HashMap<SubscriberId, Delivery>>;

async fn run_broker(
    mut subscribe_rx: mpsc::UnboundedReceiver<SubscribeRequest>,
    mut unsubscribe_rx: mpsc::UnboundedReceiver<UnsubscribeRequest>,
    mut event_rx: mpsc::UnboundedReceiver<MetricEvent>,
    mut shutdown_rx: ShutdownReceiver,
) {
    let mut table: SubscriberTable = HashMap::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            request = subscribe_rx.recv() => {
                let Some(request) = request else { break };
                table
                    .entry(request.collection_id)
                    .or_default()
                    .insert(request.subscriber_id, Delivery {
                        events: request.delivery,
                        dropped: 0,
                    });
                if request.registered.send(()).is_err() {
                    tracing::debug!(
                        "Subscriber {} left collection {} before registration completed",
                        request.subscriber_id,
                        request.collection_id
                    );
                    continue;
                }
                tracing::debug!(
                    "Subscriber {} joined collection {}",
                    request.subscriber_id,
                    request.collection_id
                );
            }
            request = unsubscribe_rx.recv() => {
                let Some(request) = request else { break };
                remove_subscriber(&mut table, request.collection_id, request.subscriber_id);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                deliver(&mut table, event);
            }
        }
    }
    tracing::debug!("Metric broker stopped");
}

fn remove_subscriber(table: &mut SubscriberTable, collection_id: i64, subscriber_id: SubscriberId) {
    let Some(subscribers) = table.get_mut(&collection_id) else {
        return;
    };
    if subscribers.remove(&subscriber_id).is_some() {
        tracing::debug!(
            "Subscriber {} left collection {}",
            subscriber_id,
            collection_id
        );
    }
    if subscribers.is_empty() {
        table.remove(&collection_id);
    }
}

fn deliver(table: &mut SubscriberTable, event: MetricEvent) {
    let collection_id = event.collection_id;
    let Some(subscribers) = table.get_mut(&collection_id) else {
        return;
    };
    subscribers.retain(|subscriber_id, delivery| {
        match delivery.events.try_send(event.clone()) {
            Ok(()) => {
                if delivery.dropped > 0 {
                    tracing::warn!(
                        "Subscriber {} of collection {} resumed after {} dropped events",
                        subscriber_id,
                        collection_id,
                        delivery.dropped
                    );
                    delivery.dropped = 0;
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if delivery.dropped == 0 {
                    tracing::warn!(
                        "Subscriber {} of collection {} is not reading, dropping its events",
                        subscriber_id,
                        collection_id
                    );
                }
                delivery.dropped = delivery.dropped.saturating_add(1);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    });
    if subscribers.is_empty() {
        table.remove(&collection_id);
    }
}
