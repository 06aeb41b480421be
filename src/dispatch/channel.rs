use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rumqttc::QoS;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::consumer::{Consumer, ConsumerError};
use crate::mqtt::message_manager::InboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Outcome of a single [`DispatchChannel::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Consumers whose queue accepted the message
    pub delivered: usize,
    /// QoS 0 copies dropped because a consumer queue was full
    pub dropped: usize,
}

struct ConsumerSlot {
    id: ConsumerId,
    name: String,
    sender: mpsc::Sender<Arc<InboundMessage>>,
    worker: JoinHandle<()>,
}

struct ChannelInner {
    capacity: usize,
    next_id: AtomicU64,
    slots: RwLock<Vec<ConsumerSlot>>,
}

/// In-process handoff between the bridge and its consumers.
///
/// Every registered consumer gets a bounded FIFO queue and a blocking worker
/// that drains it, so a slow or failing consumer only affects its own queue.
///
/// ```text
///                       ┌─► [queue] ─► worker ─► Consumer A
/// Bridge ─► publish() ──┤
///                       └─► [queue] ─► worker ─► Consumer B
/// ```
///
/// Cloning is cheap and every clone refers to the same set of consumers.
#[derive(Clone)]
pub struct DispatchChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for DispatchChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchChannel")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl DispatchChannel {
    /// `capacity` is the queue size of each consumer; 0 is bumped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                slots: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers a consumer and starts its worker.
    ///
    /// The worker runs on the runtime's blocking pool so a slow `consume` never
    /// occupies a thread the bridge task needs. Must be called from within a
    /// tokio runtime.
    pub async fn register<C: Consumer>(&self, consumer: C) -> ConsumerId {
        let id = ConsumerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = consumer.name().to_string();
        let (sender, receiver) = mpsc::channel(self.inner.capacity);

        let consumer: Box<dyn Consumer> = Box::new(consumer);
        let worker = task::spawn_blocking(move || run_consumer(id, consumer, receiver));

        self.inner.slots.write().await.push(ConsumerSlot {
            id,
            name: name.clone(),
            sender,
            worker,
        });
        info!("Registered {} ({})", id, name);
        id
    }

    /// Removes a consumer. Messages already queued for it are still processed.
    pub async fn unregister(&self, id: ConsumerId) -> bool {
        let mut slots = self.inner.slots.write().await;
        match slots.iter().position(|slot| slot.id == id) {
            Some(idx) => {
                let slot = slots.remove(idx);
                info!("Unregistered {} ({})", slot.id, slot.name);
                true
            }
            None => false,
        }
    }

    pub async fn consumer_count(&self) -> usize {
        self.inner.slots.read().await.len()
    }

    /// Hands `message` to every registered consumer.
    ///
    /// QoS 1 and 2 wait for queue space, QoS 0 copies are dropped when a queue is full.
    pub async fn publish(&self, message: InboundMessage) -> DispatchReport {
        let targets: Vec<(ConsumerId, mpsc::Sender<Arc<InboundMessage>>)> = {
            let slots = self.inner.slots.read().await;
            slots
                .iter()
                .map(|slot| (slot.id, slot.sender.clone()))
                .collect()
        };

        let mut report = DispatchReport::default();
        if targets.is_empty() {
            debug!("No consumers registered, discarding message on {}", message.topic);
            return report;
        }

        let at_most_once = message.qos == QoS::AtMostOnce;
        let message = Arc::new(message);
        let mut closed = Vec::new();

        for (id, sender) in targets {
            if at_most_once {
                match sender.try_send(Arc::clone(&message)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Queue of {} is full, dropping QoS 0 message", id);
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed.push(id),
                }
            } else {
                match sender.send(Arc::clone(&message)).await {
                    Ok(()) => report.delivered += 1,
                    Err(_) => closed.push(id),
                }
            }
        }

        if !closed.is_empty() {
            let mut slots = self.inner.slots.write().await;
            slots.retain(|slot| {
                let keep = !closed.contains(&slot.id);
                if !keep {
                    warn!("Worker of {} ({}) is gone, removing it", slot.id, slot.name);
                }
                keep
            });
        }

        debug!(
            "Dispatched message on {} to {} consumer(s), {} dropped",
            message.topic, report.delivered, report.dropped
        );
        report
    }

    /// Removes all consumers and waits until their queues are drained.
    pub async fn shutdown(&self) {
        let slots: Vec<ConsumerSlot> = self.inner.slots.write().await.drain(..).collect();
        info!("Shutting down dispatch channel with {} consumer(s)", slots.len());

        for slot in slots {
            let ConsumerSlot {
                id,
                name,
                sender,
                worker,
            } = slot;
            drop(sender);
            if let Err(e) = worker.await {
                error!("Worker of {} ({}) terminated abnormally: {}", id, name, e);
            }
        }
    }
}

fn run_consumer(
    id: ConsumerId,
    mut consumer: Box<dyn Consumer>,
    mut receiver: mpsc::Receiver<Arc<InboundMessage>>,
) {
    debug!("Worker of {} started", id);

    while let Some(message) = receiver.blocking_recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| consumer.consume(&message)))
            .unwrap_or_else(|panic| Err(ConsumerError::Panicked(panic_message(panic.as_ref()))));

        if let Err(e) = outcome {
            error!(
                "{} ({}) failed on message from {}: {}",
                id,
                consumer.name(),
                message.topic,
                e
            );
        }
    }

    debug!("Worker of {} finished", id);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
