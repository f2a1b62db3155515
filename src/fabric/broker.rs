//! Broker contract and an in-process implementation.

use super::selector::Selector;
use super::types::{Delivery, DeliveryTag, QueueSpec, WireMessage};
use crate::error::{Result, SyncError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Publishing side of the bus plus queue administration.
pub trait Broker: Send + Sync {
    /// Check the broker is reachable (initial connection).
    fn connect(&self) -> Result<()>;

    /// Send to a virtual topic; fans out to every bound queue whose selector matches.
    fn publish(&self, topic: &str, message: WireMessage) -> Result<()>;

    /// Percentage of the broker's storage quota in use.
    fn storage_usage_percent(&self) -> Result<u8>;

    /// Declare (or reattach to) a queue and open a consuming session on it.
    fn subscribe(&self, spec: QueueSpec) -> Result<Box<dyn Session>>;

    /// Drop queued (not in-flight) messages matching `predicate`. Best effort.
    fn purge(&self, queue: &str, predicate: &dyn Fn(&WireMessage) -> bool) -> Result<usize>;

    fn delete_queue(&self, queue: &str) -> Result<()>;
}

/// One consumer's session on its queue. Deliveries are handed out one at a time.
pub trait Session: Send {
    fn queue_name(&self) -> &str;

    /// Next delivery, or `None` if nothing arrived within `timeout`.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    fn acknowledge(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Return every unacknowledged delivery to the queue for redelivery.
    fn recover(&mut self) -> Result<()>;

    /// Narrow or widen the queue's selector going forward.
    fn set_selector(&mut self, selector: Selector) -> Result<()>;

    /// Close the session. Non-durable queues are torn down.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Default storage quota (messages) of a `MemoryBroker`.
const DEFAULT_CAPACITY: usize = 100_000;

/// Queued message ordered by priority, then FIFO.
struct Pending {
    priority: u8,
    seq: u64,
    redelivered: bool,
    message: WireMessage,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<Pending>,
    in_flight: BTreeMap<DeliveryTag, Pending>,
}

struct Queue {
    name: String,
    topic: String,
    durable: bool,
    prefetch: usize,
    selector: RwLock<Selector>,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Queue {
    fn stored(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.in_flight.len()
    }
}

struct BrokerInner {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    next_seq: AtomicU64,
    next_tag: AtomicU64,
    capacity: usize,
    available: AtomicBool,
}

impl BrokerInner {
    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::BrokerUnavailable("connection refused".into()))
        }
    }
}

/// In-process broker with virtual-topic fan-out, priorities, client
/// acknowledgement and session recovery.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Broker whose storage quota is `capacity` stored messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                next_tag: AtomicU64::new(1),
                capacity: capacity.max(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the broker going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Messages queued or in flight on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .queues
            .read()
            .get(queue)
            .map_or(0, |q| q.stored())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.queues.read().contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.queues.read().len()
    }

    /// Current selector of `queue`.
    pub fn selector_of(&self, queue: &str) -> Option<Selector> {
        self.inner
            .queues
            .read()
            .get(queue)
            .map(|q| q.selector.read().clone())
    }

    fn enqueue(&self, queue: &Queue, message: WireMessage) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut state = queue.state.lock();
        state.pending.push(Pending {
            priority: message.priority,
            seq,
            redelivered: false,
            message,
        });
        queue.ready.notify_one();
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn connect(&self) -> Result<()> {
        self.inner.check_available()
    }

    fn publish(&self, topic: &str, message: WireMessage) -> Result<()> {
        self.inner.check_available()?;

        let targets: Vec<Arc<Queue>> = self
            .inner
            .queues
            .read()
            .values()
            .filter(|q| q.topic == topic && q.selector.read().matches(&message))
            .cloned()
            .collect();

        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    fn storage_usage_percent(&self) -> Result<u8> {
        self.inner.check_available()?;
        let stored: usize = self
            .inner
            .queues
            .read()
            .values()
            .map(|q| q.stored())
            .sum();
        let percent = (stored.saturating_mul(100) / self.inner.capacity).min(100);
        Ok(percent as u8)
    }

    fn subscribe(&self, spec: QueueSpec) -> Result<Box<dyn Session>> {
        self.inner.check_available()?;

        let queue = {
            let mut queues = self.inner.queues.write();
            let queue = queues
                .entry(spec.name.clone())
                .or_insert_with(|| {
                    info!(queue = %spec.name, topic = %spec.topic, durable = spec.durable, "Queue declared");
                    Arc::new(Queue {
                        name: spec.name.clone(),
                        topic: spec.topic.clone(),
                        durable: spec.durable,
                        prefetch: spec.prefetch.max(1),
                        selector: RwLock::new(Selector::default()),
                        state: Mutex::new(QueueState::default()),
                        ready: Condvar::new(),
                    })
                })
                .clone();
            *queue.selector.write() = spec.selector;
            queue
        };

        debug!(queue = %queue.name, selector = %queue.selector.read().expression(), "Session opened");

        Ok(Box::new(MemorySession {
            broker: self.clone(),
            queue,
        }))
    }

    fn purge(&self, queue: &str, predicate: &dyn Fn(&WireMessage) -> bool) -> Result<usize> {
        self.inner.check_available()?;
        let Some(queue) = self.inner.queues.read().get(queue).cloned() else {
            return Err(SyncError::QueueNotFound(queue.to_string()));
        };

        let mut state = queue.state.lock();
        let before = state.pending.len();
        let kept: BinaryHeap<Pending> = std::mem::take(&mut state.pending)
            .into_iter()
            .filter(|p| !predicate(&p.message))
            .collect();
        state.pending = kept;
        Ok(before - state.pending.len())
    }

    fn delete_queue(&self, queue: &str) -> Result<()> {
        if let Some(removed) = self.inner.queues.write().remove(queue) {
            removed.ready.notify_all();
            info!(queue = %queue, "Queue deleted");
        }
        Ok(())
    }
}

/// Session on a `MemoryBroker` queue.
pub struct MemorySession {
    broker: MemoryBroker,
    queue: Arc<Queue>,
}

impl Session for MemorySession {
    fn queue_name(&self) -> &str {
        &self.queue.name
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        self.broker.inner.check_available()?;
        let deadline = Instant::now() + timeout;

        let mut state = self.queue.state.lock();
        loop {
            if state.in_flight.len() < self.queue.prefetch {
                if let Some(pending) = state.pending.pop() {
                    let tag = DeliveryTag(self.broker.inner.next_tag.fetch_add(1, Ordering::SeqCst));
                    let delivery = Delivery {
                        tag,
                        message: pending.message.clone(),
                        redelivered: pending.redelivered,
                    };
                    state.in_flight.insert(tag, pending);
                    return Ok(Some(delivery));
                }
            }

            if self.queue.ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn acknowledge(&mut self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.queue.state.lock();
        state.in_flight.remove(&tag);
        self.queue.ready.notify_one();
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        let mut state = self.queue.state.lock();
        let returned = std::mem::take(&mut state.in_flight);
        for (_, mut pending) in returned {
            pending.redelivered = true;
            state.pending.push(pending);
        }
        self.queue.ready.notify_all();
        Ok(())
    }

    fn set_selector(&mut self, selector: Selector) -> Result<()> {
        info!(queue = %self.queue.name, selector = %selector.expression(), "Selector updated");
        *self.queue.selector.write() = selector;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if self.queue.durable {
            // Unacknowledged work stays on the queue for the next session.
            self.recover()
        } else {
            self.broker.delete_queue(&self.queue.name)
        }
    }
}
