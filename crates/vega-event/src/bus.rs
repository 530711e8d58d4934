//! Bounded, prioritized publish/subscribe bus.

use crate::BusError;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default maximum number of queued messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Identifier returned by subscribe operations, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscription<T> {
    id: SubscriptionId,
    priority: i32,
    seq: u64,
    callback: Callback<T>,
}

struct BusInner<T> {
    subscribers: RwLock<HashMap<String, Vec<Subscription<T>>>>,
    global: RwLock<Vec<Subscription<T>>>,
    queue: Mutex<VecDeque<(String, T)>>,
    capacity: usize,
    /// Notified when a message is enqueued.
    available: Notify,
    /// Notified when queue space frees up.
    space: Notify,
    stopped: AtomicBool,
    next_id: AtomicU64,
}

/// Typed publish/subscribe bus with priorities and a bounded queue.
///
/// Cloning is cheap: clones share the same queue and subscriber table.
/// See the crate docs for topic and ordering semantics.
pub struct MessageBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for MessageBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for MessageBus<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageBus<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a bus with the default queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a bus with an explicit queue capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                global: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                available: Notify::new(),
                space: Notify::new(),
                stopped: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes a callback to a topic.
    ///
    /// `topic` may be a bare topic, a namespaced `ns::topic`, or a
    /// wildcard `ns.*` that matches every topic published into `ns`.
    /// Within a message, callbacks run in descending `priority` order;
    /// equal priorities run in subscription order.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        priority: i32,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let topic = topic.into();
        let sub = self.make_subscription(priority, callback);
        let id = sub.id;
        self.inner
            .subscribers
            .write()
            .entry(topic.clone())
            .or_default()
            .push(sub);
        debug!(topic = %topic, "Subscribed to topic");
        id
    }

    /// Subscribes within a namespace: equivalent to `subscribe("ns::topic", ..)`.
    pub fn subscribe_in(
        &self,
        namespace: &str,
        topic: &str,
        priority: i32,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(full_topic(namespace, topic), priority, callback)
    }

    /// Subscribes to every topic in a namespace (`ns.*`).
    pub fn subscribe_namespace(
        &self,
        namespace: &str,
        priority: i32,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(format!("{namespace}.*"), priority, callback)
    }

    /// Subscribes to every message on the bus, regardless of topic.
    pub fn subscribe_global(
        &self,
        priority: i32,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let sub = self.make_subscription(priority, callback);
        let id = sub.id;
        self.inner.global.write().push(sub);
        id
    }

    /// Removes a subscription. Returns `true` when it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        {
            let mut global = self.inner.global.write();
            let before = global.len();
            global.retain(|s| s.id != id);
            if global.len() != before {
                return true;
            }
        }
        let mut map = self.inner.subscribers.write();
        for subs in map.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() != before {
                return true;
            }
        }
        false
    }

    /// Enqueues a message on a topic.
    ///
    /// When the queue is full the oldest message is discarded and a
    /// warning is logged.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Stopped`] after [`stop`](Self::stop).
    pub fn publish(&self, topic: impl Into<String>, message: T) -> Result<(), BusError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        let topic = topic.into();
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                warn!(topic = %topic, "Message queue is full, discarding oldest message");
                queue.pop_front();
            }
            queue.push_back((topic, message));
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Enqueues a message on `ns::topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Stopped`] after [`stop`](Self::stop).
    pub fn publish_in(
        &self,
        namespace: &str,
        topic: &str,
        message: T,
    ) -> Result<(), BusError> {
        self.publish(full_topic(namespace, topic), message)
    }

    /// Enqueues a message, waiting up to `timeout` for queue capacity.
    ///
    /// Returns `true` iff the message was enqueued within the timeout.
    /// Unlike [`publish`](Self::publish) this never discards messages.
    pub async fn try_publish(
        &self,
        topic: impl Into<String>,
        message: T,
        timeout: Duration,
    ) -> bool {
        let topic = topic.into();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut message = Some(message);
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                return false;
            }
            {
                let mut queue = self.inner.queue.lock();
                if queue.len() < self.inner.capacity {
                    queue.push_back((
                        topic,
                        message.take().expect("message consumed exactly once"),
                    ));
                    self.inner.available.notify_one();
                    return true;
                }
            }
            let space = self.inner.space.notified();
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                warn!(topic = %topic, "Failed to publish message within timeout");
                return false;
            }
        }
    }

    /// Takes the next queued message, waiting up to `timeout`.
    ///
    /// Competes with the consumer task; mostly useful on buses that are
    /// not started.
    pub async fn try_receive(&self, timeout: Duration) -> Option<(String, T)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.inner.queue.lock().pop_front() {
                self.inner.space.notify_one();
                return Some(entry);
            }
            let available = self.inner.available.notified();
            if tokio::time::timeout_at(deadline, available).await.is_err() {
                return None;
            }
        }
    }

    /// Spawns the consumer task that drains the queue and dispatches to
    /// subscribers. Call once per bus; the task exits on [`stop`](Self::stop).
    pub fn start(&self) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            bus.run().await;
            debug!("Message bus consumer stopped");
        })
    }

    /// Requests cooperative shutdown of the consumer task.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.available.notify_waiters();
        self.inner.available.notify_one();
    }

    /// Current number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn make_subscription(
        &self,
        priority: i32,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription<T> {
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Subscription {
            id: SubscriptionId(seq),
            priority,
            seq,
            callback: Arc::new(callback),
        }
    }

    async fn run(&self) {
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                break;
            }
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some((topic, message)) => {
                    self.inner.space.notify_one();
                    self.dispatch(&topic, &message);
                }
                None => {
                    let available = self.inner.available.notified();
                    if self.inner.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    if !self.inner.queue.lock().is_empty() {
                        continue;
                    }
                    available.await;
                }
            }
        }
    }

    /// Dispatches one message to matching local then global subscribers.
    ///
    /// Callbacks are invoked with no bus locks held.
    fn dispatch(&self, topic: &str, message: &T) {
        let mut matched: Vec<(i32, u64, Callback<T>)> = Vec::new();
        {
            let map = self.inner.subscribers.read();
            for (key, subs) in map.iter() {
                if key == topic || wildcard_matches(key, topic) {
                    matched.extend(
                        subs.iter()
                            .map(|s| (s.priority, s.seq, Arc::clone(&s.callback))),
                    );
                }
            }
        }
        matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, _, callback) in &matched {
            callback(message);
        }

        let mut global: Vec<(i32, u64, Callback<T>)> = {
            let subs = self.inner.global.read();
            subs.iter()
                .map(|s| (s.priority, s.seq, Arc::clone(&s.callback)))
                .collect()
        };
        global.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, _, callback) in &global {
            callback(message);
        }

        debug!(topic = %topic, "Processed message");
    }
}

fn full_topic(namespace: &str, topic: &str) -> String {
    if namespace.is_empty() {
        topic.to_string()
    } else {
        format!("{namespace}::{topic}")
    }
}

/// `ns.*` matches `ns::anything` and the bare `ns` topic itself.
fn wildcard_matches(key: &str, topic: &str) -> bool {
    let Some(prefix) = key.strip_suffix(".*") else {
        return false;
    };
    topic == prefix
        || topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with("::"))
}
