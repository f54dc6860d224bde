//! In-process broker and backend
//!
//! Useful for tests, demos and single-process deployments. Envelopes are kept
//! in per-routing-key FIFO queues; results are kept encoded, keyed the same
//! way a Redis backend keys them, and expire after the retention period.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{result_key, Backend, DEFAULT_RESULT_TTL};
use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::protocol::{CeleryMessage, ResultMessage, DEFAULT_QUEUE};

#[derive(Debug, Default)]
struct Queues {
    messages: Mutex<HashMap<String, VecDeque<CeleryMessage>>>,
    arrived: Notify,
    drained: Notify,
}

/// Broker keeping envelopes in memory
///
/// Clones share the same queues; [`MemoryBroker::for_queue`] gives a handle
/// that consumes a different routing key of the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    queues: Arc<Queues>,
    queue_name: String,
    capacity: usize,
}

impl MemoryBroker {
    /// Unbounded broker consuming the default queue
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Queues::default()),
            queue_name: DEFAULT_QUEUE.to_string(),
            capacity: usize::MAX,
        }
    }

    /// Broker holding at most `capacity` envelopes per queue
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::new()
        }
    }

    /// Handle on the same broker consuming `queue_name`
    pub fn for_queue<S: Into<String>>(&self, queue_name: S) -> Self {
        Self {
            queues: self.queues.clone(),
            queue_name: queue_name.into(),
            capacity: self.capacity,
        }
    }

    /// Name of the queue this handle consumes
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Number of envelopes waiting in `queue_name`
    pub fn len(&self, queue_name: &str) -> usize {
        self.queues
            .messages
            .lock()
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    /// Whether `queue_name` holds no envelope
    pub fn is_empty(&self, queue_name: &str) -> bool {
        self.len(queue_name) == 0
    }

    fn try_push(&self, message: &CeleryMessage) -> bool {
        let key = match message.routing_key() {
            "" => self.queue_name.as_str(),
            key => key,
        };
        let mut messages = self.queues.messages.lock();
        let queue = messages.entry(key.to_string()).or_default();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(message.clone());
        true
    }

    fn try_pop(&self) -> Option<CeleryMessage> {
        self.queues
            .messages
            .lock()
            .get_mut(&self.queue_name)
            .and_then(VecDeque::pop_front)
    }
}

/// Wait for `notified` until `deadline`, or without bound when there is none.
/// Returns false once the deadline has passed.
async fn wait_until(deadline: Option<Instant>, notified: Notified<'_>) -> bool {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
        None => {
            notified.await;
            true
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn send(&self, message: &CeleryMessage, timeout: Duration) -> TaskResult<()> {
        // Too far to represent means no deadline
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let drained = self.queues.drained.notified();
            if self.try_push(message) {
                self.queues.arrived.notify_waiters();
                debug!(
                    "Queued envelope {} under '{}'",
                    message.properties.correlation_id,
                    message.routing_key()
                );
                return Ok(());
            }
            if !wait_until(deadline, drained).await {
                return Err(TaskError::timeout("send"));
            }
        }
    }

    async fn receive(&self, timeout: Duration) -> TaskResult<Option<CeleryMessage>> {
        // Too far to represent means no deadline
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let arrived = self.queues.arrived.notified();
            if let Some(message) = self.try_pop() {
                self.queues.drained.notify_waiters();
                return Ok(Some(message));
            }
            if !wait_until(deadline, arrived).await {
                return Ok(None);
            }
        }
    }
}

/// Result backend keeping encoded results in memory
#[derive(Debug)]
pub struct MemoryBackend {
    results: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    ttl: Duration,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
}

impl MemoryBackend {
    /// Backend keeping results for 24 hours
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESULT_TTL)
    }

    /// Backend keeping results for `ttl`
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            ttl,
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
        }
    }

    /// Number of `get_result` calls served so far
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    /// Number of `set_result` calls served so far
    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::Relaxed)
    }

    /// Number of unexpired results
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.results
            .lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    /// Whether no unexpired result is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_result(&self, task_id: &str) -> TaskResult<Option<ResultMessage>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let key = result_key(task_id);
        let mut results = self.results.lock();

        match results.get(&key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                results.remove(&key);
                Ok(None)
            }
            Some((bytes, _)) => ResultMessage::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set_result(&self, task_id: &str, result: &ResultMessage) -> TaskResult<()> {
        self.set_calls.fetch_add(1, Ordering::Relaxed);
        let bytes = result.encode()?;
        self.results
            .lock()
            .insert(result_key(task_id), (bytes, Instant::now() + self.ttl));
        Ok(())
    }
}
