//! Client interface for submitting tasks and managing the worker pool

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::Backend;
use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::pool::{MessagePools, PoolConfig};
use crate::protocol::{TaskMessage, DEFAULT_QUEUE, JSON_CONTENT_TYPE};
use crate::registry::{CeleryTask, TaskFn, TaskHandler};
use crate::result::{AsyncResult, DEFAULT_POLL_INTERVAL};
use crate::worker::{CeleryWorker, WorkerConfig, WorkerStats};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Exchange and routing key of envelopes without a queue override
    pub default_queue: String,
    /// Longest a submission may wait on the broker
    pub send_timeout: Duration,
    /// Poll interval of the result handles this client returns
    pub result_poll_interval: Duration,
    /// Message pool sizing
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            send_timeout: Duration::from_secs(5),
            result_poll_interval: DEFAULT_POLL_INTERVAL,
            pool: PoolConfig::default(),
        }
    }
}

fn positional_args<A: Serialize>(args: A) -> TaskResult<Vec<Value>> {
    match serde_json::to_value(args) {
        Ok(Value::Array(args)) => Ok(args),
        Ok(Value::Null) => Ok(Vec::new()),
        Ok(other) => Err(TaskError::invalid_payload(format!(
            "positional arguments must form a list, got {}",
            other
        ))),
        Err(e) => Err(TaskError::invalid_payload(e.to_string())),
    }
}

fn named_args<K: Serialize>(kwargs: K) -> TaskResult<serde_json::Map<String, Value>> {
    match serde_json::to_value(kwargs) {
        Ok(Value::Object(kwargs)) => Ok(kwargs),
        Ok(Value::Null) => Ok(serde_json::Map::new()),
        Ok(other) => Err(TaskError::invalid_payload(format!(
            "named arguments must form a map, got {}",
            other
        ))),
        Err(e) => Err(TaskError::invalid_payload(e.to_string())),
    }
}

/// Producer-facing API: submits tasks and owns a worker pool
///
/// ```rust,no_run
/// use celery_queue::{CeleryClient, MemoryBackend, MemoryBroker};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run() -> celery_queue::TaskResult<()> {
/// let client = CeleryClient::new(Arc::new(MemoryBroker::new()), Arc::new(MemoryBackend::new()), 2);
/// client.register_fn("add", |a: i64, b: i64| a + b).await;
/// client.start_worker()?;
///
/// let mut result = client.delay("add", (2, 5)).await?;
/// assert_eq!(result.get(Duration::from_secs(1)).await?, 7);
///
/// client.stop_worker();
/// client.wait_for_stop_worker().await;
/// # Ok(())
/// # }
/// ```
pub struct CeleryClient {
    config: ClientConfig,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn Backend>,
    pools: Arc<MessagePools>,
    worker: CeleryWorker,
}

impl CeleryClient {
    /// Create a client whose worker pool runs `num_workers` units
    pub fn new(broker: Arc<dyn Broker>, backend: Arc<dyn Backend>, num_workers: usize) -> Self {
        let worker_config = WorkerConfig {
            num_workers,
            ..Default::default()
        };
        Self::with_config(broker, backend, ClientConfig::default(), worker_config)
    }

    /// Create a client with explicit client and worker configuration
    pub fn with_config(
        broker: Arc<dyn Broker>,
        backend: Arc<dyn Backend>,
        config: ClientConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        let pools = MessagePools::new(config.pool.clone());
        let worker = CeleryWorker::new(worker_config, broker.clone(), backend.clone(), pools.clone());
        Self {
            config,
            broker,
            backend,
            pools,
            worker,
        }
    }

    /// Submit `task` with positional arguments
    ///
    /// `args` must serialize to a list: a tuple, a vector or `()`.
    pub async fn delay<A: Serialize>(&self, task: &str, args: A) -> TaskResult<AsyncResult> {
        let args = positional_args(args)?;
        self.submit(task, args, serde_json::Map::new(), None, None)
            .await
    }

    /// Submit `task` with named arguments, optionally routed to `queue`
    ///
    /// `kwargs` must serialize to a map. An empty `queue` counts as no
    /// override.
    pub async fn delay_kwargs<K: Serialize>(
        &self,
        task: &str,
        kwargs: K,
        queue: Option<&str>,
    ) -> TaskResult<AsyncResult> {
        let kwargs = named_args(kwargs)?;
        self.submit(task, Vec::new(), kwargs, queue, None).await
    }

    /// Submit `task` with positional arguments and an `eta` scheduling hint
    pub async fn delay_at<A: Serialize>(
        &self,
        task: &str,
        args: A,
        eta: DateTime<Utc>,
    ) -> TaskResult<AsyncResult> {
        let args = positional_args(args)?;
        self.submit(task, args, serde_json::Map::new(), None, Some(eta))
            .await
    }

    async fn submit(
        &self,
        task: &str,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
        queue: Option<&str>,
        eta: Option<DateTime<Utc>>,
    ) -> TaskResult<AsyncResult> {
        let mut message = self.pools.tasks.acquire();
        message.id = uuid::Uuid::new_v4().to_string();
        message.task.push_str(task);
        message.args = args;
        message.kwargs = kwargs;
        if let Some(eta) = eta {
            message.set_eta(eta);
        }

        let sent = self.send(&message, queue).await;
        let task_id = std::mem::take(&mut message.id);
        self.pools.tasks.release(message);
        sent?;

        debug!("Submitted task {}[{}]", task, task_id);
        Ok(self.async_result(task_id))
    }

    async fn send(&self, message: &TaskMessage, queue: Option<&str>) -> TaskResult<()> {
        let body = message.encode()?;

        let mut envelope = self.pools.envelopes.acquire();
        envelope.wrap_in_place(&message.id, &body, JSON_CONTENT_TYPE, &self.config.default_queue);
        if let Some(queue) = queue.filter(|queue| !queue.is_empty()) {
            envelope.route_to(queue);
        }

        let sent = self.broker.send(&envelope, self.config.send_timeout).await;
        self.pools.envelopes.release(envelope);
        sent
    }

    /// Handle on the result of an already submitted task
    pub fn async_result<S: Into<String>>(&self, task_id: S) -> AsyncResult {
        AsyncResult::new(task_id, self.backend.clone())
            .with_poll_interval(self.config.result_poll_interval)
    }

    /// Register a handler under `name`
    pub async fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.worker.register(name, handler).await;
    }

    /// Register a structured task
    pub async fn register_task<T>(&self, name: impl Into<String>)
    where
        T: CeleryTask + Default,
    {
        self.worker.register_task::<T>(name).await;
    }

    /// Register a plain callable
    pub async fn register_fn<F, Args>(&self, name: impl Into<String>, func: F)
    where
        F: TaskFn<Args>,
        Args: 'static,
    {
        self.worker.register_fn(name, func).await;
    }

    /// Start workers bound to `token`; cancelling it stops them
    pub fn start_worker_with_context(&self, token: &CancellationToken) -> TaskResult<()> {
        self.worker.start_worker_with_context(token)
    }

    /// Start workers stopped by [`CeleryClient::stop_worker`]
    pub fn start_worker(&self) -> TaskResult<()> {
        self.worker.start_worker()
    }

    /// Tell workers to stop taking new tasks
    pub fn stop_worker(&self) {
        self.worker.stop_worker();
    }

    /// Wait until every worker has exited
    pub async fn wait_for_stop_worker(&self) {
        self.worker.wait_for_stop_worker().await;
    }

    /// Worker pool statistics
    pub fn worker_stats(&self) -> WorkerStats {
        self.worker.get_stats()
    }

    /// Get access to the underlying worker pool
    pub fn worker(&self) -> &CeleryWorker {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryBroker};
    use crate::protocol::CeleryMessage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_test::assert_err;

    fn client(broker: &MemoryBroker) -> CeleryClient {
        CeleryClient::new(
            Arc::new(broker.clone()),
            Arc::new(MemoryBackend::new()),
            1,
        )
    }

    async fn next_task(broker: &MemoryBroker) -> (CeleryMessage, TaskMessage) {
        let envelope = broker
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let task = envelope.unwrap().unwrap();
        (envelope, task)
    }

    #[tokio::test]
    async fn delay_sends_positional_arguments() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let result = client.delay("add", (2, 5)).await.unwrap();
        let (envelope, task) = next_task(&broker).await;
        assert_eq!(task.id, result.task_id());
        assert_eq!(task.task, "add");
        assert_eq!(task.args, vec![json!(2), json!(5)]);
        assert!(task.kwargs.is_empty());
        assert_eq!(envelope.properties.correlation_id, task.id);
        assert_eq!(envelope.properties.delivery_info.exchange, DEFAULT_QUEUE);
    }

    #[tokio::test]
    async fn every_submission_gets_a_fresh_id() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let first = client.delay("noop", ()).await.unwrap();
        let second = client.delay("noop", ()).await.unwrap();
        assert_ne!(first.task_id(), second.task_id());
        assert_eq!(broker.len(DEFAULT_QUEUE), 2);
    }

    #[tokio::test]
    async fn delay_kwargs_routes_to_the_override_queue() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let mut kwargs = HashMap::new();
        kwargs.insert("a", 3);
        kwargs.insert("b", 4);
        client.delay_kwargs("add", &kwargs, Some("math")).await.unwrap();
        assert_eq!(broker.len("math"), 1);

        let (envelope, task) = next_task(&broker.for_queue("math")).await;
        assert_eq!(envelope.properties.delivery_info.exchange, "");
        assert_eq!(envelope.routing_key(), "math");
        assert_eq!(task.kwargs.get("a"), Some(&json!(3)));
        assert!(task.args.is_empty());

        client.delay_kwargs("add", json!({"a": 1}), Some("")).await.unwrap();
        assert_eq!(broker.len(DEFAULT_QUEUE), 1);
    }

    #[tokio::test]
    async fn delay_at_sets_the_eta_hint() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let eta = Utc::now() + chrono::Duration::minutes(5);

        client.delay_at("add", vec![1, 2], eta).await.unwrap();
        let (_, task) = next_task(&broker).await;
        assert_eq!(task.eta_time(), Some(eta));
    }

    #[tokio::test]
    async fn arguments_of_the_wrong_shape_are_invalid() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let err = assert_err!(client.delay("add", 5).await);
        assert!(matches!(err, TaskError::InvalidPayload { .. }));

        let err = assert_err!(client.delay_kwargs("add", vec![1, 2], None).await);
        assert!(matches!(err, TaskError::InvalidPayload { .. }));

        let mut bad_keys = HashMap::new();
        bad_keys.insert(vec![1u8], 1);
        let err = assert_err!(client.delay_kwargs("add", bad_keys, None).await);
        assert!(matches!(err, TaskError::InvalidPayload { .. }));

        assert!(broker.is_empty(DEFAULT_QUEUE));
    }

    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        async fn send(&self, _message: &CeleryMessage, _timeout: Duration) -> TaskResult<()> {
            Err(TaskError::broker("connection refused"))
        }

        async fn receive(&self, _timeout: Duration) -> TaskResult<Option<CeleryMessage>> {
            Err(TaskError::broker("connection refused"))
        }
    }

    #[tokio::test]
    async fn broker_failure_propagates() {
        let client = CeleryClient::new(Arc::new(DownBroker), Arc::new(MemoryBackend::new()), 1);
        let err = assert_err!(client.delay("add", (1, 2)).await);
        assert!(matches!(err, TaskError::BrokerUnavailable { .. }));
    }

    #[tokio::test]
    async fn full_broker_times_out() {
        let broker = MemoryBroker::with_capacity(1);
        let config = ClientConfig {
            send_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let client = CeleryClient::with_config(
            Arc::new(broker.clone()),
            Arc::new(MemoryBackend::new()),
            config,
            WorkerConfig::default(),
        );

        client.delay("add", (1, 2)).await.unwrap();
        let err = assert_err!(client.delay("add", (1, 2)).await);
        assert!(matches!(err, TaskError::Timeout { .. }));
    }
}
