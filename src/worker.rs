//! Worker pool executing tasks received from the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::pool::MessagePools;
use crate::protocol::CeleryMessage;
use crate::registry::{CeleryTask, TaskFn, TaskHandler, TaskRegistry};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent execution units
    pub num_workers: usize,
    /// Longest a unit waits on the broker for a single envelope
    pub poll_timeout: Duration,
    /// Pause after an empty or failed poll
    pub rate_limit_period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_timeout: Duration::from_secs(1),
            rate_limit_period: Duration::from_millis(100),
        }
    }
}

/// Worker pool statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub messages_dropped: u64,
    pub average_execution_time_ms: f64,
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    fn record(&mut self, succeeded: bool, elapsed: Duration) {
        self.tasks_processed += 1;
        if succeeded {
            self.tasks_successful += 1;
        } else {
            self.tasks_failed += 1;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.average_execution_time_ms = if self.tasks_processed == 1 {
            elapsed_ms
        } else {
            (self.average_execution_time_ms * (self.tasks_processed - 1) as f64 + elapsed_ms)
                / self.tasks_processed as f64
        };
    }
}

struct RunState {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Everything an execution unit shares with its siblings
#[derive(Clone)]
struct UnitContext {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn Backend>,
    registry: Arc<TaskRegistry>,
    pools: Arc<MessagePools>,
    stats: Arc<parking_lot::Mutex<WorkerStats>>,
}

/// Pool of execution units pulling envelopes from a broker, invoking the
/// registered task and storing the outcome in a backend
///
/// Each unit runs `poll -> execute -> store` and checks for cancellation
/// only before and after a poll. A task that has started always finishes and
/// has its result stored before its unit exits.
///
/// The pool can be started either bound to a caller's [`CancellationToken`]
/// or with an internal one stopped by [`CeleryWorker::stop_worker`]. Both
/// stop mechanisms end the same run, but mixing them on one pool instance is
/// not supported.
pub struct CeleryWorker {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn Backend>,
    registry: Arc<TaskRegistry>,
    pools: Arc<MessagePools>,
    stats: Arc<parking_lot::Mutex<WorkerStats>>,
    run: parking_lot::Mutex<Option<RunState>>,
}

impl CeleryWorker {
    /// Create a worker pool with the given configuration
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn Backend>,
        pools: Arc<MessagePools>,
    ) -> Self {
        Self {
            config,
            broker,
            backend,
            registry: Arc::new(TaskRegistry::new()),
            pools,
            stats: Arc::new(parking_lot::Mutex::new(WorkerStats::default())),
            run: parking_lot::Mutex::new(None),
        }
    }

    /// Number of execution units started by this pool
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Registry consulted for every received task
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Register a handler under `name`
    pub async fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.registry.register(name, handler).await;
    }

    /// Register a structured task
    pub async fn register_task<T>(&self, name: impl Into<String>)
    where
        T: CeleryTask + Default,
    {
        self.registry.register_task::<T>(name).await;
    }

    /// Register a plain callable
    pub async fn register_fn<F, Args>(&self, name: impl Into<String>, func: F)
    where
        F: TaskFn<Args>,
        Args: 'static,
    {
        self.registry.register_fn(name, func).await;
    }

    /// Whether any execution unit is still running
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .map_or(false, |state| !state.tracker.is_empty())
    }

    /// Start the execution units; cancelling `parent` stops them
    pub fn start_worker_with_context(&self, parent: &CancellationToken) -> TaskResult<()> {
        if self.config.num_workers == 0 {
            return Err(TaskError::config("num_workers must be at least 1"));
        }

        let mut run = self.run.lock();
        if run.as_ref().map_or(false, |state| !state.tracker.is_empty()) {
            return Err(TaskError::config("worker pool is already running"));
        }

        let cancel = parent.child_token();
        let tracker = TaskTracker::new();
        let context = UnitContext {
            config: self.config.clone(),
            broker: self.broker.clone(),
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            pools: self.pools.clone(),
            stats: self.stats.clone(),
        };

        for unit in 0..self.config.num_workers {
            tracker.spawn(run_unit(unit, context.clone(), cancel.clone()));
        }
        tracker.close();

        self.stats.lock().started_at = Some(Utc::now());
        info!("Started {} workers", self.config.num_workers);
        *run = Some(RunState { cancel, tracker });
        Ok(())
    }

    /// Start the execution units with an internally owned cancellation token
    pub fn start_worker(&self) -> TaskResult<()> {
        self.start_worker_with_context(&CancellationToken::new())
    }

    /// Tell every execution unit to stop taking new work
    pub fn stop_worker(&self) {
        if let Some(state) = self.run.lock().as_ref() {
            info!("Stopping workers");
            state.cancel.cancel();
        }
    }

    /// Wait until every execution unit has exited
    pub async fn wait_for_stop_worker(&self) {
        let tracker = self.run.lock().as_ref().map(|state| state.tracker.clone());
        if let Some(tracker) = tracker {
            tracker.wait().await;
            debug!("All workers exited");
        }
    }

    /// Get worker statistics
    pub fn get_stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }
}

async fn pause(cancel: &CancellationToken, period: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(period) => {}
    }
}

async fn run_unit(unit: usize, context: UnitContext, cancel: CancellationToken) {
    debug!("Worker {} started", unit);

    while !cancel.is_cancelled() {
        match context.broker.receive(context.config.poll_timeout).await {
            Ok(Some(envelope)) => {
                if cancel.is_cancelled() {
                    hand_back(&context, envelope).await;
                    break;
                }
                let processing = tokio::spawn(process_envelope(unit, context.clone(), envelope));
                if let Err(e) = processing.await {
                    error!("Worker {} lost a task while processing it: {}", unit, e);
                }
            }
            Ok(None) => pause(&cancel, context.config.rate_limit_period).await,
            Err(e) => {
                warn!("Worker {} failed to receive from broker: {}", unit, e);
                pause(&cancel, context.config.rate_limit_period).await;
            }
        }
    }

    debug!("Worker {} stopped", unit);
}

/// Return an envelope that arrived after cancellation to the broker
async fn hand_back(context: &UnitContext, envelope: CeleryMessage) {
    let task_id = envelope.properties.correlation_id.clone();
    match context
        .broker
        .send(&envelope, context.config.poll_timeout)
        .await
    {
        Ok(()) => debug!("Returned task {} to the broker", task_id),
        Err(e) => error!("Failed to return task {} to the broker: {}", task_id, e),
    }
    context.pools.envelopes.release(envelope);
}

async fn process_envelope(unit: usize, context: UnitContext, envelope: CeleryMessage) {
    let message = match envelope.unwrap() {
        Ok(message) => message,
        Err(e) => {
            error!(
                "Worker {} dropping envelope {}: {}",
                unit, envelope.properties.correlation_id, e
            );
            context.stats.lock().messages_dropped += 1;
            context.pools.envelopes.release(envelope);
            return;
        }
    };
    context.pools.envelopes.release(envelope);

    let started = Instant::now();
    let outcome = context.registry.invoke(&message).await;
    let elapsed = started.elapsed();
    let succeeded = outcome.is_ok();

    let mut result = context.pools.results.acquire();
    match outcome {
        Ok(value) => {
            info!(
                "Task {}[{}] succeeded in {:?}",
                message.task, message.id, elapsed
            );
            result.set_success(message.id.as_str(), value);
        }
        Err(e) => {
            error!("Task {}[{}] failed: {}", message.task, message.id, e);
            result.set_failure(message.id.as_str(), &e);
        }
    }

    // A lost result only delays the producer until its own timeout
    if let Err(e) = context.backend.set_result(&message.id, &result).await {
        error!("Failed to store result of task {}: {}", message.id, e);
    }

    context.stats.lock().record(succeeded, elapsed);
    context.pools.results.release(result);
    context.pools.tasks.release(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryBroker};
    use crate::protocol::{Kwargs, ResultStatus, TaskMessage, DEFAULT_QUEUE, JSON_CONTENT_TYPE};
    use serde_json::{json, Value};
    use tokio_test::assert_err;

    fn fast_config(num_workers: usize) -> WorkerConfig {
        WorkerConfig {
            num_workers,
            poll_timeout: Duration::from_millis(50),
            rate_limit_period: Duration::from_millis(10),
        }
    }

    fn worker(num_workers: usize) -> (CeleryWorker, MemoryBroker, Arc<MemoryBackend>) {
        let broker = MemoryBroker::new();
        let backend = Arc::new(MemoryBackend::new());
        let worker = CeleryWorker::new(
            fast_config(num_workers),
            Arc::new(broker.clone()),
            backend.clone(),
            Arc::new(MessagePools::default()),
        );
        (worker, broker, backend)
    }

    async fn submit(broker: &MemoryBroker, task: &str, args: Vec<Value>) -> String {
        let mut message = TaskMessage::new(task);
        message.args = args;
        let envelope = CeleryMessage::wrap(
            &message.id,
            &message.encode().unwrap(),
            JSON_CONTENT_TYPE,
            DEFAULT_QUEUE,
        );
        broker.send(&envelope, Duration::from_secs(1)).await.unwrap();
        message.id
    }

    async fn wait_for_result(backend: &MemoryBackend, task_id: &str) -> crate::protocol::ResultMessage {
        for _ in 0..200 {
            if let Some(result) = backend.get_result(task_id).await.unwrap() {
                return result;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("no result stored for {}", task_id);
    }

    #[tokio::test]
    async fn executes_and_stores_success() {
        let (worker, broker, backend) = worker(2);
        worker.register_fn("add", |a: i64, b: i64| a + b).await;
        worker.start_worker().unwrap();

        let task_id = submit(&broker, "add", vec![json!(2), json!(5)]).await;
        let result = wait_for_result(&backend, &task_id).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.result, json!(7));

        worker.stop_worker();
        worker.wait_for_stop_worker().await;
        assert!(!worker.is_running());

        let stats = worker.get_stats();
        assert_eq!(stats.tasks_processed, 1);
        assert_eq!(stats.tasks_successful, 1);
        assert!(stats.started_at.is_some());
    }

    #[tokio::test]
    async fn unregistered_task_stores_failure_and_keeps_running() {
        let (worker, broker, backend) = worker(1);
        worker.register_fn("add", |a: i64, b: i64| a + b).await;
        worker.start_worker().unwrap();

        let missing = submit(&broker, "missing", vec![]).await;
        let failure = wait_for_result(&backend, &missing).await;
        assert_eq!(failure.status, ResultStatus::Failure);
        assert!(failure.description().contains("missing"));

        let added = submit(&broker, "add", vec![json!(1), json!(1)]).await;
        let success = wait_for_result(&backend, &added).await;
        assert_eq!(success.result, json!(2));

        worker.stop_worker();
        worker.wait_for_stop_worker().await;
    }

    #[tokio::test]
    async fn malformed_envelope_is_dropped() {
        let (worker, broker, backend) = worker(1);
        worker.register_fn("ping", || "pong").await;
        worker.start_worker().unwrap();

        let mut bad = CeleryMessage::wrap("bad", b"{}", JSON_CONTENT_TYPE, DEFAULT_QUEUE);
        bad.properties.body_encoding = "rot13".to_string();
        broker.send(&bad, Duration::from_secs(1)).await.unwrap();

        let task_id = submit(&broker, "ping", vec![]).await;
        wait_for_result(&backend, &task_id).await;
        assert!(backend.get_result("bad").await.unwrap().is_none());

        worker.stop_worker();
        worker.wait_for_stop_worker().await;
        assert_eq!(worker.get_stats().messages_dropped, 1);
    }

    #[derive(Default)]
    struct Noop;

    #[async_trait::async_trait]
    impl CeleryTask for Noop {
        fn parse_kwargs(&mut self, _kwargs: &Kwargs) -> TaskResult<()> {
            Ok(())
        }

        async fn run_task(&mut self) -> TaskResult<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn panicking_factory_leaves_the_unit_running() {
        let (worker, broker, backend) = worker(1);
        worker
            .registry()
            .register_task_with("boom", || -> Noop { panic!("factory exploded") })
            .await;
        worker.register_fn("add", |a: i64, b: i64| a + b).await;
        worker.start_worker().unwrap();

        let boom = submit(&broker, "boom", vec![]).await;
        let failure = wait_for_result(&backend, &boom).await;
        assert_eq!(failure.status, ResultStatus::Failure);
        assert!(failure.description().contains("factory exploded"));

        let added = submit(&broker, "add", vec![json!(1), json!(2)]).await;
        let success = wait_for_result(&backend, &added).await;
        assert_eq!(success.result, json!(3));
        assert!(worker.is_running());

        worker.stop_worker();
        worker.wait_for_stop_worker().await;
        assert_eq!(worker.get_stats().tasks_failed, 1);
    }

    #[tokio::test]
    async fn context_cancellation_stops_units() {
        let (worker, _broker, _backend) = worker(3);
        let token = CancellationToken::new();
        worker.start_worker_with_context(&token).unwrap();
        assert!(worker.is_running());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), worker.wait_for_stop_worker())
            .await
            .unwrap();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn refuses_to_start_twice() {
        let (worker, _broker, _backend) = worker(1);
        worker.start_worker().unwrap();
        let err = assert_err!(worker.start_worker());
        assert!(matches!(err, TaskError::Config { .. }));

        worker.stop_worker();
        worker.wait_for_stop_worker().await;
        worker.start_worker().unwrap();
        worker.stop_worker();
        worker.wait_for_stop_worker().await;
    }

    #[tokio::test]
    async fn zero_workers_is_a_config_error() {
        let (worker, _broker, _backend) = worker(0);
        assert!(matches!(
            worker.start_worker().unwrap_err(),
            TaskError::Config { .. }
        ));
    }

    #[tokio::test]
    async fn wait_without_start_returns_immediately() {
        let (worker, _broker, _backend) = worker(1);
        worker.stop_worker();
        tokio::time::timeout(Duration::from_millis(100), worker.wait_for_stop_worker())
            .await
            .unwrap();
    }
}
