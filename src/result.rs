//! Client-side handle on a task's eventual result

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{TaskError, TaskResult};
use crate::protocol::{ResultMessage, ResultStatus};

/// Default interval between backend polls in [`AsyncResult::get`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pending result of a submitted task
///
/// Once a finished result (success, failure or revocation) has been seen it
/// is cached, and every later query answers from the cache without touching
/// the backend.
pub struct AsyncResult {
    task_id: String,
    backend: Arc<dyn Backend>,
    poll_interval: Duration,
    result: Option<ResultMessage>,
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("task_id", &self.task_id)
            .field("result", &self.result)
            .finish()
    }
}

fn outcome(task_id: &str, result: &ResultMessage) -> TaskResult<Value> {
    match result.status {
        ResultStatus::Success => Ok(result.result.clone()),
        status => Err(TaskError::TaskFailed {
            task_id: task_id.to_string(),
            status: status.to_string(),
            description: result.description(),
        }),
    }
}

impl AsyncResult {
    pub fn new<S: Into<String>>(task_id: S, backend: Arc<dyn Backend>) -> Self {
        Self {
            task_id: task_id.into(),
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
            result: None,
        }
    }

    /// Use a different interval between backend polls
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Identifier of the task this handle waits for
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Query the backend once unless a finished result is cached
    async fn fetch(&mut self) -> TaskResult<Option<&ResultMessage>> {
        if self.result.is_none() {
            match self.backend.get_result(&self.task_id).await? {
                Some(result) if result.status.is_ready() => {
                    debug!("Task {} finished with {}", self.task_id, result.status);
                    self.result = Some(result);
                }
                Some(result) => {
                    debug!("Task {} is {}", self.task_id, result.status);
                }
                None => {}
            }
        }
        Ok(self.result.as_ref())
    }

    /// Wait up to `timeout` for the task to finish
    ///
    /// Returns the task's value on success, [`TaskError::TaskFailed`] when it
    /// finished with any other status, and [`TaskError::Timeout`] when it did
    /// not finish in time. Backend errors while polling are logged and
    /// polling continues.
    pub async fn get(&mut self, timeout: Duration) -> TaskResult<Value> {
        let task_id = self.task_id.clone();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let poll = async {
            loop {
                ticker.tick().await;
                match self.async_get().await {
                    Ok(Some(value)) => return Ok(value),
                    Ok(None) => {}
                    Err(e @ TaskError::TaskFailed { .. }) => return Err(e),
                    Err(e) => warn!("Polling result of task {} failed: {}", task_id, e),
                }
            }
        };

        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            TaskError::timeout(format!("{:?} waiting for result of task {}", timeout, task_id))
        })?
    }

    /// Wait for a successful result and deserialize it into `T`
    pub async fn get_as<T: DeserializeOwned>(&mut self, timeout: Duration) -> TaskResult<T> {
        let value = self.get(timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Check once without waiting
    ///
    /// `Ok(None)` means the task has not finished yet; a finished failure is
    /// reported as [`TaskError::TaskFailed`].
    pub async fn async_get(&mut self) -> TaskResult<Option<Value>> {
        let task_id = self.task_id.clone();
        match self.fetch().await? {
            Some(result) => outcome(&task_id, result).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the task has finished, successfully or not
    pub async fn ready(&mut self) -> TaskResult<bool> {
        Ok(self.fetch().await?.is_some())
    }

    /// Status of the task as last seen in the backend
    pub async fn status(&mut self) -> TaskResult<ResultStatus> {
        if let Some(result) = &self.result {
            return Ok(result.status);
        }
        Ok(self
            .backend
            .get_result(&self.task_id)
            .await?
            .map_or(ResultStatus::Pending, |result| result.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn handle(backend: &Arc<MemoryBackend>, task_id: &str) -> AsyncResult {
        AsyncResult::new(task_id, backend.clone() as Arc<dyn Backend>)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn async_get_is_none_until_stored() {
        let backend = Arc::new(MemoryBackend::new());
        let mut result = handle(&backend, "t1");
        assert_eq!(assert_ok!(result.async_get().await), None);
        assert!(!assert_ok!(result.ready().await));

        backend
            .set_result("t1", &ResultMessage::success("t1", json!(7)))
            .await
            .unwrap();
        assert_eq!(assert_ok!(result.async_get().await), Some(json!(7)));
        assert!(assert_ok!(result.ready().await));
    }

    #[tokio::test]
    async fn cached_result_skips_the_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set_result("t1", &ResultMessage::success("t1", json!("done")))
            .await
            .unwrap();
        let mut result = handle(&backend, "t1");

        assert_eq!(result.async_get().await.unwrap(), Some(json!("done")));
        let calls = backend.get_calls();
        for _ in 0..5 {
            assert_eq!(result.async_get().await.unwrap(), Some(json!("done")));
            assert!(result.ready().await.unwrap());
        }
        assert_eq!(result.get(Duration::from_millis(10)).await.unwrap(), json!("done"));
        assert_eq!(backend.get_calls(), calls);
    }

    #[tokio::test]
    async fn stored_failure_is_task_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let failure = ResultMessage::failure("t1", &TaskError::task_failure("division by zero"));
        backend.set_result("t1", &failure).await.unwrap();

        let mut result = handle(&backend, "t1");
        assert!(result.ready().await.unwrap());
        let err = assert_err!(result.get(Duration::from_secs(1)).await);
        match err {
            TaskError::TaskFailed {
                status,
                description,
                ..
            } => {
                assert_eq!(status, "FAILURE");
                assert!(description.contains("division by zero"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(result.status().await.unwrap(), ResultStatus::Failure);
    }

    #[tokio::test]
    async fn unfinished_status_keeps_polling() {
        let backend = Arc::new(MemoryBackend::new());
        let mut started = ResultMessage::default();
        started.task_id = "t1".to_string();
        started.status = ResultStatus::Started;
        backend.set_result("t1", &started).await.unwrap();

        let mut result = handle(&backend, "t1");
        assert!(!result.ready().await.unwrap());
        assert_eq!(result.status().await.unwrap(), ResultStatus::Started);

        let writer = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .set_result("t1", &ResultMessage::success("t1", json!(1)))
                .await
                .unwrap();
        });
        assert_eq!(result.get(Duration::from_secs(2)).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn get_times_out_after_the_deadline() {
        let backend = Arc::new(MemoryBackend::new());
        let mut result = handle(&backend, "never");

        let started = Instant::now();
        let err = assert_err!(result.get(Duration::from_millis(200)).await);
        let elapsed = started.elapsed();
        assert!(matches!(err, TaskError::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert!(backend.get_calls() > 1);
    }

    #[tokio::test]
    async fn get_as_deserializes_the_value() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set_result("t1", &ResultMessage::success("t1", json!([1, 2, 3])))
            .await
            .unwrap();
        let mut result = handle(&backend, "t1");
        let values: Vec<u32> = result.get_as(Duration::from_secs(1)).await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
