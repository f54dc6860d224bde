//! Backend port: the key-value store holding task results

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TaskResult;
use crate::protocol::ResultMessage;

/// Prefix of the key a result is stored under
pub const RESULT_KEY_PREFIX: &str = "celery-task-meta-";

/// Default retention of stored results (24 hours)
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(86400);

/// Backend key of the result of `task_id`
pub fn result_key(task_id: &str) -> String {
    format!("{}{}", RESULT_KEY_PREFIX, task_id)
}

/// Minimal capability a result backend transport must provide
#[async_trait]
pub trait Backend: Send + Sync {
    /// Look up a stored result without blocking; `Ok(None)` when absent
    async fn get_result(&self, task_id: &str) -> TaskResult<Option<ResultMessage>>;

    /// Store a result with a finite retention period
    async fn set_result(&self, task_id: &str, result: &ResultMessage) -> TaskResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_keys_use_the_celery_prefix() {
        assert_eq!(result_key("abc"), "celery-task-meta-abc");
    }
}
