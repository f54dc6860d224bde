//! Broker port: the queue that moves task envelopes from producers to workers

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TaskResult;
use crate::protocol::CeleryMessage;

/// Minimal capability a broker transport must provide
///
/// Implementations are shared by every worker execution unit and every
/// producer, so they must be safe for concurrent use.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue an envelope under its routing key.
    ///
    /// Must not block past `timeout`; returns [`TaskError::Timeout`] when it
    /// would.
    ///
    /// [`TaskError::Timeout`]: crate::error::TaskError::Timeout
    async fn send(&self, message: &CeleryMessage, timeout: Duration) -> TaskResult<()>;

    /// Dequeue the next envelope from the default queue.
    ///
    /// Waits at most `timeout` and returns `Ok(None)` when nothing arrived.
    async fn receive(&self, timeout: Duration) -> TaskResult<Option<CeleryMessage>>;
}
