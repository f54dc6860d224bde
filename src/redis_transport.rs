//! Redis broker and backend
//!
//! Wire layout matches the Celery Redis transport: envelopes are JSON strings
//! `LPUSH`ed onto a list named after the routing key and popped with `BRPOP`;
//! results are JSON strings stored under `celery-task-meta-<id>` with an
//! expiry.

use async_trait::async_trait;
use redis::aio::Connection;
use redis::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{result_key, Backend};
use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::protocol::{CeleryMessage, ResultMessage, DEFAULT_QUEUE};

/// Configuration for the Redis transports
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Queue (list key) consumed by workers
    pub queue_name: String,
    /// Result TTL in seconds
    pub result_ttl: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: DEFAULT_QUEUE.to_string(),
            result_ttl: 86400, // 24 hours
        }
    }
}

async fn connect(redis_url: &str) -> TaskResult<Client> {
    let client = Client::open(redis_url).map_err(|e| TaskError::config(e.to_string()))?;

    let mut conn = client.get_async_connection().await?;
    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await?;

    info!("Connected to Redis at {}", redis_url);
    Ok(client)
}

/// BRPOP timeout in seconds, or `None` when the wait must not block.
///
/// Redis reads 0 as "block forever" and rounds sub-millisecond values down
/// to 0, so those become a plain RPOP.
fn blocking_pop_timeout(timeout: Duration) -> Option<f64> {
    if timeout < Duration::from_millis(1) {
        None
    } else {
        Some(timeout.as_secs_f64())
    }
}

/// Broker storing envelopes in Redis lists
#[derive(Debug, Clone)]
pub struct RedisBroker {
    client: Client,
    queue_name: String,
}

impl RedisBroker {
    /// Connect to Redis and verify the connection
    pub async fn new(config: RedisConfig) -> TaskResult<Self> {
        let client = connect(&config.redis_url).await?;
        Ok(Self {
            client,
            queue_name: config.queue_name,
        })
    }

    /// Connect with default configuration
    pub async fn new_default() -> TaskResult<Self> {
        Self::new(RedisConfig::default()).await
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::broker(e.to_string()))
    }

    async fn push(&self, message: &CeleryMessage) -> TaskResult<()> {
        let payload = message.to_json()?;
        let queue_key = match message.routing_key() {
            "" => self.queue_name.as_str(),
            key => key,
        };

        let mut conn = self.get_connection().await?;
        redis::cmd("LPUSH")
            .arg(queue_key)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| TaskError::broker(e.to_string()))?;

        debug!(
            "Pushed envelope {} onto {}",
            message.properties.correlation_id, queue_key
        );
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn send(&self, message: &CeleryMessage, timeout: Duration) -> TaskResult<()> {
        tokio::time::timeout(timeout, self.push(message))
            .await
            .map_err(|_| TaskError::timeout("send"))?
    }

    async fn receive(&self, timeout: Duration) -> TaskResult<Option<CeleryMessage>> {
        let mut conn = self.get_connection().await?;

        let popped: Option<(String, String)> = match blocking_pop_timeout(timeout) {
            None => {
                let raw: Option<String> = redis::cmd("RPOP")
                    .arg(&self.queue_name)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| TaskError::broker(e.to_string()))?;
                raw.map(|raw| (self.queue_name.clone(), raw))
            }
            Some(seconds) => redis::cmd("BRPOP")
                .arg(&self.queue_name)
                .arg(seconds)
                .query_async(&mut conn)
                .await
                .map_err(|e| TaskError::broker(e.to_string()))?,
        };

        match popped {
            Some((queue, raw)) => {
                if queue != self.queue_name {
                    return Err(TaskError::malformed(format!(
                        "popped from unexpected queue '{}'",
                        queue
                    )));
                }
                CeleryMessage::from_json(&raw).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Result backend storing results as expiring Redis strings
#[derive(Debug, Clone)]
pub struct RedisBackend {
    client: Client,
    result_ttl: u64,
}

impl RedisBackend {
    /// Connect to Redis and verify the connection
    pub async fn new(config: RedisConfig) -> TaskResult<Self> {
        if config.result_ttl == 0 {
            return Err(TaskError::config("result_ttl must be positive"));
        }
        let client = connect(&config.redis_url).await?;
        Ok(Self {
            client,
            result_ttl: config.result_ttl,
        })
    }

    /// Connect with default configuration
    pub async fn new_default() -> TaskResult<Self> {
        Self::new(RedisConfig::default()).await
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::backend(e.to_string()))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get_result(&self, task_id: &str) -> TaskResult<Option<ResultMessage>> {
        let mut conn = self.get_connection().await?;

        let stored: Option<Vec<u8>> = redis::cmd("GET")
            .arg(result_key(task_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend(e.to_string()))?;

        match stored {
            Some(bytes) if !bytes.is_empty() => ResultMessage::decode(&bytes).map(Some),
            _ => Ok(None),
        }
    }

    async fn set_result(&self, task_id: &str, result: &ResultMessage) -> TaskResult<()> {
        let bytes = result.encode()?;
        let mut conn = self.get_connection().await?;

        redis::cmd("SET")
            .arg(result_key(task_id))
            .arg(bytes)
            .arg("EX")
            .arg(self.result_ttl)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::backend(e.to_string()))?;

        debug!("Stored {} result for task {}", result.status, task_id);
        Ok(())
    }
}
