//! Task client example
//!
//! This example demonstrates how to:
//! 1. Submit tasks with positional and named arguments
//! 2. Wait for results with a timeout
//! 3. Poll a result without blocking and observe a stored failure
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Start a worker: cargo run --example simple_worker
//! 3. Run: cargo run --example task_client

use celery_queue::{CeleryClient, RedisBackend, RedisBroker, RedisConfig, TaskError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let redis_config = RedisConfig::default();
    let client = CeleryClient::new(
        Arc::new(RedisBroker::new(redis_config.clone()).await?),
        Arc::new(RedisBackend::new(redis_config).await?),
        1,
    );

    // Positional arguments
    let mut handles = Vec::new();
    for i in 0..5 {
        let result = client.delay("worker.add", (i, i * 2)).await?;
        info!("Submitted worker.add({}, {}): {}", i, i * 2, result.task_id());
        handles.push(result);
    }

    for mut result in handles {
        match result.get(Duration::from_secs(10)).await {
            Ok(value) => info!("Task {} returned {}", result.task_id(), value),
            Err(e) => error!("Task {} failed: {}", result.task_id(), e),
        }
    }

    // Named arguments
    let mut message = client
        .delay_kwargs(
            "worker.message",
            json!({"message": "Hello from Rust", "uppercase": true}),
            None,
        )
        .await?;
    let text: String = message.get_as(Duration::from_secs(10)).await?;
    info!("worker.message returned '{}'", text);

    // Non-blocking polling
    let mut pending = client.delay("worker.add", (40, 2)).await?;
    loop {
        match pending.async_get().await {
            Ok(Some(value)) => {
                info!("Polled result: {}", value);
                break;
            }
            Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(e @ TaskError::TaskFailed { .. }) => {
                error!("Task failed: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Nobody registers this one; the worker stores a failure
    let mut missing = client.delay("worker.missing", ()).await?;
    if let Err(e) = missing.get(Duration::from_secs(10)).await {
        info!("As expected: {}", e);
    }

    Ok(())
}
