//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Register a plain closure and a structured task
//! 2. Start a pool of workers consuming the `celery` Redis queue
//! 3. Stop the pool gracefully on Ctrl-C
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example simple_worker
//! 3. Submit tasks with `cargo run --example task_client` or from Python:
//!    `app.send_task("worker.add", args=[2, 5])`

use async_trait::async_trait;
use celery_queue::{
    CeleryClient, CeleryTask, ClientConfig, Kwargs, RedisBackend, RedisBroker, RedisConfig,
    TaskError, TaskResult, WorkerConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// Uppercases or lowercases a message given as named arguments
#[derive(Debug, Default)]
struct MessageTask {
    message: String,
    uppercase: bool,
}

#[async_trait]
impl CeleryTask for MessageTask {
    fn parse_kwargs(&mut self, kwargs: &Kwargs) -> TaskResult<()> {
        self.message = kwargs
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::argument("undefined kwarg message"))?
            .to_string();
        self.uppercase = kwargs
            .get("uppercase")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(())
    }

    async fn run_task(&mut self) -> TaskResult<Value> {
        // Simulate some work
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = if self.uppercase {
            self.message.to_uppercase()
        } else {
            self.message.to_lowercase()
        };
        info!("Processed message: '{}' -> '{}'", self.message, result);
        Ok(json!(result))
    }

    fn arg_names(&self) -> &'static [&'static str] {
        &["message", "uppercase"]
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting simple worker example");

    let redis_config = RedisConfig::default();
    let broker = RedisBroker::new(redis_config.clone()).await?;
    let backend = RedisBackend::new(redis_config).await?;

    let worker_config = WorkerConfig {
        num_workers: 4,
        ..Default::default()
    };
    let client = CeleryClient::with_config(
        Arc::new(broker),
        Arc::new(backend),
        ClientConfig::default(),
        worker_config,
    );

    client.register_fn("worker.add", |a: i64, b: i64| a + b).await;
    client.register_task::<MessageTask>("worker.message").await;

    client.start_worker()?;
    info!("Workers running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    // Stop taking new work and let running tasks store their results
    client.stop_worker();
    client.wait_for_stop_worker().await;

    let stats = client.worker_stats();
    info!(
        "Processed {} tasks ({} ok, {} failed)",
        stats.tasks_processed, stats.tasks_successful, stats.tasks_failed
    );
    Ok(())
}
