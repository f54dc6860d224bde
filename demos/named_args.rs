//! In-process example with named arguments
//!
//! Runs producer and workers in one process over the in-memory transport,
//! so no Redis is needed.
//!
//! Run: cargo run --example named_args

use async_trait::async_trait;
use celery_queue::{
    CeleryClient, CeleryTask, Kwargs, MemoryBackend, MemoryBroker, TaskError, TaskResult,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Integer addition with named arguments `a` and `b`
#[derive(Debug, Default)]
struct AddTask {
    a: i64,
    b: i64,
}

fn int_kwarg(kwargs: &Kwargs, name: &str) -> TaskResult<i64> {
    kwargs
        .get(name)
        .ok_or_else(|| TaskError::argument(format!("undefined kwarg {}", name)))?
        .as_f64()
        .map(|value| value as i64)
        .ok_or_else(|| TaskError::argument(format!("malformed kwarg {}", name)))
}

#[async_trait]
impl CeleryTask for AddTask {
    fn parse_kwargs(&mut self, kwargs: &Kwargs) -> TaskResult<()> {
        self.a = int_kwarg(kwargs, "a")?;
        self.b = int_kwarg(kwargs, "b")?;
        Ok(())
    }

    async fn run_task(&mut self) -> TaskResult<Value> {
        Ok(json!(self.a + self.b))
    }

    fn arg_names(&self) -> &'static [&'static str] {
        &["a", "b"]
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let client = CeleryClient::new(
        Arc::new(MemoryBroker::new()),
        Arc::new(MemoryBackend::new()),
        5,
    );
    client.register_task::<AddTask>("add").await;

    let shutdown = CancellationToken::new();
    client.start_worker_with_context(&shutdown)?;

    let mut named = client
        .delay_kwargs("add", json!({"a": 3, "b": 4}), None)
        .await?;
    info!("add(a=3, b=4) = {}", named.get(Duration::from_secs(5)).await?);

    let mut positional = client.delay("add", (2, 5)).await?;
    info!("add(2, 5) = {}", positional.get(Duration::from_secs(5)).await?);

    shutdown.cancel();
    client.wait_for_stop_worker().await;
    Ok(())
}
