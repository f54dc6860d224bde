//! # Celery Queue
//!
//! A client and worker pool speaking the Celery task protocol, using Rust and Redis.
//!
//! ## Features
//!
//! - Celery compatible task, envelope and result messages
//! - Pluggable broker and result backend (Redis and in-memory included)
//! - Structured tasks and plain typed closures as task implementations
//! - Concurrent worker pool with cooperative, graceful shutdown
//! - Polling result handles with caching and timeouts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use celery_queue::{CeleryClient, RedisBackend, RedisBroker};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> celery_queue::TaskResult<()> {
//! let client = CeleryClient::new(
//!     Arc::new(RedisBroker::new_default().await?),
//!     Arc::new(RedisBackend::new_default().await?),
//!     4,
//! );
//!
//! client.register_fn("worker.add", |a: i64, b: i64| a + b).await;
//! client.start_worker()?;
//!
//! let mut result = client.delay("worker.add", (2, 5)).await?;
//! println!("{}", result.get(Duration::from_secs(10)).await?);
//!
//! client.stop_worker();
//! client.wait_for_stop_worker().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod broker;
pub mod client;
pub mod error;
pub mod memory;
pub mod pool;
pub mod protocol;
pub mod redis_transport;
pub mod registry;
pub mod result;
pub mod worker;

// Re-export commonly used types
pub use backend::Backend;
pub use broker::Broker;
pub use client::{CeleryClient, ClientConfig};
pub use error::{TaskError, TaskResult};
pub use memory::{MemoryBackend, MemoryBroker};
pub use pool::{MessagePools, PoolConfig};
pub use protocol::{CeleryMessage, Kwargs, ResultMessage, ResultStatus, TaskMessage};
pub use redis_transport::{RedisBackend, RedisBroker, RedisConfig};
pub use registry::{CeleryTask, IntoTaskOutput, Json, TaskFn, TaskHandler, TaskRegistry};
pub use result::AsyncResult;
pub use worker::{CeleryWorker, WorkerConfig, WorkerStats};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
