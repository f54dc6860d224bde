//! Reusable message structures
//!
//! Encoding and decoding happen on every submission and every executed task.
//! [`MessagePools`] keeps a freelist per message type so the hot path reuses
//! allocated strings, vectors and maps instead of allocating fresh ones.
//!
//! Ownership makes the acquire/release pair safe: [`MessagePool::release`]
//! takes the message by value, so nothing can read it after release.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::protocol::{CeleryMessage, ResultMessage, TaskMessage};

/// Message types that can be reset and handed out again
pub trait Poolable: Default + Send {
    /// Forget every field, keeping capacity
    fn reset(&mut self);
}

impl Poolable for TaskMessage {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Poolable for CeleryMessage {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Poolable for ResultMessage {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Configuration for message pools
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle messages kept per type
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 1024 }
    }
}

/// Freelist of one message type
#[derive(Debug)]
pub struct MessagePool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Poolable> MessagePool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take a blank message, reusing an idle one when available
    pub fn acquire(&self) -> T {
        self.idle.lock().pop().unwrap_or_default()
    }

    /// Give a message back; it is reset before it can be handed out again
    pub fn release(&self, mut message: T) {
        message.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(message);
        }
    }

    /// Number of idle messages
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// One pool per wire message type, shared by a client and its worker pool
#[derive(Debug)]
pub struct MessagePools {
    pub tasks: MessagePool<TaskMessage>,
    pub envelopes: MessagePool<CeleryMessage>,
    pub results: MessagePool<ResultMessage>,
}

impl MessagePools {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            tasks: MessagePool::new(config.max_idle),
            envelopes: MessagePool::new(config.max_idle),
            results: MessagePool::new(config.max_idle),
        })
    }
}

impl Default for MessagePools {
    fn default() -> Self {
        let config = PoolConfig::default();
        Self {
            tasks: MessagePool::new(config.max_idle),
            envelopes: MessagePool::new(config.max_idle),
            results: MessagePool::new(config.max_idle),
        }
    }
}
