//! Error types for the task client and worker pool

use thiserror::Error;

/// Result type alias for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error taxonomy shared by the protocol, the transports, the worker pool
/// and the client-side result handle
#[derive(Error, Debug)]
pub enum TaskError {
    /// Malformed, missing or mistyped task arguments
    #[error("Argument error: {message}")]
    Argument { message: String },

    /// No task is registered under the requested name
    #[error("Task not registered: {task_name}")]
    TaskNotFound { task_name: String },

    /// The task's own logic reported an error or panicked
    #[error("Task execution failed: {message}")]
    TaskFailure { message: String },

    /// A result handle observed a stored non-success result
    #[error("Task {task_id} finished with status {status}: {description}")]
    TaskFailed {
        task_id: String,
        status: String,
        description: String,
    },

    /// A message could not be decoded from the wire
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// A value could not be represented in the wire value model
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// The broker transport failed
    #[error("Broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    /// The result backend transport failed
    #[error("Backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create an argument error
    pub fn argument<S: Into<String>>(message: S) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    /// Create a task-not-found error
    pub fn task_not_found<S: Into<String>>(task_name: S) -> Self {
        Self::TaskNotFound {
            task_name: task_name.into(),
        }
    }

    /// Create a task failure error
    pub fn task_failure<S: Into<String>>(message: S) -> Self {
        Self::TaskFailure {
            message: message.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Create a broker error
    pub fn broker<S: Into<String>>(reason: S) -> Self {
        Self::BrokerUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(reason: S) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Exception class name written into failure results
    pub fn exc_type(&self) -> &'static str {
        match self {
            TaskError::Argument { .. } => "ArgumentError",
            TaskError::TaskNotFound { .. } => "NotRegistered",
            TaskError::TaskFailure { .. } | TaskError::TaskFailed { .. } => "TaskFailure",
            TaskError::MalformedMessage { .. } => "MalformedMessage",
            TaskError::InvalidPayload { .. } | TaskError::Serialization(_) => "InvalidPayload",
            TaskError::BrokerUnavailable { .. } => "BrokerUnavailable",
            TaskError::BackendUnavailable { .. } | TaskError::Redis(_) => "BackendUnavailable",
            TaskError::Timeout { .. } => "TimeoutError",
            TaskError::Config { .. } => "ConfigError",
            TaskError::Internal(_) => "InternalError",
        }
    }

    /// Check if the error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(_) => true,
            TaskError::Timeout { .. } => true,
            TaskError::BrokerUnavailable { .. } => true,
            TaskError::BackendUnavailable { .. } => true,
            TaskError::TaskFailure { .. } => true,
            TaskError::Argument { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::TaskFailed { .. } => false,
            TaskError::MalformedMessage { .. } => false,
            TaskError::InvalidPayload { .. } => false,
            TaskError::Serialization(_) => false,
            TaskError::Config { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}
