//! Error type definitions
//!
//! Provides all possible error types in the redmq broker.

use std::time::Duration;

/// Result type alias for redmq
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the redmq broker
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Redis-related errors
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::RedisError),

    /// A Lua script returned a reply that could not be understood
    #[error("Script error: {0}")]
    Script(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid queue, exchange, consumer group or message parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid topic or binding pattern
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue already exists
    #[error("Queue already exists: {0}")]
    QueueExists(String),

    /// Queue still holds pending, scheduled or in-flight messages
    #[error("Queue is not empty: {0}")]
    QueueNotEmpty(String),

    /// Queue has consumers attached
    #[error("Queue has active consumers: {0}")]
    QueueHasActiveConsumers(String),

    /// Queue is bound to at least one exchange
    #[error("Queue has bound exchanges: {0}")]
    QueueHasBoundExchanges(String),

    /// The queue's operational state does not allow the operation
    #[error("Operation {operation} is forbidden while queue {queue} is {state}")]
    ForbiddenOperation {
        /// Queue name
        queue: String,
        /// Requested operation
        operation: String,
        /// Current operational state
        state: String,
    },

    /// Requested state is not reachable from the current state
    #[error("Invalid queue state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Queue is locked and the caller does not hold the lock
    #[error("Queue is locked: {0}")]
    QueueLocked(String),

    /// Concurrent modification detected, caller may retry
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// A consumer group is required for PUB_SUB queues
    #[error("Consumer group required for queue {0}")]
    ConsumerGroupRequired(String),

    /// Consumer groups are only supported by PUB_SUB queues
    #[error("Consumer groups are not supported by queue {0}")]
    ConsumerGroupNotSupported(String),

    /// Consumer group not found
    #[error("Consumer group not found: {0}")]
    ConsumerGroupNotFound(String),

    /// Consumer group still has pending messages
    #[error("Consumer group is not empty: {0}")]
    ConsumerGroupNotEmpty(String),

    /// Namespace not found
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Message not found
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Message is currently held by a consumer
    #[error("Message is being processed: {0}")]
    MessageInProcess(String),

    /// Message was expected in a processing list but is not there
    #[error("Message is not in processing: {0}")]
    MessageNotInProcessing(String),

    /// Exchange not found
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Exchange exists with another type
    #[error("Exchange type mismatch: {0}")]
    ExchangeTypeMismatch(String),

    /// Queue type is not accepted by the exchange's queue policy
    #[error("Exchange queue policy mismatch: {0}")]
    ExchangeQueuePolicyMismatch(String),

    /// Exchange still has bound queues
    #[error("Exchange has bound queues: {0}")]
    ExchangeHasBoundQueues(String),

    /// Routing resolved to no destination queue
    #[error("No queue matched the message destination: {0}")]
    NoMatchedQueues(String),

    /// Producer or consumer has not been started
    #[error("Instance is not running: {0}")]
    InstanceNotRunning(String),

    /// A start/stop transition is already in progress
    #[error("Instance is busy: {0}")]
    InstanceBusy(String),

    /// Background worker lock is held elsewhere
    #[error("Lock not acquired: {0}")]
    LockNotAcquired(String),

    /// Message handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// Consume timeout, lock timeout or other deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Redis(_)
                | Error::Connection(_)
                | Error::Timeout(_)
                | Error::StateConflict(_)
                | Error::LockNotAcquired(_)
        )
    }

    /// Check if the error is fatal (non-recoverable)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidTopic(_) | Error::Config(_) | Error::Shutdown
        )
    }

    /// Check if the error reports a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::QueueNotFound(_)
                | Error::MessageNotFound(_)
                | Error::ExchangeNotFound(_)
                | Error::ConsumerGroupNotFound(_)
                | Error::NamespaceNotFound(_)
        )
    }

    /// Get the suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Timeout(_) => Some(Duration::from_secs(60)),
            Error::Connection(_) => Some(Duration::from_secs(5)),
            Error::Redis(_) => Some(Duration::from_secs(1)),
            Error::StateConflict(_) => Some(Duration::from_millis(50)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        use fred::error::RedisErrorKind;
        assert!(Error::Redis(fred::error::RedisError::new(RedisErrorKind::Unknown, "test")).is_retryable());
        assert!(Error::Connection("test".to_string()).is_retryable());
        assert!(Error::Timeout("test".to_string()).is_retryable());
        assert!(Error::StateConflict("q".to_string()).is_retryable());
        assert!(!Error::Validation("test".to_string()).is_retryable());
        assert!(!Error::Config("test".to_string()).is_retryable());
    }

    #[test]
    fn test_fatal_and_not_found() {
        assert!(Error::InvalidTopic("a..b".into()).is_fatal());
        assert!(!Error::QueueNotFound("q".into()).is_fatal());
        assert!(Error::MessageNotFound("id".into()).is_not_found());
        assert!(!Error::QueueLocked("q".into()).is_not_found());
    }

    #[test]
    fn test_forbidden_operation_message() {
        let err = Error::ForbiddenOperation {
            queue: "orders@shop".into(),
            operation: "produce".into(),
            state: "stopped".into(),
        };
        assert_eq!(
            err.to_string(),
            "Operation produce is forbidden while queue orders@shop is stopped"
        );
    }
}
