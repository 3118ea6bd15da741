// ============================================================================
// Error Taxonomy
// ============================================================================
//
// One error enum for the whole core. Each variant maps to a handling policy:
//
// - TransientBroker   -> retried with backoff
// - BrokerUnreachable -> fatal for the subscription loop that observed it
// - PermanentDecode   -> no retries, straight to the dead-letter topic
// - Transaction       -> unit of work aborted, surfaced to the caller
// - Configuration     -> fail fast at startup
//
// ============================================================================

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("permanent decode error: {0}")]
    PermanentDecode(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A consumer loop that panicked or had to be aborted on shutdown.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Failure reported by a message handler. Displays the bare message so the
    /// dead-letter record carries exactly what the handler said.
    #[error("{0}")]
    Handler(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Errors worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Error::PermanentDecode(_)
                | Error::Configuration(_)
                | Error::Validation(_)
                | Error::BrokerUnreachable(_)
        )
    }

    /// Errors that terminate a consumer loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BrokerUnreachable(_))
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler(message.into())
    }
}

impl crate::utils::IsTransient for Error {
    fn is_transient(&self) -> bool {
        Error::is_transient(self)
    }
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unreachable(msg) => Error::BrokerUnreachable(msg),
            BrokerError::Decode(msg) => Error::PermanentDecode(msg),
            other => Error::TransientBroker(other.to_string()),
        }
    }
}

/// Unit-of-work lifecycle failures.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("begin failed: {0}")]
    Begin(#[source] StorageError),

    #[error("commit failed: {0}")]
    Commit(#[source] StorageError),

    #[error("rollback failed: {0}")]
    Rollback(#[source] StorageError),

    #[error("unit of work {0} is already open on this task; pass the open unit instead of nesting")]
    Nested(uuid::Uuid),

    #[error("unit of work {0} is no longer open")]
    Closed(uuid::Uuid),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed row in {collection}: {reason}")]
    MalformedRow { collection: String, reason: String },

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("transaction already finished")]
    Finished,
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Connection(e.to_string())
            }
            other => StorageError::Database(other.to_string()),
        }
    }
}

/// Errors surfaced by a broker backend. Converted into [`Error`] at the
/// publisher and consumer boundaries.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("admin operation failed: {0}")]
    Admin(String),

    #[error("undecodable message: {0}")]
    Decode(String),

    #[error("all brokers down: {0}")]
    Unreachable(String),

    #[error("client closed")]
    Closed,
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_) | BrokerError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_displays_bare_message() {
        assert_eq!(Error::handler("boom").to_string(), "boom");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientBroker("timeout".into()).is_transient());
        assert!(Error::handler("boom").is_transient());
        assert!(!Error::PermanentDecode("bad json".into()).is_transient());
        assert!(!Error::BrokerUnreachable("down".into()).is_transient());
        assert!(Error::BrokerUnreachable("down".into()).is_fatal());
    }

    #[test]
    fn test_broker_error_conversion() {
        assert!(matches!(
            Error::from(BrokerError::Unreachable("x".into())),
            Error::BrokerUnreachable(_)
        ));
        assert!(matches!(
            Error::from(BrokerError::Decode("x".into())),
            Error::PermanentDecode(_)
        ));
        assert!(matches!(
            Error::from(BrokerError::Send("x".into())),
            Error::TransientBroker(_)
        ));
    }
}
