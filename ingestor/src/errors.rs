use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection fault: {0}")]
    ConnectionFault(#[from] rumqttc::ConnectionError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(sqlx::Error),

    #[error("Schema setup failed: {message}")]
    Schema {
        message: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Ingestor is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn schema(message: &'static str, source: sqlx::Error) -> Self {
        Self::Schema { message, source }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_) | Error::ConnectionFault(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        // A closed pool never reopens; retrying against it only delays shutdown
        if matches!(err, sqlx::Error::PoolClosed) {
            Error::ShuttingDown
        } else if is_transient_error(&err) {
            Error::StorageUnavailable(err)
        } else {
            Error::Database(err)
        }
    }
}

/// Connection-level failures that say nothing about the statement itself.
pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_storage_unavailable() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_row_not_found_is_plain_database_error() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Database(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_closed_pool_is_not_retried() {
        let err = Error::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, Error::ShuttingDown));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_is_not_retryable() {
        assert!(!Error::Validation("missing timestamp".to_string()).is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
    }
}
