use thiserror::Error;
use tributary_state::StateError;
use tributary_storage::StorageError;

/// Creates a [`SinkError::Configuration`] with format string support.
#[macro_export]
macro_rules! config_err {
    ($($arg:tt)+) => {
        $crate::error::SinkError::Configuration(format!($($arg)+))
    };
}

/// Creates a [`SinkError::Schema`] with format string support.
#[macro_export]
macro_rules! schema_err {
    ($($arg:tt)+) => {
        $crate::error::SinkError::Schema(format!($($arg)+))
    };
}

#[derive(Error, Debug)]
#[must_use]
pub enum SinkError {
    #[error("invalid sink configuration: {0}")]
    Configuration(String),
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("subtask {subtask_index} failed: {message}")]
    TaskFailed {
        subtask_index: usize,
        message: String,
    },
    #[error("sink stopped unexpectedly: {0}")]
    Shutdown(String),
}

impl SinkError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.into(),
            source,
        }
    }

    /// Startup errors that no amount of restarting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Configuration(_) | SinkError::Schema(_))
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_macros() {
        let err = config_err!("partition column '{}' is not in the schema", "p");
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "invalid sink configuration: partition column 'p' is not in the schema"
        );

        let err = schema_err!("missing {}", "cdc");
        assert!(err.is_fatal());

        let err = SinkError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "i/o error on /tmp/x: disk full");
    }
}
