use thiserror::Error;

use crate::schema::SchemaError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Schema Error - {0}")]
    Schema(#[from] SchemaError),

    /// Network blips, broker unavailable. Retried inside the affected ingestor.
    #[error("Transient Ingest Error - {0}")]
    TransientIngest(String),

    /// Authorization failures or a stream that is permanently unreadable.
    #[error("Fatal Ingest Error - {0}")]
    FatalIngest(String),

    #[error("Sink Unavailable - {0}")]
    SinkUnavailable(String),

    #[error("Sink Corruption - {0}")]
    SinkCorruption(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Retries exhausted after {attempts} attempts - {last}")]
    RetriesExhausted { attempts: u16, last: Box<Error> },

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Pipeline Error - {0}")]
    Pipeline(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the operation that produced this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientIngest(_) | Error::SinkUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientIngest("broker down".into()).is_retryable());
        assert!(Error::SinkUnavailable("disk full".into()).is_retryable());
        assert!(!Error::FatalIngest("unauthorized".into()).is_retryable());
        assert!(!Error::SinkCorruption("bad checkpoint".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());

        let exhausted = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(Error::SinkUnavailable("timeout".into())),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(
            exhausted.to_string(),
            "Retries exhausted after 3 attempts - Sink Unavailable - timeout"
        );
    }
}
