use std::sync::Arc;

use crate::model::DataKind;

/// Result type used throughout the crate for data-side operations.
///
/// Evaluation never returns this type: evaluation-time defects surface as an
/// error [`Reason`](crate::eval::Reason) on the result instead (callers always
/// get a value plus a reason, never an `Err`).
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting, storing, or persisting flag data.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An item received from a data source or a persistent store failed
    /// structural validation or deserialization.
    #[error("malformed {kind} item {key:?}: {message}")]
    MalformedData {
        /// Namespace of the offending item.
        kind: DataKind,
        /// Key of the offending item, when known.
        key: Option<String>,
        /// What was wrong with it.
        message: String,
    },

    /// A persistent store backend operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A data source transport failed. Produced by initializer/synchronizer
    /// implementations and carried through status reporting.
    #[error("network error: {0}")]
    Network(String),

    /// The SDK was configured with invalid parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The background data system thread panicked.
    #[error("data system thread panicked")]
    DataSystemPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    pub(crate) fn malformed_data(
        kind: DataKind,
        key: Option<&str>,
        message: impl Into<String>,
    ) -> Error {
        Error::MalformedData {
            kind,
            key: key.map(str::to_owned),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Error from a persistent store backend (the database cores behind
/// [`PersistentDataStore`](crate::store::PersistentDataStore)).
///
/// Kept separate from [`Error`] so backends and the caching adapter can pass
/// it around without widening their signatures to the whole SDK taxonomy.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// Backend I/O failed (connection refused, timeout, etc.).
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// The backend returned a row that could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    /// Backend-specific failure.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Convenience constructor for backend-specific failures described by a
    /// message.
    pub fn new(message: impl Into<String>) -> StoreError {
        StoreError::Other(message.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}
