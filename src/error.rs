use thiserror::Error;

/// Type alias for `Result<T, streamkit::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents all the ways a streamkit operation can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or contradictory configuration: missing backend, a
    /// `password` without a `user`, more than one `_env`/`_eval` variant of
    /// the same option, or a URL rejected by the driver.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required field was missing on a value at construction, or an
    /// unrecognized table/topic name was passed to an API.
    #[error("validation error: {0}")]
    Validation(String),

    /// A driver-level failure from `publish`, `fetch`, `latest`, `update`,
    /// or the key interner.
    #[cfg(feature = "database")]
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}
