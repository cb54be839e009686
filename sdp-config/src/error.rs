use thiserror::Error;

/// Result alias used throughout the crate.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced by the configuration client.
///
/// Commit conflicts are deliberately *not* represented here: a conflicting
/// commit returns `false` and drives the retry loop instead of failing.
/// Transport errors from the networked backend are passed through unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// A key that was expected to be absent already exists.
    #[error("cannot create {path}, as it already exists")]
    Collision { path: String },

    /// A key that was expected to exist is missing.
    #[error("cannot access {path}, as it does not exist")]
    Vanished { path: String },

    /// A path failed validation.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// A transaction body kept conflicting until the retry bound was hit.
    #[error("transaction did not succeed after {retries} retries")]
    RetryExhausted { retries: u32 },

    /// The daily processing block ID counter ran out.
    #[error("exceeded daily number of processing blocks under {prefix}")]
    Exhausted { prefix: String },

    /// A read or write was attempted on an already-committed transaction.
    #[error("attempted to modify a committed transaction")]
    Committed,

    /// A value failed validation before it ever reached the database.
    #[error("{0}")]
    Invalid(String),

    /// The backend rejected or could not complete a request.
    #[error("backend error: {0}")]
    Backend(String),

    /// Transport-level failure talking to the store.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_path(path: &str, reason: &str) -> Self {
        Error::InvalidPath { path: path.to_owned(), reason: reason.to_owned() }
    }

    pub(crate) fn collision(path: &str) -> Self {
        Error::Collision { path: path.to_owned() }
    }

    pub(crate) fn vanished(path: &str) -> Self {
        Error::Vanished { path: path.to_owned() }
    }
}
