//! Error types for kvetch.
//!
//! One taxonomy is shared by the storage engines, the change hub, the
//! reclamation scheduler and the API service, with HTTP status code
//! mappings for the transport layer.
//!
//! Absent keys are never an error (they are omitted from results) and a
//! reclamation pass with nothing to do is reported as
//! [`Reclaim::NoOp`](crate::store::Reclaim::NoOp), not as a failure.

/// Boxed source error carried by engine failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for kvetch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors with operation context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input rejected before it reaches the engine.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A read transaction or scan failed.
    #[error("failed to {context}: {source}")]
    Read {
        context: String,
        #[source]
        source: BoxError,
    },

    /// A write batch could not be applied. The store is unchanged.
    #[error("failed to {context}: {source}")]
    Write {
        context: String,
        #[source]
        source: BoxError,
    },

    /// I/O failure while reclaiming space.
    #[error("reclamation failed to {context}: {source}")]
    Reclamation {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The live change feed of a subscription broke.
    #[error("subscription feed failed: {0}")]
    Feed(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (task join failures and the like).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a read error with context.
    pub fn read(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Read {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Create a write error with context.
    pub fn write(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Write {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Create a reclamation error with context.
    pub fn reclamation(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Reclamation {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Get the appropriate HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Feed(_) => 503,
            Self::Config(_) => 422,
            Self::Read { .. }
            | Self::Write { .. }
            | Self::Reclamation { .. }
            | Self::Internal(_) => 500,
        }
    }

    /// Returns true for errors caused by the caller's input.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}
