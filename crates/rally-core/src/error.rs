use thiserror::Error;

/// The full failure taxonomy of the core. Callers get exactly one of these;
/// nothing is retried internally. `Conflict` and `AtCapacity` are expected
/// outcomes of races, not system errors, and are never logged as such.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input, unknown entity, or a self-request.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The actor lacks permission for the requested transition.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The state already moved: duplicate pending request, or a resolution
    /// raced against another and lost.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The roster was full at approval time; the request stays pending.
    #[error("activity is at capacity")]
    AtCapacity,

    /// Store or channel failure. Whether to retry is the caller's decision.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable tag, used in API error bodies.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::AtCapacity => "at_capacity",
            Self::Transient(_) => "transient",
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(e)
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Transient(anyhow::Error::new(e))
    }
}
