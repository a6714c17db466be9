//! Top-level error types for the claude-slack core.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error kind, stable across error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    NotAuthorized,
    Conflict,
    Invariant,
    Cancelled,
    Unavailable,
    Internal,
}

/// Top-level error enum. Every variant carries a short human message that
/// names the offending entity; `kind()` gives the machine-readable kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The machine-readable kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotAuthorized(_) => ErrorKind::NotAuthorized,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Invariant(_) => ErrorKind::Invariant,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Sqlx(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        Error::NotAuthorized(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            Error::not_authorized("agent 'a' is not a member of 'global:dev'").kind(),
            ErrorKind::NotAuthorized
        );
        assert_eq!(
            Error::Other(anyhow::anyhow!("boom")).kind(),
            ErrorKind::Internal
        );
    }
}
