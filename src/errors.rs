//! Error kinds shared across the server
//!
//! Every component raises the same set of kinds; the websocket layer turns
//! them into `error` frames and the HTTP layer maps them onto status codes.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Crate-wide error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// No, invalid, or expired credentials.
    #[error("authentication required")]
    Unauthenticated,

    /// Role or IP gate failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Schema or value validation failed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        message: String,
        details: Vec<String>,
    },

    /// The action is not valid in the current phase or state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Duplicate wager, duplicate cashout.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Balance would go negative.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// A user-configured daily limit would be crossed.
    #[error("daily limit exceeded: {0}")]
    DailyLimitExceeded(String),

    /// Rate limit hit; carries a retry hint.
    #[error("rate limited, retry after {retry_after_secs}s")]
    ResourceExhausted { retry_after_secs: u64 },

    /// Persistence or network deadline expired.
    #[error("operation timed out")]
    DeadlineExceeded,

    /// Programmer error or unexpected failure. Safe message to clients,
    /// full detail to logs.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn invalid_with(message: impl Into<String>, details: Vec<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
            details,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Stable machine-readable code, used in error frames and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "UNAUTHENTICATED",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Error::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Error::DailyLimitExceeded(_) => "DAILY_LIMIT_EXCEEDED",
            Error::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Error::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Transient kinds are retried at most once by the persistence gateway.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DeadlineExceeded)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound("row not found".to_string()),
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::DatabaseBusy
                    || inner.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Error::DeadlineExceeded
            }
            other => Error::Internal(format!("sqlite: {}", other)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::invalid(format!("malformed payload: {}", e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Unauthenticated.code(), "UNAUTHENTICATED");
        assert_eq!(Error::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            Error::ResourceExhausted {
                retry_after_secs: 5
            }
            .code(),
            "RESOURCE_EXHAUSTED"
        );
    }

    #[test]
    fn busy_maps_to_deadline() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err: Error = busy.into();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(err.is_transient());
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
