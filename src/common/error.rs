//! Error types for revkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Data errors ===
    #[error("key already exists")]
    KeyExists,

    #[error("key or revision does not exist")]
    NotExists,

    #[error("revision does not match")]
    RevisionMismatch,

    #[error("revision has been compacted")]
    Compacted,

    // === Storage errors ===
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    // === Cluster errors ===
    #[error("no cluster leader available")]
    LeaderUnknown,

    #[error("not leader")]
    NotLeader,

    // === Network errors ===
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a transient error worth retrying?
    ///
    /// The single-writer SQL backend reports contention as a busy/locked
    /// failure; everything else is permanent from the caller's perspective.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Sql(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Convert to an HTTP status code for API responses
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotExists => StatusCode::NOT_FOUND,
            Error::KeyExists | Error::RevisionMismatch => StatusCode::CONFLICT,
            Error::Protocol(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::LeaderUnknown | Error::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transport("operation timed out".into())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
