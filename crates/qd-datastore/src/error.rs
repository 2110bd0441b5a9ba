//! Error kinds surfaced by the data store.

use thiserror::Error;

/// Typed errors returned by catalog, lifecycle, loader and sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted before the connection context was configured.
    #[error("not connected: {0}")]
    NotConnected(String),
    /// Lookup by id or uuid matched no row in any catalog.
    #[error("not found: {0}")]
    NotFound(String),
    /// A concurrent writer was detected (update counter moved, uuid collision).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Peer schema lacks a column the source has.
    #[error("schema drift: table {table} has no column {column}")]
    SchemaDrift { table: String, column: String },
    /// A user-facing name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Stored or supplied data violates a structural rule.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Wrapped backend (SQLite / pool) failure.
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Self::Backend(error.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(error: r2d2::Error) -> Self {
        Self::Backend(format!("connection pool: {}", error))
    }
}

impl Error {
    /// True for errors the sync loop treats as an expected retry signal.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
