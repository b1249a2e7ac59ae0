//! Errors surfaced by the mirror's public API.

use crate::client::ClientError;
use crate::path::PathError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("Could not connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: ClientError,
    },

    #[error("Timed out after {0} ms waiting for the session to connect")]
    ConnectTimeout(u64),

    #[error("Session expired")]
    SessionExpired,

    #[error("Mirror is closed")]
    Closed,

    #[error("Node '{0}' already exists")]
    AlreadyExists(String),

    #[error("Node '{0}' can't be created: its parent node doesn't exist")]
    ParentMissing(String),

    #[error("Node '{0}' not found")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Rejected by the coordination service: {0}")]
    Remote(#[from] ClientError),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
