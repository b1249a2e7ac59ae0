//! Coordination-service client abstraction.
//!
//! The mirror only talks to the service through these traits. Implementations:
//! - `InMemoryEnsemble` / `InMemoryClient` (memory.rs) - for testing
//! - adapters over a real wire client live outside this crate
//!
//! Watches are single-shot: a watch registered by `get_data(.., true)` or
//! `get_children(.., true)` fires at most one event and must be re-registered
//! by the handler of that event.

use crate::session::SessionState;
use crate::stat::Stat;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch: {0}")]
    BadVersion(String),

    #[error("Connection lost")]
    ConnectionLoss,

    #[error("Session expired")]
    SessionExpired,

    #[error("Client closed")]
    Closed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Client error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Raw notification delivered by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedEvent {
    /// The session changed state.
    Session(SessionState),
    /// A node watched for existence was created.
    NodeCreated(String),
    /// A watched node was deleted.
    NodeDeleted(String),
    /// A watched node's data changed.
    NodeDataChanged(String),
    /// A watched node's child list changed.
    NodeChildrenChanged(String),
}

impl WatchedEvent {
    /// Path the event refers to; `None` for session events.
    pub fn path(&self) -> Option<&str> {
        match self {
            WatchedEvent::Session(_) => None,
            WatchedEvent::NodeCreated(p)
            | WatchedEvent::NodeDeleted(p)
            | WatchedEvent::NodeDataChanged(p)
            | WatchedEvent::NodeChildrenChanged(p) => Some(p),
        }
    }
}

/// Receiving end of a client's notification stream.
pub type EventReceiver = mpsc::UnboundedReceiver<WatchedEvent>;

/// One logical session to a coordination-service ensemble.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Read data and stat, optionally leaving a data watch.
    async fn get_data(&self, path: &str, watch: bool) -> Result<(Option<Vec<u8>>, Stat)>;

    /// List child names, optionally leaving a child watch.
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    /// Stat of the node, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Create a persistent node. Returns the created path.
    async fn create(&self, path: &str, data: Option<&[u8]>) -> Result<String>;

    /// Replace the data. `expected_version` of `None` matches any version.
    async fn set_data(
        &self,
        path: &str,
        data: Option<&[u8]>,
        expected_version: Option<i32>,
    ) -> Result<Stat>;

    /// Delete a childless node. `expected_version` of `None` matches any version.
    async fn delete(&self, path: &str, expected_version: Option<i32>) -> Result<()>;

    /// End the session.
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a connection target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start connecting, asking the ensemble for `session_timeout`. The
    /// session announces `Connected` (or a failure state) on the returned
    /// event stream.
    async fn connect(
        &self,
        target: &str,
        session_timeout: Duration,
    ) -> Result<(Arc<dyn CoordinationClient>, EventReceiver)>;
}

// Lets tests keep a handle on a connector they pass to the mirror.
#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(
        &self,
        target: &str,
        session_timeout: Duration,
    ) -> Result<(Arc<dyn CoordinationClient>, EventReceiver)> {
        (**self).connect(target, session_timeout).await
    }
}
