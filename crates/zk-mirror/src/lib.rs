//! zk-mirror: client-side mirror of a hierarchical coordination-service tree.
//!
//! This crate provides:
//! - A node cache kept consistent through single-shot watches
//! - Recursive (re)population after structural changes and session loss
//! - Tree and per-node change notifications for observers
//! - Create/update/recursive-delete operations routed through the service
//! - `CoordinationClient` and `Connector` trait abstractions, with an
//!   in-memory implementation for tests

mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod mirror;
pub mod node;
pub mod path;
pub mod populate;
mod router;
pub mod session;
pub mod stat;

pub use client::{ClientError, Connector, CoordinationClient, EventReceiver, WatchedEvent};
pub use config::{ConfigError, MirrorConfig};
pub use error::{MirrorError, Result};
pub use events::{EventBus, Subscription, TreeEvent};
pub use memory::{InMemoryClient, InMemoryEnsemble};
pub use mirror::TreeMirror;
pub use node::{NodeRecord, NodeSnapshot, Property, PropertyChange, PropertyValue};
pub use populate::PopulateReport;
pub use session::SessionState;
pub use stat::Stat;
