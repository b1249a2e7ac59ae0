//! Node records: one entry of the mirrored tree.

use crate::events::{EventBus, Subscription};
use crate::path;
use crate::stat::Stat;
use serde::{Serialize, Serializer};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// Observable properties of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Property {
    Data,
    Exists,
    Stat,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Data => "data",
            Property::Exists => "exists",
            Property::Stat => "stat",
        }
    }
}

/// Old or new value carried by a `PropertyChange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Data(Option<Vec<u8>>),
    Exists(bool),
    Stat(Option<Stat>),
}

/// A single change of one property of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// Path of the node that changed
    pub path: String,
    pub property: Property,
    pub old: PropertyValue,
    pub new: PropertyValue,
}

#[derive(Debug, Default)]
struct NodeState {
    data: Option<Vec<u8>>,
    stat: Option<Stat>,
    exists: bool,
}

struct NodeInner {
    path: String,
    name: String,
    state: RwLock<NodeState>,
    listeners: Arc<EventBus<PropertyChange>>,
}

/// Handle to a node of the mirrored tree.
///
/// Cloning the handle is cheap and every clone refers to the same record. A
/// record keeps its identity across delete and re-create: deletion only flips
/// `exists` to false, so listeners attached to a record keep working.
///
/// Getters hand out copies; only the mirror itself mutates a record.
#[derive(Clone)]
pub struct NodeRecord {
    inner: Arc<NodeInner>,
}

impl NodeRecord {
    /// New tombstoned record for `path`.
    pub(crate) fn new(path: &str) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                path: path.to_string(),
                name: path::name(path).to_string(),
                state: RwLock::new(NodeState::default()),
                listeners: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Copy of the data payload.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.read(|s| s.data.clone())
    }

    /// Copy of the metadata.
    pub fn stat(&self) -> Option<Stat> {
        self.read(|s| s.stat)
    }

    pub fn exists(&self) -> bool {
        self.read(|s| s.exists)
    }

    pub fn is_root(&self) -> bool {
        self.inner.path == path::ROOT
    }

    /// Display text: the name, followed by `=data` when data is non-empty.
    pub fn label(&self) -> String {
        match self.data() {
            Some(data) if !data.is_empty() => {
                format!("{}={}", self.name(), String::from_utf8_lossy(&data))
            }
            _ => self.name().to_string(),
        }
    }

    /// Point-in-time copy of the record.
    pub fn snapshot(&self) -> NodeSnapshot {
        self.read(|s| NodeSnapshot {
            path: self.inner.path.clone(),
            name: self.inner.name.clone(),
            data: s.data.clone(),
            stat: s.stat,
            exists: s.exists,
        })
    }

    /// Whether both handles refer to the same record.
    pub fn same_record(&self, other: &NodeRecord) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to changes of one property, or of every property when
    /// `property` is `None`.
    pub fn subscribe(
        &self,
        property: Option<Property>,
        callback: impl Fn(&PropertyChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(move |change: &PropertyChange| {
            if property.map_or(true, |p| p == change.property) {
                callback(change);
            }
        })
    }

    /// Subscribe to changes of every property.
    pub fn subscribe_all(
        &self,
        callback: impl Fn(&PropertyChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(None, callback)
    }

    /// Replace data, stat and `exists` under one lock.
    ///
    /// Returns one change per property that actually changed. `Exists` is
    /// reported first when the node goes away and last when it appears.
    pub(crate) fn set_state(
        &self,
        data: Option<&[u8]>,
        stat: Option<Stat>,
        exists: bool,
    ) -> Vec<PropertyChange> {
        let mut state = self.write();
        let mut changes = Vec::new();

        let exists_change = (state.exists != exists).then(|| {
            state.exists = exists;
            self.change(
                Property::Exists,
                PropertyValue::Exists(!exists),
                PropertyValue::Exists(exists),
            )
        });
        if !exists {
            changes.extend(exists_change.clone());
        }
        if state.data.as_deref() != data {
            let new = data.map(|d| d.to_vec());
            let old = std::mem::replace(&mut state.data, new.clone());
            changes.push(self.change(Property::Data, PropertyValue::Data(old), PropertyValue::Data(new)));
        }
        if state.stat != stat {
            let old = std::mem::replace(&mut state.stat, stat);
            changes.push(self.change(Property::Stat, PropertyValue::Stat(old), PropertyValue::Stat(stat)));
        }
        if exists {
            changes.extend(exists_change);
        }
        changes
    }

    pub(crate) fn set_stat(&self, stat: Option<Stat>) -> Option<PropertyChange> {
        let mut state = self.write();
        if state.stat == stat {
            return None;
        }
        let old = std::mem::replace(&mut state.stat, stat);
        Some(self.change(Property::Stat, PropertyValue::Stat(old), PropertyValue::Stat(stat)))
    }

    /// Deliver a change to this record's property listeners.
    pub(crate) fn fire(&self, change: &PropertyChange) -> usize {
        self.inner.listeners.emit(change)
    }

    pub(crate) fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }

    fn change(&self, property: Property, old: PropertyValue, new: PropertyValue) -> PropertyChange {
        PropertyChange {
            path: self.inner.path.clone(),
            property,
            old,
            new,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&NodeState) -> T) -> T {
        f(&self.inner.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, NodeState> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl PartialEq for NodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.same_record(other)
    }
}

impl Eq for NodeRecord {}

impl Hash for NodeRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.path.hash(state);
    }
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (exists, length) = self.read(|s| (s.exists, s.data.as_ref().map(|d| d.len())));
        f.debug_struct("NodeRecord")
            .field("path", &self.inner.path)
            .field("exists", &exists)
            .field("length", &length)
            .finish()
    }
}

impl Serialize for NodeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Serializable copy of a record's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub path: String,
    pub name: String,
    pub data: Option<Vec<u8>>,
    pub stat: Option<Stat>,
    pub exists: bool,
}
