//! Node cache: the local copy of the tree.
//!
//! Owns the path → record map and the parent → ordered children map. The
//! cache never fires notifications itself; every mutating primitive appends
//! the notifications it produced to an output list, and the caller dispatches
//! them once the cache lock is released.

use crate::error::{MirrorError, Result};
use crate::events::TreeEvent;
use crate::node::{NodeRecord, PropertyChange};
use crate::path;
use crate::stat::Stat;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A notification produced by a cache mutation, in the order it happened.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Property(NodeRecord, PropertyChange),
    Tree(TreeEvent),
}

/// What the cache knows about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Presence {
    Untracked,
    Tombstoned,
    Live,
}

#[derive(Default)]
pub(crate) struct NodeCache {
    nodes: HashMap<String, NodeRecord>,
    /// Keyed by parent path; paths identify records for the cache's lifetime.
    children: HashMap<String, Vec<NodeRecord>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<NodeRecord> {
        self.nodes.get(path).cloned()
    }

    pub fn presence(&self, path: &str) -> Presence {
        match self.nodes.get(path) {
            None => Presence::Untracked,
            Some(node) if node.exists() => Presence::Live,
            Some(_) => Presence::Tombstoned,
        }
    }

    pub fn is_live(&self, path: &str) -> bool {
        self.presence(path) == Presence::Live
    }

    pub fn parent_of(&self, node: &NodeRecord) -> Option<NodeRecord> {
        path::parent(node.path()).and_then(|p| self.get(p))
    }

    /// Live children of `path`, in listing order.
    pub fn children_of(&self, path: &str) -> Vec<NodeRecord> {
        self.children
            .get(path)
            .map(|list| list.iter().filter(|n| n.exists()).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of tracked records, tombstones included.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Paths of every live record, parents before children.
    pub fn live_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.exists())
            .map(|n| n.path().to_string())
            .collect();
        paths.sort_by(|a, b| path::depth(a).cmp(&path::depth(b)).then_with(|| a.cmp(b)));
        paths
    }

    fn record(&mut self, path: &str) -> NodeRecord {
        self.nodes
            .entry(path.to_string())
            .or_insert_with(|| NodeRecord::new(path))
            .clone()
    }

    /// Seed the root, or revive it if it was tombstoned. No-op when live.
    pub fn upsert_root(
        &mut self,
        data: Option<&[u8]>,
        stat: Stat,
        out: &mut Vec<Notification>,
    ) -> bool {
        if self.is_live(path::ROOT) {
            return false;
        }
        let root = self.record(path::ROOT);
        self.children.entry(path::ROOT.to_string()).or_default().clear();
        push_changes(out, &root, root.set_state(data, Some(stat), true));
        out.push(Notification::Tree(TreeEvent::NodeCreated { node: root }));
        true
    }

    /// Make `path` live with the given content and append it to its parent's
    /// child list. Returns `false` if it was already live.
    pub fn insert_live(
        &mut self,
        path: &str,
        data: Option<&[u8]>,
        stat: Stat,
        out: &mut Vec<Notification>,
    ) -> Result<bool> {
        if self.is_live(path) {
            return Ok(false);
        }
        let parent = path::parent(path)
            .ok_or_else(|| MirrorError::InvalidState("the root has no parent".to_string()))?;
        let node = self.record(path);
        self.add_child(parent, &node)?;
        self.children.entry(path.to_string()).or_default().clear();
        push_changes(out, &node, node.set_state(data, Some(stat), true));
        out.push(Notification::Tree(TreeEvent::NodeCreated { node }));
        Ok(true)
    }

    /// Append `child` to the ordered list of `parent`.
    pub fn add_child(&mut self, parent: &str, child: &NodeRecord) -> Result<()> {
        if !self.is_live(parent) {
            return Err(MirrorError::InvalidState(format!(
                "parent '{}' of '{}' is not live",
                parent,
                child.path()
            )));
        }
        if path::parent(child.path()) != Some(parent) {
            return Err(MirrorError::InvalidState(format!(
                "'{}' is not a direct child of '{}'",
                child.path(),
                parent
            )));
        }
        let list = self.children.entry(parent.to_string()).or_default();
        if list.iter().any(|n| n.same_record(child)) {
            return Err(MirrorError::InvalidState(format!(
                "'{}' is already listed under '{}'",
                child.path(),
                parent
            )));
        }
        list.push(child.clone());
        Ok(())
    }

    /// Remove `child` from the list of `parent`, returning its former index.
    pub fn remove_child(&mut self, parent: &str, child: &NodeRecord) -> Option<usize> {
        let list = self.children.get_mut(parent)?;
        let index = list.iter().position(|n| n.same_record(child))?;
        list.remove(index);
        Some(index)
    }

    /// Apply data and stat read from the service to a live node.
    ///
    /// Replies older than the cached stat are ignored. Returns whether
    /// anything changed.
    pub fn update_content(
        &mut self,
        path: &str,
        data: Option<&[u8]>,
        stat: Stat,
        out: &mut Vec<Notification>,
    ) -> bool {
        let Some(node) = self.nodes.get(path).filter(|n| n.exists()).cloned() else {
            return false;
        };
        if let Some(current) = node.stat() {
            if !stat.is_at_least(&current) {
                debug!("Ignoring stale content for {} (mzxid {} < {})", path, stat.mzxid, current.mzxid);
                return false;
            }
        }
        let changes = node.set_state(data, Some(stat), true);
        let changed = !changes.is_empty();
        push_changes(out, &node, changes);
        if changed {
            out.push(Notification::Tree(TreeEvent::NodeDataChanged { node }));
        }
        changed
    }

    /// Apply a fresher stat to a live node without touching its data.
    pub fn refresh_stat(&mut self, path: &str, stat: Stat, out: &mut Vec<Notification>) -> bool {
        let Some(node) = self.nodes.get(path).filter(|n| n.exists()).cloned() else {
            return false;
        };
        if let Some(current) = node.stat() {
            if !stat.is_at_least(&current) {
                return false;
            }
        }
        let change = node.set_stat(Some(stat));
        let changed = change.is_some();
        push_changes(out, &node, change);
        changed
    }

    /// Tombstone `path` and every live descendant, deepest first.
    ///
    /// Each tombstoned non-root node is spliced out of its parent's list and
    /// reported with its pre-removal index. Returns `false` if `path` was not
    /// live (duplicate delete).
    pub fn tombstone(&mut self, path: &str, out: &mut Vec<Notification>) -> bool {
        if !self.is_live(path) {
            return false;
        }
        let mut order = Vec::new();
        self.collect_post_order(path, &mut order);
        for node in order {
            self.tombstone_one(&node, out);
        }
        true
    }

    /// Tombstone the whole tree, root included.
    pub fn invalidate(&mut self, out: &mut Vec<Notification>) {
        self.tombstone(path::ROOT, out);
        let stray: Vec<NodeRecord> = self.nodes.values().filter(|n| n.exists()).cloned().collect();
        for node in stray {
            warn!("Unreachable live node {} during invalidation", node.path());
            self.tombstone_one(&node, out);
        }
        for list in self.children.values_mut() {
            list.clear();
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        for node in self.nodes.values() {
            node.clear_listeners();
        }
        self.nodes.clear();
        self.children.clear();
    }

    fn collect_post_order(&self, path: &str, order: &mut Vec<NodeRecord>) {
        for child in self.children_of(path) {
            self.collect_post_order(child.path(), order);
        }
        if let Some(node) = self.nodes.get(path) {
            order.push(node.clone());
        }
    }

    fn tombstone_one(&mut self, node: &NodeRecord, out: &mut Vec<Notification>) {
        let index = path::parent(node.path()).and_then(|parent| self.remove_child(parent, node));
        push_changes(out, node, node.set_state(None, None, false));
        match index {
            Some(index) => out.push(Notification::Tree(TreeEvent::NodeDeleted {
                node: node.clone(),
                index,
            })),
            None if !node.is_root() => {
                warn!("Tombstoned {} but it was not listed under its parent", node.path());
            }
            None => {}
        }
    }
}

fn push_changes(
    out: &mut Vec<Notification>,
    node: &NodeRecord,
    changes: impl IntoIterator<Item = PropertyChange>,
) {
    for change in changes {
        out.push(Notification::Property(node.clone(), change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(mzxid: i64) -> Stat {
        Stat {
            czxid: mzxid,
            mzxid,
            pzxid: mzxid,
            ..Default::default()
        }
    }

    fn tree_events(out: &[Notification]) -> Vec<TreeEvent> {
        out.iter()
            .filter_map(|n| match n {
                Notification::Tree(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn seeded() -> NodeCache {
        let mut cache = NodeCache::new();
        let mut out = Vec::new();
        cache.upsert_root(None, stat(0), &mut out);
        cache
    }

    #[test]
    fn test_upsert_root_is_idempotent() {
        let mut cache = NodeCache::new();
        let mut out = Vec::new();
        assert!(cache.upsert_root(Some(&b"r"[..]), stat(1), &mut out));
        assert!(!cache.upsert_root(Some(&b"other"[..]), stat(2), &mut out));
        assert_eq!(tree_events(&out).len(), 1);
        assert_eq!(cache.get("/").unwrap().data().as_deref(), Some(&b"r"[..]));
    }

    #[test]
    fn test_insert_requires_live_parent() {
        let mut cache = seeded();
        let mut out = Vec::new();
        let err = cache.insert_live("/a/b", None, stat(2), &mut out).unwrap_err();
        assert!(matches!(err, MirrorError::InvalidState(_)));
        assert!(out.is_empty());

        assert!(cache.insert_live("/a", None, stat(1), &mut out).unwrap());
        assert!(cache.insert_live("/a/b", None, stat(2), &mut out).unwrap());
        assert!(!cache.insert_live("/a/b", None, stat(2), &mut out).unwrap());
        assert_eq!(cache.children_of("/a").len(), 1);
    }

    #[test]
    fn test_add_child_rejects_wrong_parent_and_duplicates() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/a", None, stat(1), &mut out).unwrap();
        cache.insert_live("/b", None, stat(2), &mut out).unwrap();

        let stray = NodeRecord::new("/a/x");
        assert!(matches!(
            cache.add_child("/b", &stray),
            Err(MirrorError::InvalidState(_))
        ));
        let a = cache.get("/a").unwrap();
        assert!(matches!(cache.add_child("/", &a), Err(MirrorError::InvalidState(_))));
    }

    #[test]
    fn test_children_keep_listing_order() {
        let mut cache = seeded();
        let mut out = Vec::new();
        for (i, name) in ["/zeta", "/alpha", "/mid"].iter().enumerate() {
            cache.insert_live(name, None, stat(i as i64 + 1), &mut out).unwrap();
        }
        let names: Vec<_> = cache
            .children_of("/")
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_remove_child_reports_index_once() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/a", None, stat(1), &mut out).unwrap();
        cache.insert_live("/b", None, stat(2), &mut out).unwrap();
        let b = cache.get("/b").unwrap();
        assert_eq!(cache.remove_child("/", &b), Some(1));
        assert_eq!(cache.remove_child("/", &b), None);
    }

    #[test]
    fn test_tombstone_subtree_deepest_first() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/a", None, stat(1), &mut out).unwrap();
        cache.insert_live("/a/b", None, stat(2), &mut out).unwrap();
        cache.insert_live("/c", None, stat(3), &mut out).unwrap();
        let a = cache.get("/a").unwrap();

        out.clear();
        assert!(cache.tombstone("/a", &mut out));
        let deleted: Vec<_> = tree_events(&out)
            .into_iter()
            .map(|e| match e {
                TreeEvent::NodeDeleted { node, index } => (node.path().to_string(), index),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(deleted, vec![("/a/b".to_string(), 0), ("/a".to_string(), 0)]);
        assert!(!a.exists());
        assert_eq!(a.stat(), None);
        assert_eq!(cache.presence("/a"), Presence::Tombstoned);
        assert_eq!(cache.children_of("/").len(), 1);

        out.clear();
        assert!(!cache.tombstone("/a", &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn test_revive_reuses_record() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/a", Some(&b"1"[..]), stat(1), &mut out).unwrap();
        let before = cache.get("/a").unwrap();
        cache.tombstone("/a", &mut out);
        cache.insert_live("/a", Some(&b"2"[..]), stat(5), &mut out).unwrap();
        let after = cache.get("/a").unwrap();
        assert!(before.same_record(&after));
        assert!(after.exists());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_content_ignores_stale_replies() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/a", Some(&b"1"[..]), stat(1), &mut out).unwrap();

        out.clear();
        assert!(cache.update_content("/a", Some(&b"3"[..]), stat(3), &mut out));
        assert_eq!(tree_events(&out).len(), 1);

        out.clear();
        assert!(!cache.update_content("/a", Some(&b"2"[..]), stat(2), &mut out));
        assert!(!cache.update_content("/a", Some(&b"3"[..]), stat(3), &mut out));
        assert!(out.is_empty());
        assert_eq!(cache.get("/a").unwrap().data().as_deref(), Some(&b"3"[..]));
    }

    #[test]
    fn test_invalidate_tombstones_everything() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/a", None, stat(1), &mut out).unwrap();
        cache.insert_live("/a/b", None, stat(2), &mut out).unwrap();

        out.clear();
        cache.invalidate(&mut out);
        assert!(cache.live_paths().is_empty());
        assert_eq!(cache.len(), 3);
        let deletes = tree_events(&out)
            .iter()
            .filter(|e| matches!(e, TreeEvent::NodeDeleted { .. }))
            .count();
        assert_eq!(deletes, 2);
    }

    #[test]
    fn test_live_paths_parents_first() {
        let mut cache = seeded();
        let mut out = Vec::new();
        cache.insert_live("/b", None, stat(1), &mut out).unwrap();
        cache.insert_live("/b/c", None, stat(2), &mut out).unwrap();
        cache.insert_live("/a", None, stat(3), &mut out).unwrap();
        assert_eq!(cache.live_paths(), vec!["/", "/a", "/b", "/b/c"]);
    }
}
