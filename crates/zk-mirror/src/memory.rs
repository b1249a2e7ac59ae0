//! In-memory coordination service for testing.
//!
//! `InMemoryEnsemble` holds the tree and every session opened against it;
//! `InMemoryClient` is one session's handle. The ensemble follows the
//! semantics the mirror relies on:
//! - watches are single-shot and per session
//! - a node can only be created under an existing parent
//! - deleting a node with children is rejected
//! - every write bumps a global transaction id recorded in the stats
//!
//! Tests drive session trouble explicitly (`disconnect`, `reconnect`,
//! `expire`, `renew`) and can make reads of a path fail (`fail_reads`).

use crate::client::{
    ClientError, Connector, CoordinationClient, EventReceiver, Result, WatchedEvent,
};
use crate::path;
use crate::session::SessionState;
use crate::stat::Stat;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use web_time::{SystemTime, UNIX_EPOCH};

struct ZNode {
    data: Option<Vec<u8>>,
    stat: Stat,
    /// Child names in creation order
    children: Vec<String>,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<WatchedEvent>,
    state: SessionState,
    /// Timeout the client asked for
    timeout: Duration,
    data_watches: HashSet<String>,
    child_watches: HashSet<String>,
    /// Events triggered while disconnected, delivered after reconnecting
    backlog: Vec<WatchedEvent>,
}

impl SessionEntry {
    fn deliver(&mut self, event: WatchedEvent) {
        match self.state {
            SessionState::Connected => {
                // Receiver dropped means the session owner went away.
                let _ = self.events.send(event);
            }
            SessionState::Disconnected | SessionState::Connecting => self.backlog.push(event),
            _ => {}
        }
    }

    fn announce(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.events.send(WatchedEvent::Session(state));
    }
}

struct EnsembleState {
    nodes: HashMap<String, ZNode>,
    zxid: i64,
    sessions: HashMap<i64, SessionEntry>,
    next_session: i64,
    read_faults: HashMap<String, ClientError>,
    /// One-shot failures for `get_children`
    listing_faults: HashMap<String, ClientError>,
    refuse_connections: bool,
    auto_connect: bool,
}

impl EnsembleState {
    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn check_session(&self, id: i64) -> Result<()> {
        match self.sessions.get(&id).map(|s| s.state) {
            Some(SessionState::Connected) => Ok(()),
            Some(SessionState::Expired) => Err(ClientError::SessionExpired),
            Some(SessionState::Closed) | None => Err(ClientError::Closed),
            Some(_) => Err(ClientError::ConnectionLoss),
        }
    }

    fn check_fault(&self, path: &str) -> Result<()> {
        match self.read_faults.get(path) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn node(&self, path: &str) -> Result<&ZNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| ClientError::NoNode(path.to_string()))
    }

    /// Fire and consume data watches on `path`.
    fn trigger_data(&mut self, path: &str, event: WatchedEvent) {
        for session in self.sessions.values_mut() {
            if session.data_watches.remove(path) {
                session.deliver(event.clone());
            }
        }
    }

    /// Fire and consume child watches on `path`.
    fn trigger_children(&mut self, path: &str) {
        for session in self.sessions.values_mut() {
            if session.child_watches.remove(path) {
                session.deliver(WatchedEvent::NodeChildrenChanged(path.to_string()));
            }
        }
    }

    fn create(&mut self, path: &str, data: Option<&[u8]>) -> Result<String> {
        path::validate(path).map_err(|e| ClientError::Other(e.to_string()))?;
        if self.nodes.contains_key(path) {
            return Err(ClientError::NodeExists(path.to_string()));
        }
        let parent = path::parent(path)
            .ok_or_else(|| ClientError::NodeExists(path.to_string()))?
            .to_string();
        if !self.nodes.contains_key(&parent) {
            return Err(ClientError::NoNode(parent));
        }

        let zxid = self.next_zxid();
        let now = now_millis();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: now,
            mtime: now,
            pzxid: zxid,
            data_length: data.map_or(0, |d| d.len() as i32),
            ..Default::default()
        };
        self.nodes.insert(
            path.to_string(),
            ZNode {
                data: data.map(|d| d.to_vec()),
                stat,
                children: Vec::new(),
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(path::name(path).to_string());
            parent_node.stat.cversion += 1;
            parent_node.stat.pzxid = zxid;
            parent_node.stat.num_children += 1;
        }

        debug!("Created {} (zxid {})", path, zxid);
        self.trigger_children(&parent);
        Ok(path.to_string())
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Option<&[u8]>,
        expected_version: Option<i32>,
    ) -> Result<Stat> {
        let version = self.node(path)?.stat.version;
        if expected_version.is_some_and(|v| v != version) {
            return Err(ClientError::BadVersion(path.to_string()));
        }
        let zxid = self.next_zxid();
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClientError::NoNode(path.to_string()))?;
        node.data = data.map(|d| d.to_vec());
        node.stat.mzxid = zxid;
        node.stat.mtime = now_millis();
        node.stat.version += 1;
        node.stat.data_length = data.map_or(0, |d| d.len() as i32);
        let stat = node.stat;

        self.trigger_data(path, WatchedEvent::NodeDataChanged(path.to_string()));
        Ok(stat)
    }

    fn delete(&mut self, path: &str, expected_version: Option<i32>) -> Result<()> {
        if path == path::ROOT {
            return Err(ClientError::Other("the root cannot be deleted".to_string()));
        }
        let node = self.node(path)?;
        if !node.children.is_empty() {
            return Err(ClientError::NotEmpty(path.to_string()));
        }
        if expected_version.is_some_and(|v| v != node.stat.version) {
            return Err(ClientError::BadVersion(path.to_string()));
        }

        let zxid = self.next_zxid();
        self.nodes.remove(path);
        let parent = path::parent(path).unwrap_or(path::ROOT).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            let name = path::name(path);
            parent_node.children.retain(|c| c != name);
            parent_node.stat.cversion += 1;
            parent_node.stat.pzxid = zxid;
            parent_node.stat.num_children -= 1;
        }

        debug!("Deleted {} (zxid {})", path, zxid);
        let deleted = WatchedEvent::NodeDeleted(path.to_string());
        for session in self.sessions.values_mut() {
            let had_data = session.data_watches.remove(path);
            let had_child = session.child_watches.remove(path);
            if had_data || had_child {
                session.deliver(deleted.clone());
            }
        }
        self.trigger_children(&parent);
        Ok(())
    }
}

/// Shared in-memory tree plus the sessions connected to it.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl InMemoryEnsemble {
    /// Ensemble holding only an empty root.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            path::ROOT.to_string(),
            ZNode {
                data: None,
                stat: Stat::default(),
                children: Vec::new(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes,
                zxid: 0,
                sessions: HashMap::new(),
                next_session: 1,
                read_faults: HashMap::new(),
                listing_faults: HashMap::new(),
                refuse_connections: false,
                auto_connect: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `path` (and any missing ancestors, with no data) outside any session.
    pub fn seed(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let mut ancestors = Vec::new();
        let mut current = path::parent(path);
        while let Some(p) = current {
            if state.nodes.contains_key(p) {
                break;
            }
            ancestors.push(p.to_string());
            current = path::parent(p);
        }
        for ancestor in ancestors.iter().rev() {
            state.create(ancestor, None)?;
        }
        state.create(path, Some(data))?;
        Ok(())
    }

    /// Data currently stored at `path`.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).and_then(|n| n.data.clone())
    }

    pub fn stat(&self, path: &str) -> Option<Stat> {
        self.lock().nodes.get(path).map(|n| n.stat)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Ids of every session ever opened, oldest first.
    pub fn session_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Session timeout requested when `session` was opened.
    pub fn session_timeout(&self, session: i64) -> Option<Duration> {
        self.lock().sessions.get(&session).map(|s| s.timeout)
    }

    pub fn session_state(&self, session: i64) -> Option<SessionState> {
        self.lock().sessions.get(&session).map(|s| s.state)
    }

    /// Make the next `get_children` of `path` fail once with `error`.
    pub fn fail_next_listing(&self, path: &str, error: ClientError) {
        self.lock().listing_faults.insert(path.to_string(), error);
    }

    /// Number of data and child watches `session` currently holds on `path`.
    pub fn watch_count(&self, session: i64, path: &str) -> (usize, usize) {
        self.lock()
            .sessions
            .get(&session)
            .map(|s| {
                (
                    s.data_watches.contains(path) as usize,
                    s.child_watches.contains(path) as usize,
                )
            })
            .unwrap_or((0, 0))
    }

    /// Make future `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// When false, new sessions stay `Connecting` until `announce_connected`.
    pub fn set_auto_connect(&self, auto: bool) {
        self.lock().auto_connect = auto;
    }

    pub fn announce_connected(&self, session: i64) {
        if let Some(entry) = self.lock().sessions.get_mut(&session) {
            entry.announce(SessionState::Connected);
        }
    }

    /// Make reads (`get_data`/`get_children`) of `path` fail until cleared.
    pub fn fail_reads(&self, path: &str, error: ClientError) {
        self.lock().read_faults.insert(path.to_string(), error);
    }

    pub fn clear_fault(&self, path: &str) {
        self.lock().read_faults.remove(path);
    }

    /// Drop the connection of `session`; watches survive.
    pub fn disconnect(&self, session: i64) {
        if let Some(entry) = self.lock().sessions.get_mut(&session) {
            if entry.state == SessionState::Connected {
                entry.announce(SessionState::Disconnected);
            }
        }
    }

    /// Restore the connection of `session` and flush events missed meanwhile.
    pub fn reconnect(&self, session: i64) {
        if let Some(entry) = self.lock().sessions.get_mut(&session) {
            if entry.state == SessionState::Disconnected {
                entry.announce(SessionState::Connected);
                for event in std::mem::take(&mut entry.backlog) {
                    let _ = entry.events.send(event);
                }
            }
        }
    }

    /// Expire `session`: all of its watches are dropped.
    pub fn expire(&self, session: i64) {
        if let Some(entry) = self.lock().sessions.get_mut(&session) {
            entry.data_watches.clear();
            entry.child_watches.clear();
            entry.backlog.clear();
            entry.announce(SessionState::Expired);
        }
    }

    /// Give an expired `session` a fresh identity on the same event stream.
    pub fn renew(&self, session: i64) {
        if let Some(entry) = self.lock().sessions.get_mut(&session) {
            if entry.state == SessionState::Expired {
                entry.announce(SessionState::Connected);
            }
        }
    }
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryEnsemble {
    async fn connect(
        &self,
        target: &str,
        session_timeout: Duration,
    ) -> Result<(Arc<dyn CoordinationClient>, EventReceiver)> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(ClientError::ConnectionFailed(target.to_string()));
        }
        let (events, rx) = mpsc::unbounded_channel();
        let id = state.next_session;
        state.next_session += 1;
        let mut entry = SessionEntry {
            events,
            state: SessionState::Connecting,
            timeout: session_timeout,
            data_watches: HashSet::new(),
            child_watches: HashSet::new(),
            backlog: Vec::new(),
        };
        if state.auto_connect {
            entry.announce(SessionState::Connected);
        }
        state.sessions.insert(id, entry);
        debug!(
            "Session {} opened for {} (timeout {:?})",
            id, target, session_timeout
        );

        let client = InMemoryClient {
            state: Arc::clone(&self.state),
            session: id,
        };
        Ok((Arc::new(client), rx))
    }
}

/// One session's handle on an `InMemoryEnsemble`.
pub struct InMemoryClient {
    state: Arc<Mutex<EnsembleState>>,
    session: i64,
}

impl InMemoryClient {
    pub fn session_id(&self) -> i64 {
        self.session
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    async fn get_data(&self, path: &str, watch: bool) -> Result<(Option<Vec<u8>>, Stat)> {
        let mut state = self.lock();
        state.check_session(self.session)?;
        state.check_fault(path)?;
        let node = state.node(path)?;
        let reply = (node.data.clone(), node.stat);
        if watch {
            if let Some(entry) = state.sessions.get_mut(&self.session) {
                entry.data_watches.insert(path.to_string());
            }
        }
        Ok(reply)
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.check_session(self.session)?;
        state.check_fault(path)?;
        if let Some(err) = state.listing_faults.remove(path) {
            return Err(err);
        }
        let children = state.node(path)?.children.clone();
        if watch {
            if let Some(entry) = state.sessions.get_mut(&self.session) {
                entry.child_watches.insert(path.to_string());
            }
        }
        Ok(children)
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let state = self.lock();
        state.check_session(self.session)?;
        Ok(state.nodes.get(path).map(|n| n.stat))
    }

    async fn create(&self, path: &str, data: Option<&[u8]>) -> Result<String> {
        let mut state = self.lock();
        state.check_session(self.session)?;
        state.create(path, data)
    }

    async fn set_data(
        &self,
        path: &str,
        data: Option<&[u8]>,
        expected_version: Option<i32>,
    ) -> Result<Stat> {
        let mut state = self.lock();
        state.check_session(self.session)?;
        state.set_data(path, data, expected_version)
    }

    async fn delete(&self, path: &str, expected_version: Option<i32>) -> Result<()> {
        let mut state = self.lock();
        state.check_session(self.session)?;
        state.delete(path, expected_version)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.lock();
        match state.sessions.get_mut(&self.session) {
            Some(entry) if entry.state != SessionState::Closed => {
                entry.data_watches.clear();
                entry.child_watches.clear();
                entry.state = SessionState::Closed;
                Ok(())
            }
            _ => Err(ClientError::Closed),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(ensemble: &InMemoryEnsemble) -> (Arc<dyn CoordinationClient>, EventReceiver) {
        let (client, mut rx) = ensemble
            .connect("memory", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WatchedEvent::Session(SessionState::Connected))
        );
        (client, rx)
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = InMemoryEnsemble::new();
        let (client, _rx) = connect(&ensemble).await;

        let err = client.create("/a/b", Some(b"x")).await.unwrap_err();
        assert_eq!(err, ClientError::NoNode("/a".to_string()));

        client.create("/a", None).await.unwrap();
        client.create("/a/b", Some(b"x")).await.unwrap();
        assert_eq!(client.get_children("/a", false).await.unwrap(), vec!["b"]);
        assert_eq!(ensemble.stat("/a").unwrap().num_children, 1);
    }

    #[tokio::test]
    async fn test_watches_are_single_shot() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a", b"1").unwrap();
        let (client, mut rx) = connect(&ensemble).await;

        client.get_data("/a", true).await.unwrap();
        client.set_data("/a", Some(b"2"), None).await.unwrap();
        client.set_data("/a", Some(b"3"), None).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::NodeDataChanged("/a".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_rejects_non_empty() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a/b", b"").unwrap();
        let (client, mut rx) = connect(&ensemble).await;
        client.get_children("/", true).await.unwrap();
        client.get_data("/a", true).await.unwrap();
        client.get_children("/a", true).await.unwrap();

        let err = client.delete("/a", None).await.unwrap_err();
        assert_eq!(err, ClientError::NotEmpty("/a".to_string()));

        client.delete("/a/b", None).await.unwrap();
        client.delete("/a", None).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::NodeChildrenChanged("/a".to_string())
        );
        assert_eq!(rx.try_recv().unwrap(), WatchedEvent::NodeDeleted("/a".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::NodeChildrenChanged("/".to_string())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_versions_and_zxids() {
        let ensemble = InMemoryEnsemble::new();
        let (client, _rx) = connect(&ensemble).await;
        client.create("/a", Some(b"1")).await.unwrap();
        let stat = client.set_data("/a", Some(b"22"), Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(stat.data_length, 2);
        assert!(stat.mzxid > stat.czxid);

        let err = client.set_data("/a", None, Some(0)).await.unwrap_err();
        assert_eq!(err, ClientError::BadVersion("/a".to_string()));
    }

    #[tokio::test]
    async fn test_disconnected_session_gets_backlog_on_reconnect() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a", b"1").unwrap();
        let (client, mut rx) = connect(&ensemble).await;
        let (writer, _wrx) = connect(&ensemble).await;
        client.get_data("/a", true).await.unwrap();

        let id = ensemble.session_ids()[0];
        ensemble.disconnect(id);
        assert_eq!(
            client.get_data("/a", false).await.unwrap_err(),
            ClientError::ConnectionLoss
        );
        writer.set_data("/a", Some(b"2"), None).await.unwrap();
        ensemble.reconnect(id);

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::Session(SessionState::Disconnected)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::Session(SessionState::Connected)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            WatchedEvent::NodeDataChanged("/a".to_string())
        );
    }

    #[tokio::test]
    async fn test_expire_drops_watches() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a", b"1").unwrap();
        let (client, _rx) = connect(&ensemble).await;
        client.get_data("/a", true).await.unwrap();
        let id = ensemble.session_ids()[0];
        assert_eq!(ensemble.watch_count(id, "/a"), (1, 0));

        ensemble.expire(id);
        assert_eq!(ensemble.watch_count(id, "/a"), (0, 0));
        assert_eq!(
            client.get_data("/a", true).await.unwrap_err(),
            ClientError::SessionExpired
        );

        ensemble.renew(id);
        assert!(client.get_data("/a", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_faults() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a", b"1").unwrap();
        let (client, _rx) = connect(&ensemble).await;
        ensemble.fail_reads("/a", ClientError::Other("disk".into()));
        assert!(client.get_data("/a", true).await.is_err());
        ensemble.clear_fault("/a");
        assert!(client.get_data("/a", true).await.is_ok());
    }

    #[tokio::test]
    async fn test_listing_fault_fires_once() {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a/b", b"").unwrap();
        let (client, _rx) = connect(&ensemble).await;
        let id = ensemble.session_ids()[0];
        ensemble.fail_next_listing("/a", ClientError::ConnectionLoss);

        assert_eq!(
            client.get_children("/a", true).await.unwrap_err(),
            ClientError::ConnectionLoss
        );
        assert_eq!(ensemble.watch_count(id, "/a"), (0, 0));
        assert_eq!(client.get_children("/a", true).await.unwrap(), vec!["b"]);
        assert_eq!(ensemble.watch_count(id, "/a"), (0, 1));
    }

    #[tokio::test]
    async fn test_sessions_record_timeout_and_state() {
        let ensemble = InMemoryEnsemble::new();
        let (client, _rx) = ensemble
            .connect("memory", Duration::from_millis(4500))
            .await
            .unwrap();
        let id = ensemble.session_ids()[0];
        assert_eq!(ensemble.session_timeout(id), Some(Duration::from_millis(4500)));
        assert_eq!(ensemble.session_state(id), Some(SessionState::Connected));

        client.close().await.unwrap();
        assert_eq!(ensemble.session_state(id), Some(SessionState::Closed));
        assert_eq!(ensemble.session_timeout(id + 1), None);
    }
}
