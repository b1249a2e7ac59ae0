//! The mirror handle.
//!
//! `TreeMirror` owns one session, the node cache and the router task that
//! keeps the cache in step with the service. Reads are served from the cache;
//! mutations go to the service and come back through the watch path.
//!
//! Every cache mutation runs through [`Shared::apply`]: the apply mutex is
//! taken, the cache is mutated under its write lock, the lock is released and
//! only then are the collected notifications delivered. Listeners therefore
//! see a consistent tree and may read the mirror from their callbacks.

use crate::cache::{NodeCache, Notification};
use crate::client::{ClientError, Connector, CoordinationClient};
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::events::{EventBus, Subscription, TreeEvent};
use crate::node::NodeRecord;
use crate::path;
use crate::populate::PopulateReport;
use crate::router::{Control, Router};
use crate::session::{SessionController, SessionState};
use crate::stat::Stat;
use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared between the mirror handle and the router task.
pub(crate) struct Shared {
    pub client: Arc<dyn CoordinationClient>,
    pub session: SessionController,
    pub config: MirrorConfig,
    cache: RwLock<NodeCache>,
    hub: Arc<EventBus<TreeEvent>>,
    apply_lock: Mutex<()>,
}

impl Shared {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        session: SessionController,
        config: MirrorConfig,
    ) -> Self {
        Self {
            client,
            session,
            config,
            cache: RwLock::new(NodeCache::new()),
            hub: Arc::new(EventBus::new()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Read the cache.
    pub fn read<R>(&self, f: impl FnOnce(&NodeCache) -> R) -> R {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        f(&cache)
    }

    /// Run one mutation step and deliver its notifications.
    ///
    /// Returns `None` without running `f` once the mirror is closed.
    pub fn apply<R>(&self, f: impl FnOnce(&mut NodeCache, &mut Vec<Notification>) -> R) -> Option<R> {
        let _step = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.session.is_alive() {
            return None;
        }
        let mut out = Vec::new();
        let result = {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            f(&mut cache, &mut out)
        };
        self.dispatch(out);
        Some(result)
    }

    /// Publish an event that doesn't come with a cache mutation.
    pub fn publish(&self, event: TreeEvent) {
        self.apply(|_, out| out.push(Notification::Tree(event)));
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::Property(node, change) => {
                    node.fire(&change);
                }
                Notification::Tree(event) => {
                    self.hub.emit(&event);
                }
            }
        }
    }

    /// Shut the cache down: no further steps run and all state is dropped.
    fn close(&self) -> bool {
        let _step = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.session.close() {
            return false;
        }
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.hub.clear();
        true
    }
}

/// Client-side mirror of a coordination-service tree.
pub struct TreeMirror {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl TreeMirror {
    /// Connect to `config.connect_string` and wait for the initial tree.
    ///
    /// Fails with `ConnectTimeout` if the session isn't `Connected` within
    /// `config.connect_timeout_ms`.
    pub async fn open(connector: impl Connector, config: MirrorConfig) -> Result<Self> {
        let session = SessionController::new();
        session.transition(SessionState::Connecting);

        let target = config.connect_string.clone();
        let (client, events) =
            connector
                .connect(&target, config.session_timeout())
                .await
                .map_err(|source| MirrorError::Connection {
                    target: target.clone(),
                    source,
                })?;

        let timeout = config.connect_timeout();
        let shared = Arc::new(Shared::new(client, session, config));
        let (control, control_rx) = mpsc::unbounded_channel();
        let router = Router::new(Arc::clone(&shared), events, control_rx);
        let handle = tokio::spawn(router.run());

        let mirror = Self {
            shared,
            control,
            router: Mutex::new(Some(handle)),
        };

        if let Err(e) = mirror.shared.session.wait_connected(timeout).await {
            warn!("Could not open mirror on {}: {}", target, e);
            if let Err(close_err) = mirror.close().await {
                debug!("Close after failed open: {}", close_err);
            }
            return Err(e);
        }
        mirror.sync().await?;
        info!(
            "Mirror open on {} ({} nodes)",
            target,
            mirror.shared.read(|cache| cache.live_paths().len())
        );
        Ok(mirror)
    }

    /// Subscribe to tree events. Drop the returned handle to unsubscribe.
    pub fn subscribe(&self, listener: impl Fn(&TreeEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        subscription.cancel();
    }

    /// Create `path` with `data`.
    ///
    /// The parent must be live in the mirror. The new node shows up once the
    /// service reports the change.
    pub async fn add_node(&self, path: &str, data: Option<&[u8]>) -> Result<()> {
        path::validate(path)?;
        self.shared.session.ensure_usable()?;
        let Some(parent) = path::parent(path) else {
            return Err(MirrorError::AlreadyExists(path.to_string()));
        };
        self.shared.read(|cache| {
            if cache.is_live(path) {
                Err(MirrorError::AlreadyExists(path.to_string()))
            } else if !cache.is_live(parent) {
                Err(MirrorError::ParentMissing(path.to_string()))
            } else {
                Ok(())
            }
        })?;

        self.shared.client.create(path, data).await?;
        debug!("Created {}", path);
        Ok(())
    }

    /// Replace the data of a live node. Returns the service's new stat.
    pub async fn update_data(&self, path: &str, data: Option<&[u8]>) -> Result<Stat> {
        path::validate(path)?;
        self.shared.session.ensure_usable()?;
        if !self.shared.read(|cache| cache.is_live(path)) {
            return Err(MirrorError::NotFound(path.to_string()));
        }

        let stat = self.shared.client.set_data(path, data, None).await?;
        self.shared
            .apply(|cache, out| cache.update_content(path, data, stat, out));
        debug!("Updated {} to version {}", path, stat.version);
        Ok(stat)
    }

    /// Delete `path` and everything below it.
    pub async fn delete_node(&self, path: &str) -> Result<()> {
        path::validate(path)?;
        if path == path::ROOT {
            return Err(MirrorError::InvalidState(
                "the root node cannot be deleted".to_string(),
            ));
        }
        self.shared.session.ensure_usable()?;
        if !self.shared.read(|cache| cache.is_live(path)) {
            return Err(MirrorError::NotFound(path.to_string()));
        }
        self.delete_tree(path).await?;
        debug!("Deleted {}", path);
        Ok(())
    }

    /// Delete several subtrees. Paths inside another listed subtree are
    /// skipped. Every path is attempted; the first failure is returned.
    pub async fn delete_nodes(&self, paths: &[&str]) -> Result<()> {
        // Only deletable paths can cover others; the rest fail on their own.
        let deletable: Vec<&str> = paths
            .iter()
            .copied()
            .filter(|p| *p != path::ROOT && path::validate(p).is_ok())
            .collect();
        let mut targets: Vec<&str> = Vec::new();
        for &candidate in paths {
            let covered = targets.contains(&candidate)
                || deletable
                    .iter()
                    .any(|other| path::is_ancestor(other, candidate));
            if !covered {
                targets.push(candidate);
            }
        }

        let mut first_error = None;
        for target in targets {
            if let Err(e) = self.delete_node(target).await {
                warn!("Failed to delete {}: {}", target, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn delete_tree<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let client = &self.shared.client;
            let mut retries = 0;
            loop {
                let children = match client.get_children(path, false).await {
                    Ok(children) => children,
                    Err(ClientError::NoNode(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                for child in children {
                    let child_path = path::full_path(path, &child);
                    self.delete_tree(&child_path).await?;
                }
                match client.delete(path, None).await {
                    Ok(()) | Err(ClientError::NoNode(_)) => return Ok(()),
                    Err(ClientError::NotEmpty(_)) if retries < self.shared.config.delete_retries => {
                        retries += 1;
                        debug!("{} gained children while deleting, retry {}", path, retries);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        .boxed()
    }

    /// Tracked record at `path`, live or tombstoned.
    pub fn get_node(&self, path: &str) -> Option<NodeRecord> {
        self.shared.read(|cache| cache.get(path))
    }

    pub fn get_parent(&self, node: &NodeRecord) -> Option<NodeRecord> {
        self.shared.read(|cache| cache.parent_of(node))
    }

    /// Live children of `node`, in listing order.
    pub fn get_children(&self, node: &NodeRecord) -> Vec<NodeRecord> {
        self.shared.read(|cache| cache.children_of(node.path()))
    }

    pub fn full_path(&self, parent: &str, child: &str) -> String {
        path::full_path(parent, child)
    }

    pub fn root(&self) -> Option<NodeRecord> {
        self.get_node(path::ROOT)
    }

    /// Records from the root down to `node`, `None` if any link is missing.
    pub fn tree_path(&self, node: &NodeRecord) -> Option<Vec<NodeRecord>> {
        self.shared.read(|cache| {
            let mut chain = vec![node.clone()];
            let mut current = node.clone();
            while let Some(parent) = cache.parent_of(&current) {
                chain.push(parent.clone());
                current = parent;
            }
            if !current.is_root() {
                return None;
            }
            chain.reverse();
            Some(chain)
        })
    }

    /// Position of `child` among the live children of `parent`.
    pub fn index_of_child(&self, parent: &NodeRecord, child: &NodeRecord) -> Option<usize> {
        self.get_children(parent)
            .iter()
            .position(|n| n.same_record(child))
    }

    pub fn child_count(&self, parent: &NodeRecord) -> usize {
        self.get_children(parent).len()
    }

    pub fn is_leaf(&self, node: &NodeRecord) -> bool {
        self.child_count(node) == 0
    }

    /// Paths of every live node, parents before children.
    pub fn live_paths(&self) -> Vec<String> {
        self.shared.read(|cache| cache.live_paths())
    }

    pub fn state(&self) -> SessionState {
        self.shared.session.state()
    }

    /// Receiver following the session state.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.session.subscribe()
    }

    /// Panics caught in tree listeners so far.
    pub fn listener_failures(&self) -> usize {
        self.shared.hub.failure_count()
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.shared.config
    }

    /// Wait until every event the client delivered before this call has
    /// been applied.
    pub async fn sync(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.control
            .send(Control::Sync(done))
            .map_err(|_| MirrorError::Closed)?;
        wait.await.map_err(|_| MirrorError::Closed)
    }

    /// Re-list the subtree at `path` now instead of waiting for a watch.
    pub async fn refresh(&self, path: &str) -> Result<PopulateReport> {
        path::validate(path)?;
        self.shared.session.ensure_usable()?;
        let (done, wait) = oneshot::channel();
        self.control
            .send(Control::Refresh(path.to_string(), done))
            .map_err(|_| MirrorError::Closed)?;
        let report = wait.await.map_err(|_| MirrorError::Closed)??;
        Ok(report)
    }

    /// Close the session, clear the cache and drop every listener.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.close() {
            return Err(MirrorError::Closed);
        }
        let _ = self.control.send(Control::Shutdown);
        let handle = self
            .router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Router task failed: {}", e);
            }
        }

        let result = match self.shared.client.close().await {
            Ok(()) | Err(ClientError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        };
        info!("Mirror closed");
        result
    }
}

impl Drop for TreeMirror {
    fn drop(&mut self) {
        if !self.shared.close() {
            return;
        }
        debug!("Mirror dropped without close");
        let _ = self.control.send(Control::Shutdown);
        // Outside a runtime the session is left to the service's timeout.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let client = Arc::clone(&self.shared.client);
            runtime.spawn(async move {
                if let Err(e) = client.close().await {
                    debug!("Closing dropped session: {}", e);
                }
            });
        }
    }
}
