//! Watch event router.
//!
//! A single task drains the client's notification stream in order and turns
//! each event into cache work. Every handler re-registers the watch that fired
//! through the same fetch that reads the new state. Handlers that cannot
//! re-arm remember the path and retry on the next `Connected`.
//!
//! The router also serves control requests from the mirror handle: the
//! `sync` barrier, explicit refreshes and shutdown.

use crate::client::{ClientError, EventReceiver, WatchedEvent};
use crate::events::TreeEvent;
use crate::mirror::Shared;
use crate::path;
use crate::populate::{populate, PopulateReport};
use crate::session::{SessionAction, SessionState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Requests from the mirror handle to the router task.
pub(crate) enum Control {
    /// Reply once every event queued before this request has been routed.
    Sync(oneshot::Sender<()>),
    /// Populate a subtree now and reply with the report.
    Refresh(String, oneshot::Sender<Result<PopulateReport, ClientError>>),
    Shutdown,
}

/// A watch that still has to be re-registered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Rearm {
    Data(String),
    Children(String),
}

impl Rearm {
    fn path(&self) -> &str {
        match self {
            Rearm::Data(p) | Rearm::Children(p) => p,
        }
    }
}

pub(crate) struct Router {
    shared: Arc<Shared>,
    events: EventReceiver,
    control: mpsc::UnboundedReceiver<Control>,
    pending: BTreeSet<Rearm>,
}

impl Router {
    pub fn new(
        shared: Arc<Shared>,
        events: EventReceiver,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        Self {
            shared,
            events,
            control,
            pending: BTreeSet::new(),
        }
    }

    pub async fn run(mut self) {
        debug!("Router started");
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.route(event).await,
                    None => {
                        info!("Client event stream ended");
                        break;
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Sync(done)) => {
                        self.drain().await;
                        let _ = done.send(());
                    }
                    Some(Control::Refresh(path, done)) => {
                        self.drain().await;
                        let result = populate(&self.shared, &path).await;
                        if let Ok(report) = &result {
                            self.retry_later(report);
                        }
                        let _ = done.send(result);
                    }
                    Some(Control::Shutdown) | None => break,
                },
            }
            if !self.shared.session.is_alive() {
                break;
            }
        }
        // Answer barriers still waiting so callers don't hang.
        self.control.close();
        while let Ok(control) = self.control.try_recv() {
            if let Control::Sync(done) = control {
                let _ = done.send(());
            }
        }
        debug!("Router stopped");
    }

    /// Route every event that is already queued.
    async fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.route(event).await;
        }
    }

    async fn route(&mut self, event: WatchedEvent) {
        if !self.shared.session.is_alive() {
            return;
        }
        match event {
            WatchedEvent::Session(state) => self.on_session(state).await,
            WatchedEvent::NodeCreated(path) => debug!("Node created: {}", path),
            WatchedEvent::NodeChildrenChanged(path) => self.on_children_changed(&path).await,
            WatchedEvent::NodeDeleted(path) => self.on_deleted(&path),
            WatchedEvent::NodeDataChanged(path) => self.on_data_changed(&path).await,
        }
    }

    async fn on_session(&mut self, state: SessionState) {
        let Some((previous, action)) = self.shared.session.transition(state) else {
            return;
        };
        if previous != state {
            self.shared.publish(TreeEvent::SessionStateChanged { state });
        }
        match action {
            SessionAction::None => {}
            SessionAction::Invalidate => {
                self.pending.clear();
                self.shared.apply(|cache, out| cache.invalidate(out));
            }
            SessionAction::Resume => self.resume().await,
        }
    }

    /// Rebuild from the root if it isn't live, otherwise retry failed re-arms.
    async fn resume(&mut self) {
        let root_live = self.shared.read(|cache| cache.is_live(path::ROOT));
        if root_live {
            let pending = std::mem::take(&mut self.pending);
            if !pending.is_empty() {
                info!("Retrying {} watch registrations", pending.len());
            }
            for rearm in pending {
                match rearm {
                    Rearm::Data(path) => self.on_data_changed(&path).await,
                    Rearm::Children(path) => self.on_children_changed(&path).await,
                }
            }
            return;
        }

        let (data, stat) = match self.shared.client.get_data(path::ROOT, true).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Could not read the root: {}", e);
                self.shared.publish(TreeEvent::WatchRearmFailed {
                    path: path::ROOT.to_string(),
                    error: e.to_string(),
                });
                return;
            }
        };
        self.shared
            .apply(|cache, out| cache.upsert_root(data.as_deref(), stat, out));
        self.pending.clear();
        self.on_children_changed(path::ROOT).await;
    }

    async fn on_children_changed(&mut self, path: &str) {
        if !self.shared.read(|cache| cache.is_live(path)) {
            debug!("Ignoring child change of untracked {}", path);
            return;
        }
        match populate(&self.shared, path).await {
            Ok(report) => {
                if !report.is_clean() {
                    warn!("{} children of {} failed to load", report.failures.len(), path);
                }
                self.retry_later(&report);
            }
            Err(ClientError::NoNode(_)) => self.on_deleted(path),
            Err(e) => self.rearm_failed(Rearm::Children(path.to_string()), e),
        }
    }

    /// Queue listings a population run could not finish for the next resume.
    fn retry_later(&mut self, report: &PopulateReport) {
        for path in &report.retry {
            debug!("Will list {} again on reconnect", path);
            self.pending.insert(Rearm::Children(path.clone()));
        }
    }

    fn on_deleted(&mut self, path: &str) {
        let removed = self.shared.apply(|cache, out| cache.tombstone(path, out));
        if removed == Some(false) {
            debug!("Duplicate delete of {}", path);
        }
        self.pending
            .retain(|r| r.path() != path && !path::is_ancestor(path, r.path()));
    }

    async fn on_data_changed(&mut self, path: &str) {
        if !self.shared.read(|cache| cache.is_live(path)) {
            debug!("Ignoring data change of untracked {}", path);
            return;
        }
        match self.shared.client.get_data(path, true).await {
            Ok((data, stat)) => {
                self.shared
                    .apply(|cache, out| cache.update_content(path, data.as_deref(), stat, out));
            }
            Err(ClientError::NoNode(_)) => self.on_deleted(path),
            Err(e) => self.rearm_failed(Rearm::Data(path.to_string()), e),
        }
    }

    fn rearm_failed(&mut self, rearm: Rearm, error: ClientError) {
        warn!("Could not re-register watch on {}: {}", rearm.path(), error);
        self.shared.publish(TreeEvent::WatchRearmFailed {
            path: rearm.path().to_string(),
            error: error.to_string(),
        });
        self.pending.insert(rearm);
    }
}
