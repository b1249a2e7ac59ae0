//! Recursive population of subtrees.
//!
//! `populate` walks a subtree breadth-first from a work queue. For each path
//! it lists the children (leaving a child watch), refreshes the parent stat,
//! tombstones children that disappeared from the listing, then fetches every
//! child that is not live yet (leaving a data watch) and queues it in turn.
//! Live children are left alone, which makes repeated population of an
//! unchanged subtree silent.

use crate::cache::Presence;
use crate::client::ClientError;
use crate::events::TreeEvent;
use crate::mirror::Shared;
use crate::path;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// Outcome of one population run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulateReport {
    /// Paths whose children were listed.
    pub listed: usize,
    /// Paths made live (new or revived), in the order they were applied.
    pub created: Vec<String>,
    /// Paths tombstoned because they vanished from a listing.
    pub removed: Vec<String>,
    /// Paths that could not be fetched or listed, with the reason.
    pub failures: Vec<(String, String)>,
    /// Paths whose listing should be retried once the session recovers:
    /// nested paths that could not be listed and parents of children that
    /// could not be fetched.
    pub retry: Vec<String>,
}

impl PopulateReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn retry_listing(&mut self, path: &str) {
        if !self.retry.iter().any(|p| p == path) {
            self.retry.push(path.to_string());
        }
    }
}

/// Populate the subtree at `path`.
///
/// Failure to list `path` itself is returned; failures below it are recorded
/// in the report and published as `PopulateFailed`.
pub(crate) async fn populate(shared: &Shared, path: &str) -> Result<PopulateReport, ClientError> {
    let mut report = PopulateReport::default();
    let mut queue = VecDeque::from([path.to_string()]);

    while let Some(current) = queue.pop_front() {
        match populate_one(shared, &current, &mut queue, &mut report).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Stopped populating {}: mirror closed", path);
                break;
            }
            Err(e) if current == path => return Err(e),
            Err(ClientError::NoNode(_)) => {
                // Deleted while queued; its NodeDeleted event follows.
                debug!("{} vanished before it could be listed", current);
            }
            Err(e) => {
                fail(shared, &mut report, &current, &e);
                report.retry_listing(&current);
            }
        }
    }

    debug!(
        "Populated {}: {} listed, {} created, {} removed, {} failed",
        path,
        report.listed,
        report.created.len(),
        report.removed.len(),
        report.failures.len()
    );
    Ok(report)
}

/// List and reconcile one path. Returns `Ok(false)` once the mirror is closed.
async fn populate_one(
    shared: &Shared,
    current: &str,
    queue: &mut VecDeque<String>,
    report: &mut PopulateReport,
) -> Result<bool, ClientError> {
    let names = shared.client.get_children(current, true).await?;
    report.listed += 1;

    let parent_stat = match shared.client.exists(current).await {
        Ok(stat) => stat,
        Err(e) => {
            debug!("Could not refresh stat of {}: {}", current, e);
            None
        }
    };

    let listed: HashSet<&str> = names.iter().map(String::as_str).collect();
    let reconciled = shared.apply(|cache, out| {
        if !cache.is_live(current) {
            return None;
        }
        if let Some(stat) = parent_stat {
            cache.refresh_stat(current, stat, out);
        }
        let mut removed = Vec::new();
        for child in cache.children_of(current) {
            if !listed.contains(child.name()) && cache.tombstone(child.path(), out) {
                removed.push(child.path().to_string());
            }
        }
        let missing: Vec<String> = names
            .iter()
            .map(|name| path::full_path(current, name))
            .filter(|child| cache.presence(child) != Presence::Live)
            .collect();
        Some((removed, missing))
    });

    let (removed, missing) = match reconciled {
        None => return Ok(false),
        Some(None) => {
            debug!("{} is no longer live, skipping its children", current);
            return Ok(true);
        }
        Some(Some(result)) => result,
    };
    for path in &removed {
        debug!("{} disappeared from the listing of {}", path, current);
    }
    report.removed.extend(removed);

    for child in missing {
        let (data, stat) = match shared.client.get_data(&child, true).await {
            Ok(reply) => reply,
            Err(ClientError::NoNode(_)) => {
                debug!("{} was deleted before it could be fetched", child);
                continue;
            }
            Err(e) => {
                fail(shared, report, &child, &e);
                report.retry_listing(current);
                continue;
            }
        };

        let inserted = shared.apply(|cache, out| cache.insert_live(&child, data.as_deref(), stat, out));
        match inserted {
            None => return Ok(false),
            Some(Ok(true)) => {
                report.created.push(child.clone());
                queue.push_back(child);
            }
            Some(Ok(false)) => debug!("{} already live", child),
            Some(Err(e)) => debug!("Not inserting {}: {}", child, e),
        }
    }
    Ok(true)
}

fn fail(shared: &Shared, report: &mut PopulateReport, path: &str, error: &ClientError) {
    warn!("Failed to populate {}: {}", path, error);
    report.failures.push((path.to_string(), error.to_string()));
    shared.publish(TreeEvent::PopulateFailed {
        path: path.to_string(),
        error: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connector;
    use crate::config::MirrorConfig;
    use crate::memory::InMemoryEnsemble;
    use crate::session::{SessionController, SessionState};
    use std::time::Duration;

    async fn seeded_shared(ensemble: &InMemoryEnsemble) -> Shared {
        let (client, _events) = ensemble
            .connect("memory", Duration::from_secs(3))
            .await
            .unwrap();
        let session = SessionController::new();
        session.transition(SessionState::Connected);
        let shared = Shared::new(client, session, MirrorConfig::default());
        let (data, stat) = shared.client.get_data(path::ROOT, true).await.unwrap();
        shared.apply(|cache, out| cache.upsert_root(data.as_deref(), stat, out));
        shared
    }

    fn sample() -> InMemoryEnsemble {
        let ensemble = InMemoryEnsemble::new();
        ensemble.seed("/a/b", b"ab").unwrap();
        ensemble.seed("/c", b"c").unwrap();
        ensemble
    }

    #[tokio::test]
    async fn test_populate_walks_breadth_first() {
        let ensemble = sample();
        let shared = seeded_shared(&ensemble).await;

        let report = populate(&shared, path::ROOT).await.unwrap();
        assert_eq!(report.created, vec!["/a", "/c", "/a/b"]);
        assert_eq!(report.listed, 4);
        assert!(report.is_clean());

        let data = shared.read(|cache| cache.get("/a/b").and_then(|n| n.data()));
        assert_eq!(data, Some(b"ab".to_vec()));
        let names: Vec<String> = shared.read(|cache| {
            cache
                .children_of(path::ROOT)
                .iter()
                .map(|n| n.name().to_string())
                .collect()
        });
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_repopulating_unchanged_tree_is_silent() {
        let ensemble = sample();
        let shared = seeded_shared(&ensemble).await;
        populate(&shared, path::ROOT).await.unwrap();

        let report = populate(&shared, path::ROOT).await.unwrap();
        assert!(report.created.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(report.listed, 1);
    }

    #[tokio::test]
    async fn test_vanished_children_are_tombstoned() {
        let ensemble = sample();
        let shared = seeded_shared(&ensemble).await;
        populate(&shared, path::ROOT).await.unwrap();

        let (writer, _events) = ensemble
            .connect("memory", Duration::from_secs(3))
            .await
            .unwrap();
        writer.delete("/c", None).await.unwrap();

        let report = populate(&shared, path::ROOT).await.unwrap();
        assert_eq!(report.removed, vec!["/c"]);
        let record = shared.read(|cache| cache.get("/c")).unwrap();
        assert!(!record.exists());
        assert_eq!(shared.read(|cache| cache.children_of(path::ROOT).len()), 1);
    }

    #[tokio::test]
    async fn test_child_failure_does_not_abort_siblings() {
        let ensemble = sample();
        let shared = seeded_shared(&ensemble).await;
        ensemble.fail_reads("/a", ClientError::Other("boom".into()));

        let report = populate(&shared, path::ROOT).await.unwrap();
        assert_eq!(report.created, vec!["/c"]);
        assert_eq!(
            report.failures,
            vec![("/a".to_string(), "Client error: boom".to_string())]
        );
        assert!(!shared.read(|cache| cache.is_live("/a")));
        assert_eq!(report.retry, vec!["/"]);
    }

    #[tokio::test]
    async fn test_nested_listing_failure_is_marked_for_retry() {
        let ensemble = sample();
        let shared = seeded_shared(&ensemble).await;
        ensemble.fail_next_listing("/a", ClientError::ConnectionLoss);

        let report = populate(&shared, path::ROOT).await.unwrap();
        assert_eq!(report.created, vec!["/a", "/c"]);
        assert_eq!(report.retry, vec!["/a"]);
        assert!(!shared.read(|cache| cache.is_live("/a/b")));

        let report = populate(&shared, "/a").await.unwrap();
        assert_eq!(report.created, vec!["/a/b"]);
        assert!(report.retry.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_of_target_is_returned() {
        let ensemble = sample();
        let shared = seeded_shared(&ensemble).await;
        ensemble.fail_reads(path::ROOT, ClientError::ConnectionLoss);

        let err = populate(&shared, path::ROOT).await.unwrap_err();
        assert_eq!(err, ClientError::ConnectionLoss);
    }
}
