//! Commit history ingestion.
//!
//! Commits, authors and per-file revisions live in their own part of the
//! graph. They only reference source files by path (the store links
//! `VersionOf` edges itself), and never create or modify code nodes.

mod git;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::error::{Result, SyncError};
use crate::graph::{
    Author, Commit, EdgeKind, FileRevision, GraphEdge, GraphNode, GraphStore, NodeKey, WriteBatch,
    WriteOp,
};
use crate::pipeline::{apply_with_retry, commit_with_retry};

pub use git::{CommitRecord, FileChange, GitCli, VcsSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySyncMode {
    /// Append commits since the checkpoint; fails on divergence
    Incremental,
    /// Re-ingest everything reachable from head and drop the rest
    Full,
}

/// Outcome of one history sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryReport {
    pub run_id: String,
    pub repo_id: String,
    pub full: bool,
    pub head: Option<String>,
    pub checkpoint_before: Option<String>,
    pub checkpoint_after: Option<String>,
    /// Commits listed by the VCS for this run
    pub commits_seen: usize,
    pub commits_written: usize,
    /// Listed commits that were already in the graph
    pub commits_skipped: usize,
    pub revisions_written: usize,
    /// Nodes dropped by a full reconciliation
    pub nodes_removed: usize,
    pub duration_ms: u64,
}

/// Order commits parents-first, keeping input order among ready commits.
///
/// Only parents inside `records` constrain the order. Commits caught in a
/// cycle (impossible in a real history) are appended in input order.
pub fn topological_order(records: Vec<CommitRecord>) -> Vec<CommitRecord> {
    let index: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.revision.clone(), i))
        .collect();

    let mut pending = vec![0usize; records.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    for (i, record) in records.iter().enumerate() {
        let parents: HashSet<&String> = record.parents.iter().collect();
        for parent in parents {
            if let Some(&p) = index.get(parent) {
                pending[i] += 1;
                children[p].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..records.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(records.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &child in &children[i] {
            pending[child] -= 1;
            if pending[child] == 0 {
                ready.push_back(child);
            }
        }
    }
    if order.len() < records.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        order.extend((0..records.len()).filter(|i| !placed.contains(i)));
    }

    let mut slots: Vec<Option<CommitRecord>> = records.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

/// Keeps one repository's commit history in the graph.
pub struct HistorySynchronizer {
    store: Arc<dyn GraphStore>,
    checkpoints: Arc<CheckpointStore>,
    vcs: Arc<dyn VcsSource>,
    repo_id: String,
}

impl HistorySynchronizer {
    pub fn new(
        store: Arc<dyn GraphStore>,
        checkpoints: Arc<CheckpointStore>,
        vcs: Arc<dyn VcsSource>,
        repo_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            checkpoints,
            vcs,
            repo_id: repo_id.into(),
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey::Revision(self.repo_id.clone())
    }

    pub async fn checkpoint(&self) -> Option<String> {
        self.checkpoints.get(&self.checkpoint_key()).await
    }

    pub async fn sync(&self, mode: HistorySyncMode) -> Result<HistoryReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync_history", run_id = %run_id, full = (mode == HistorySyncMode::Full));
        async move {
            let started = Instant::now();
            let mut report = HistoryReport {
                run_id,
                repo_id: self.repo_id.clone(),
                full: mode == HistorySyncMode::Full,
                checkpoint_before: self.checkpoint().await,
                ..Default::default()
            };
            match mode {
                HistorySyncMode::Incremental => self.incremental(&mut report).await?,
                HistorySyncMode::Full => self.full(&mut report).await?,
            }
            report.duration_ms = started.elapsed().as_millis() as u64;
            info!(
                "History sync done: {} seen, {} written, {} skipped",
                report.commits_seen, report.commits_written, report.commits_skipped
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn incremental(&self, report: &mut HistoryReport) -> Result<()> {
        let Some(head) = self.vcs.head().await.map_err(SyncError::Vcs)? else {
            info!("Repository has no commits yet");
            report.checkpoint_after = report.checkpoint_before.clone();
            return Ok(());
        };
        report.head = Some(head.clone());

        let since = report.checkpoint_before.clone();
        if since.as_deref() == Some(head.as_str()) {
            report.checkpoint_after = since;
            return Ok(());
        }
        if let Some(checkpoint) = &since {
            let known = self
                .vcs
                .contains_revision(checkpoint)
                .await
                .map_err(SyncError::Vcs)?;
            let ancestor = known
                && self
                    .vcs
                    .is_ancestor(checkpoint, &head)
                    .await
                    .map_err(SyncError::Vcs)?;
            if !ancestor {
                warn!("History checkpoint {} is not an ancestor of {}", checkpoint, head);
                return Err(SyncError::HistoryDivergence {
                    checkpoint: checkpoint.clone(),
                    head,
                });
            }
        }

        let records = self
            .vcs
            .commits_since(since.as_deref(), &head)
            .await
            .map_err(SyncError::Vcs)?;
        self.write_commits(records, report).await?;
        commit_with_retry(self.store.as_ref()).await?;

        self.checkpoints
            .set(self.checkpoint_key(), Some(head.clone()))
            .await?;
        report.checkpoint_after = Some(head);
        Ok(())
    }

    async fn full(&self, report: &mut HistoryReport) -> Result<()> {
        let head = self.vcs.head().await.map_err(SyncError::Vcs)?;
        report.head = head.clone();

        let records = match &head {
            Some(head) => self
                .vcs
                .commits_since(None, head)
                .await
                .map_err(SyncError::Vcs)?,
            None => Vec::new(),
        };
        let reachable: HashSet<String> = records.iter().map(|r| r.revision.clone()).collect();
        self.write_commits(records, report).await?;

        let summary = apply_with_retry(
            self.store.as_ref(),
            WriteBatch::from(vec![WriteOp::RetainHistory {
                repo_id: self.repo_id.clone(),
                revisions: reachable,
            }]),
        )
        .await?;
        report.nodes_removed = summary.nodes_removed;
        if summary.nodes_removed > 0 {
            info!("Removed {} unreachable history nodes", summary.nodes_removed);
        }
        commit_with_retry(self.store.as_ref()).await?;

        self.checkpoints
            .set(self.checkpoint_key(), head.clone())
            .await?;
        report.checkpoint_after = head;
        Ok(())
    }

    /// Write commits parents-first, one batch per commit. Commits already in
    /// the graph are left untouched.
    async fn write_commits(
        &self,
        records: Vec<CommitRecord>,
        report: &mut HistoryReport,
    ) -> Result<()> {
        report.commits_seen = records.len();
        for record in topological_order(records) {
            let key = NodeKey::commit(&self.repo_id, &record.revision);
            if self.store.contains(&key).await? {
                report.commits_skipped += 1;
                continue;
            }
            let batch = self.commit_batch(&record).await?;
            apply_with_retry(self.store.as_ref(), batch).await?;
            debug!("Recorded commit {}", record.revision);
            report.commits_written += 1;
            report.revisions_written += record.changes.len();
        }
        Ok(())
    }

    async fn commit_batch(&self, record: &CommitRecord) -> Result<WriteBatch> {
        let repo = self.repo_id.as_str();
        let commit_key = NodeKey::commit(repo, &record.revision);
        let author_key = NodeKey::author(repo, &record.author_email);

        let mut batch = WriteBatch::new();
        batch
            .upsert(GraphNode::Author(Author {
                repo_id: repo.to_string(),
                email: record.author_email.clone(),
                name: record.author_name.clone(),
            }))
            .upsert(GraphNode::Commit(Commit {
                repo_id: repo.to_string(),
                revision: record.revision.clone(),
                parents: record.parents.clone(),
                author_email: record.author_email.clone(),
                authored_at: record.authored_at,
                committed_at: record.committed_at,
                subject: record.subject.clone(),
                body: record.body.clone(),
            }))
            .edge(GraphEdge::new(
                EdgeKind::AuthoredBy,
                commit_key.clone(),
                author_key,
            ));

        for parent in &record.parents {
            let parent_key = NodeKey::commit(repo, parent);
            // parents outside a shallow history are not in the graph
            if self.store.contains(&parent_key).await? {
                batch.edge(GraphEdge::new(EdgeKind::Parent, commit_key.clone(), parent_key));
            }
        }

        for change in &record.changes {
            batch
                .upsert(GraphNode::FileRevision(FileRevision {
                    repo_id: repo.to_string(),
                    revision: record.revision.clone(),
                    path: change.path.clone(),
                    change: change.change,
                    previous_path: change.previous_path.clone(),
                    additions: change.additions,
                    deletions: change.deletions,
                }))
                .edge(GraphEdge::new(
                    EdgeKind::Touches,
                    commit_key.clone(),
                    NodeKey::revision(repo, &record.revision, &change.path),
                ));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ChangeKind, Direction, LocalGraphStore};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn record(revision: &str, parents: &[&str], minute: u32) -> CommitRecord {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap();
        CommitRecord {
            revision: revision.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            author_name: "Dev".to_string(),
            author_email: "dev@example.com".to_string(),
            authored_at: at,
            committed_at: at,
            subject: format!("commit {}", revision),
            body: String::new(),
            changes: vec![FileChange {
                path: "a.py".to_string(),
                previous_path: None,
                change: ChangeKind::Modified,
                additions: 1,
                deletions: 0,
            }],
        }
    }

    /// In-memory history whose head can be moved or rewritten.
    struct ScriptedVcs {
        commits: Mutex<Vec<CommitRecord>>,
    }

    impl ScriptedVcs {
        fn new(commits: Vec<CommitRecord>) -> Self {
            Self {
                commits: Mutex::new(commits),
            }
        }

        fn ancestors(&self, revision: &str) -> HashSet<String> {
            let commits = self.commits.lock().unwrap();
            let mut seen = HashSet::new();
            let mut stack = vec![revision.to_string()];
            while let Some(rev) = stack.pop() {
                if !seen.insert(rev.clone()) {
                    continue;
                }
                if let Some(c) = commits.iter().find(|c| c.revision == rev) {
                    stack.extend(c.parents.iter().cloned());
                }
            }
            seen
        }
    }

    #[async_trait]
    impl VcsSource for ScriptedVcs {
        async fn head(&self) -> anyhow::Result<Option<String>> {
            Ok(self.commits.lock().unwrap().last().map(|c| c.revision.clone()))
        }

        async fn contains_revision(&self, revision: &str) -> anyhow::Result<bool> {
            Ok(self
                .commits
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.revision == revision))
        }

        async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> anyhow::Result<bool> {
            Ok(self.ancestors(descendant).contains(ancestor))
        }

        async fn commits_since(
            &self,
            since: Option<&str>,
            head: &str,
        ) -> anyhow::Result<Vec<CommitRecord>> {
            let reachable = self.ancestors(head);
            let excluded = since.map(|s| self.ancestors(s)).unwrap_or_default();
            Ok(self
                .commits
                .lock()
                .unwrap()
                .iter()
                .filter(|c| reachable.contains(&c.revision) && !excluded.contains(&c.revision))
                .cloned()
                .collect())
        }
    }

    fn synchronizer(vcs: Arc<ScriptedVcs>) -> (HistorySynchronizer, Arc<LocalGraphStore>) {
        let store = Arc::new(LocalGraphStore::in_memory());
        let sync = HistorySynchronizer::new(
            store.clone(),
            Arc::new(CheckpointStore::in_memory()),
            vcs,
            "repo",
        );
        (sync, store)
    }

    #[test]
    fn test_topological_order() {
        // merge commit listed before one of its parents
        let records = vec![
            record("c1", &[], 0),
            record("m", &["c2", "c3"], 3),
            record("c3", &["c1"], 2),
            record("c2", &["c1"], 1),
        ];
        let order: Vec<String> = topological_order(records)
            .into_iter()
            .map(|r| r.revision)
            .collect();
        assert_eq!(order, vec!["c1", "c3", "c2", "m"]);
    }

    #[tokio::test]
    async fn test_incremental_appends_unseen_commits() {
        let vcs = Arc::new(ScriptedVcs::new(vec![record("c1", &[], 0)]));
        let (sync, store) = synchronizer(vcs.clone());

        let first = sync.sync(HistorySyncMode::Incremental).await.unwrap();
        assert_eq!(first.commits_written, 1);
        assert_eq!(first.checkpoint_after.as_deref(), Some("c1"));

        vcs.commits.lock().unwrap().extend([
            record("c2", &["c1"], 1),
            record("c3", &["c2"], 2),
        ]);
        let second = sync.sync(HistorySyncMode::Incremental).await.unwrap();
        assert_eq!(second.commits_seen, 2);
        assert_eq!(second.commits_written, 2);
        assert_eq!(second.checkpoint_after.as_deref(), Some("c3"));

        let parents = store
            .neighbors(&NodeKey::commit("repo", "c3"), EdgeKind::Parent, Direction::Outgoing)
            .await
            .unwrap();
        assert_eq!(parents, vec![NodeKey::commit("repo", "c2")]);

        let third = sync.sync(HistorySyncMode::Incremental).await.unwrap();
        assert_eq!(third.commits_seen, 0);
        assert_eq!(third.commits_written, 0);
    }

    #[tokio::test]
    async fn test_rewrite_is_divergence_until_full_sync() {
        let vcs = Arc::new(ScriptedVcs::new(vec![
            record("c1", &[], 0),
            record("c2", &["c1"], 1),
        ]));
        let (sync, store) = synchronizer(vcs.clone());
        sync.sync(HistorySyncMode::Incremental).await.unwrap();

        // amend c2 into c2b
        {
            let mut commits = vcs.commits.lock().unwrap();
            commits.pop();
            commits.push(record("c2b", &["c1"], 5));
        }
        let err = sync.sync(HistorySyncMode::Incremental).await.unwrap_err();
        assert!(matches!(err, SyncError::HistoryDivergence { .. }));
        assert_eq!(sync.checkpoint().await.as_deref(), Some("c2"));

        let report = sync.sync(HistorySyncMode::Full).await.unwrap();
        assert_eq!(report.commits_written, 1);
        assert_eq!(report.commits_skipped, 1);
        assert!(report.nodes_removed >= 2);
        assert_eq!(report.checkpoint_after.as_deref(), Some("c2b"));
        assert!(!store.contains(&NodeKey::commit("repo", "c2")).await.unwrap());
        assert!(store.contains(&NodeKey::commit("repo", "c2b")).await.unwrap());
        assert!(store.contains(&NodeKey::author("repo", "dev@example.com")).await.unwrap());
    }
}
