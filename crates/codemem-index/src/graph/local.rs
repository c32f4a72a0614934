//! In-process graph store persisted as a JSON snapshot.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::store::{
    ChunkMatch, Direction, GraphStats, GraphStore, HistoryEntry, StoreError, WriteBatch, WriteOp,
    WriteSummary,
};
use super::{
    Author, CodeUnit, Commit, EdgeKind, FileRevision, GraphEdge, GraphNode, NodeKey,
    SemanticChunk, SourceFile,
};

/// Snapshot file name inside the data directory.
pub const GRAPH_FILE: &str = "graph.json";

const SNAPSHOT_VERSION: u32 = 2;

type Adjacency = HashMap<NodeKey, BTreeSet<(EdgeKind, NodeKey)>>;
type CommitId = (String, String);
type RevisionId = (String, String, String);

#[derive(Debug, Clone)]
struct StoredChunk {
    chunk: SemanticChunk,
    sequence: u64,
}

/// Nodes, typed adjacency lists and lookup indexes.
#[derive(Debug, Default)]
struct KnowledgeGraph {
    files: HashMap<String, SourceFile>,
    units: HashMap<String, CodeUnit>,
    chunks: HashMap<String, StoredChunk>,
    commits: HashMap<CommitId, Commit>,
    authors: HashMap<CommitId, Author>,
    revisions: HashMap<RevisionId, FileRevision>,

    outgoing: Adjacency,
    incoming: Adjacency,
    edge_count: usize,

    units_by_file: HashMap<String, BTreeSet<String>>,
    units_by_name: HashMap<String, BTreeSet<String>>,
    revisions_by_path: HashMap<String, BTreeSet<NodeKey>>,
    next_sequence: u64,
}

fn commit_id(repo_id: &str, revision: &str) -> CommitId {
    (repo_id.to_string(), revision.to_string())
}

fn revision_id(repo_id: &str, revision: &str, path: &str) -> RevisionId {
    (repo_id.to_string(), revision.to_string(), path.to_string())
}

impl KnowledgeGraph {
    fn contains(&self, key: &NodeKey) -> bool {
        match key {
            NodeKey::File(path) => self.files.contains_key(path),
            NodeKey::Unit(id) => self.units.contains_key(id),
            NodeKey::Chunk(id) => self.chunks.contains_key(id),
            NodeKey::Commit { repo_id, revision } => {
                self.commits.contains_key(&commit_id(repo_id, revision))
            }
            NodeKey::Author { repo_id, email } => {
                self.authors.contains_key(&commit_id(repo_id, email))
            }
            NodeKey::Revision {
                repo_id,
                revision,
                path,
            } => self
                .revisions
                .contains_key(&revision_id(repo_id, revision, path)),
        }
    }

    fn get(&self, key: &NodeKey) -> Option<GraphNode> {
        match key {
            NodeKey::File(path) => self.files.get(path).cloned().map(GraphNode::SourceFile),
            NodeKey::Unit(id) => self.units.get(id).cloned().map(GraphNode::CodeUnit),
            NodeKey::Chunk(id) => self
                .chunks
                .get(id)
                .map(|stored| GraphNode::SemanticChunk(stored.chunk.clone())),
            NodeKey::Commit { repo_id, revision } => self
                .commits
                .get(&commit_id(repo_id, revision))
                .cloned()
                .map(GraphNode::Commit),
            NodeKey::Author { repo_id, email } => self
                .authors
                .get(&commit_id(repo_id, email))
                .cloned()
                .map(GraphNode::Author),
            NodeKey::Revision {
                repo_id,
                revision,
                path,
            } => self
                .revisions
                .get(&revision_id(repo_id, revision, path))
                .cloned()
                .map(GraphNode::FileRevision),
        }
    }

    fn edges(&self, key: &NodeKey, kind: EdgeKind, direction: Direction) -> Vec<NodeKey> {
        let adjacency = match direction {
            Direction::Outgoing => &self.outgoing,
            Direction::Incoming => &self.incoming,
        };
        adjacency
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, other)| other.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert_edge(&mut self, kind: EdgeKind, source: NodeKey, target: NodeKey) -> bool {
        let inserted = self
            .outgoing
            .entry(source.clone())
            .or_default()
            .insert((kind, target.clone()));
        if inserted {
            self.incoming
                .entry(target)
                .or_default()
                .insert((kind, source));
            self.edge_count += 1;
        }
        inserted
    }

    fn remove_edge(&mut self, kind: EdgeKind, source: &NodeKey, target: &NodeKey) -> bool {
        let removed = unlink(&mut self.outgoing, source, &(kind, target.clone()));
        if removed {
            unlink(&mut self.incoming, target, &(kind, source.clone()));
            self.edge_count -= 1;
        }
        removed
    }

    /// Drop every edge touching `key`.
    fn detach(&mut self, key: &NodeKey) -> usize {
        let mut removed = 0;
        if let Some(out) = self.outgoing.remove(key) {
            for (kind, target) in out {
                unlink(&mut self.incoming, &target, &(kind, key.clone()));
                removed += 1;
            }
        }
        if let Some(inc) = self.incoming.remove(key) {
            for (kind, source) in inc {
                unlink(&mut self.outgoing, &source, &(kind, key.clone()));
                removed += 1;
            }
        }
        self.edge_count -= removed;
        removed
    }

    fn upsert(&mut self, node: GraphNode, summary: &mut WriteSummary) {
        match node {
            GraphNode::SourceFile(file) => {
                let key = NodeKey::File(file.path.clone());
                let is_new = !self.files.contains_key(&file.path);
                if self.files.get(&file.path) != Some(&file) {
                    self.files.insert(file.path.clone(), file.clone());
                    summary.nodes_written += 1;
                }
                if is_new {
                    // history recorded before the file was indexed
                    let versions = self
                        .revisions_by_path
                        .get(&file.path)
                        .cloned()
                        .unwrap_or_default();
                    for revision in versions {
                        if self.insert_edge(EdgeKind::VersionOf, revision, key.clone()) {
                            summary.edges_written += 1;
                        }
                    }
                }
            }
            GraphNode::CodeUnit(unit) => {
                if let Some(existing) = self.units.get(&unit.id) {
                    if *existing == unit {
                        return;
                    }
                    let old_name = existing.name.clone();
                    remove_indexed(&mut self.units_by_name, &old_name, &unit.id);
                }
                self.units_by_file
                    .entry(unit.path.clone())
                    .or_default()
                    .insert(unit.id.clone());
                self.units_by_name
                    .entry(unit.name.clone())
                    .or_default()
                    .insert(unit.id.clone());
                let file = NodeKey::File(unit.path.clone());
                let key = NodeKey::Unit(unit.id.clone());
                self.units.insert(unit.id.clone(), unit);
                summary.nodes_written += 1;
                if self.insert_edge(EdgeKind::Contains, file, key) {
                    summary.edges_written += 1;
                }
            }
            GraphNode::SemanticChunk(chunk) => {
                let key = NodeKey::Chunk(chunk.id.clone());
                let unit = NodeKey::Unit(chunk.unit_id.clone());
                match self.chunks.get_mut(&chunk.id) {
                    Some(stored) => {
                        if stored.chunk != chunk {
                            stored.chunk = chunk;
                            summary.nodes_written += 1;
                        }
                    }
                    None => {
                        let sequence = self.next_sequence;
                        self.next_sequence += 1;
                        self.chunks
                            .insert(chunk.id.clone(), StoredChunk { chunk, sequence });
                        summary.nodes_written += 1;
                    }
                }
                if self.insert_edge(EdgeKind::Describes, key, unit) {
                    summary.edges_written += 1;
                }
            }
            GraphNode::Commit(commit) => {
                let id = commit_id(&commit.repo_id, &commit.revision);
                // commits are immutable once recorded
                if !self.commits.contains_key(&id) {
                    self.commits.insert(id, commit);
                    summary.nodes_written += 1;
                }
            }
            GraphNode::Author(author) => {
                let id = commit_id(&author.repo_id, &author.email);
                if self.authors.get(&id) != Some(&author) {
                    self.authors.insert(id, author);
                    summary.nodes_written += 1;
                }
            }
            GraphNode::FileRevision(revision) => {
                let id = revision_id(&revision.repo_id, &revision.revision, &revision.path);
                if self.revisions.contains_key(&id) {
                    return;
                }
                let key = NodeKey::revision(&revision.repo_id, &revision.revision, &revision.path);
                let path = revision.path.clone();
                self.revisions_by_path
                    .entry(path.clone())
                    .or_default()
                    .insert(key.clone());
                self.revisions.insert(id, revision);
                summary.nodes_written += 1;
                if self.files.contains_key(&path)
                    && self.insert_edge(EdgeKind::VersionOf, key, NodeKey::File(path))
                {
                    summary.edges_written += 1;
                }
            }
        }
    }

    fn remove_chunk(&mut self, id: &str, summary: &mut WriteSummary) {
        let key = NodeKey::Chunk(id.to_string());
        summary.edges_removed += self.detach(&key);
        if self.chunks.remove(id).is_some() {
            summary.nodes_removed += 1;
        }
    }

    fn remove_unit(&mut self, id: &str, summary: &mut WriteSummary) {
        let Some(unit) = self.units.get(id).cloned() else {
            return;
        };
        let key = NodeKey::Unit(id.to_string());

        for chunk in self.edges(&key, EdgeKind::Describes, Direction::Incoming) {
            if let NodeKey::Chunk(chunk_id) = chunk {
                self.remove_chunk(&chunk_id, summary);
            }
        }
        for caller in self.edges(&key, EdgeKind::Calls, Direction::Incoming) {
            if let Some(caller) = caller.as_unit().and_then(|c| self.units.get(c)) {
                if caller.path != unit.path {
                    summary.orphaned_callers.insert(caller.path.clone());
                }
            }
        }

        summary.edges_removed += self.detach(&key);
        remove_indexed(&mut self.units_by_file, &unit.path, id);
        remove_indexed(&mut self.units_by_name, &unit.name, id);
        self.units.remove(id);
        summary.nodes_removed += 1;
    }

    fn clear_file_contents(&mut self, path: &str, summary: &mut WriteSummary) {
        let ids: Vec<String> = self
            .units_by_file
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            self.remove_unit(&id, summary);
        }
    }

    fn remove_file(&mut self, path: &str, summary: &mut WriteSummary) {
        self.clear_file_contents(path, summary);
        let key = NodeKey::File(path.to_string());
        summary.edges_removed += self.detach(&key);
        if self.files.remove(path).is_some() {
            summary.nodes_removed += 1;
        }
    }

    /// Make the outgoing `kind` edges of `source` exactly `desired`.
    fn replace_edges(
        &mut self,
        kind: EdgeKind,
        source: &NodeKey,
        desired: BTreeSet<NodeKey>,
        summary: &mut WriteSummary,
    ) {
        let current: BTreeSet<NodeKey> = self
            .edges(source, kind, Direction::Outgoing)
            .into_iter()
            .collect();
        for stale in current.difference(&desired) {
            if self.remove_edge(kind, source, stale) {
                summary.edges_removed += 1;
            }
        }
        for fresh in desired.difference(&current) {
            if self.insert_edge(kind, source.clone(), fresh.clone()) {
                summary.edges_written += 1;
            }
        }
    }

    fn replace_imports(&mut self, path: &str, targets: &[String], summary: &mut WriteSummary) {
        let desired = targets
            .iter()
            .filter(|target| target.as_str() != path)
            .map(|target| NodeKey::File(target.clone()))
            .collect();
        self.replace_edges(
            EdgeKind::Imports,
            &NodeKey::File(path.to_string()),
            desired,
            summary,
        );
    }

    fn replace_file_calls(
        &mut self,
        path: &str,
        calls: &[(String, String)],
        summary: &mut WriteSummary,
    ) {
        let mut by_caller: HashMap<&str, BTreeSet<NodeKey>> = HashMap::new();
        for (caller, callee) in calls {
            if caller != callee {
                by_caller
                    .entry(caller.as_str())
                    .or_default()
                    .insert(NodeKey::Unit(callee.clone()));
            }
        }
        let units: Vec<String> = self
            .units_by_file
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for unit in units {
            let desired = by_caller.remove(unit.as_str()).unwrap_or_default();
            self.replace_edges(EdgeKind::Calls, &NodeKey::Unit(unit), desired, summary);
        }
    }

    fn retain_history(
        &mut self,
        repo_id: &str,
        keep: &HashSet<String>,
        summary: &mut WriteSummary,
    ) {
        let doomed: HashSet<CommitId> = self
            .commits
            .keys()
            .filter(|(repo, revision)| repo == repo_id && !keep.contains(revision))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }

        let stale_revisions: Vec<RevisionId> = self
            .revisions
            .keys()
            .filter(|(repo, revision, _)| doomed.contains(&commit_id(repo, revision)))
            .cloned()
            .collect();
        for id in stale_revisions {
            let (repo, revision, path) = &id;
            let key = NodeKey::revision(repo, revision, path);
            summary.edges_removed += self.detach(&key);
            remove_indexed(&mut self.revisions_by_path, path, &key);
            self.revisions.remove(&id);
            summary.nodes_removed += 1;
        }

        for id in &doomed {
            let key = NodeKey::commit(&id.0, &id.1);
            summary.edges_removed += self.detach(&key);
            self.commits.remove(id);
            summary.nodes_removed += 1;
        }

        let orphaned: Vec<CommitId> = self
            .authors
            .keys()
            .filter(|(repo, email)| {
                repo == repo_id
                    && self
                        .incoming
                        .get(&NodeKey::author(repo, email))
                        .map_or(true, |set| set.is_empty())
            })
            .cloned()
            .collect();
        for id in orphaned {
            self.authors.remove(&id);
            summary.nodes_removed += 1;
        }
    }

    fn apply_op(&mut self, op: WriteOp, summary: &mut WriteSummary) {
        match op {
            WriteOp::UpsertNode(node) => self.upsert(node, summary),
            WriteOp::UpsertEdge(edge) => {
                if self.insert_edge(edge.kind, edge.source, edge.target) {
                    summary.edges_written += 1;
                }
            }
            WriteOp::ClearFileContents { path } => self.clear_file_contents(&path, summary),
            WriteOp::RemoveFile { path } => self.remove_file(&path, summary),
            WriteOp::ReplaceImports { path, targets } => {
                self.replace_imports(&path, &targets, summary)
            }
            WriteOp::ReplaceFileCalls { path, calls } => {
                self.replace_file_calls(&path, &calls, summary)
            }
            WriteOp::RetainHistory { repo_id, revisions } => {
                self.retain_history(&repo_id, &revisions, summary)
            }
        }
    }

    /// Check a whole batch against the graph as it would be after each op.
    fn check(&self, batch: &WriteBatch, dimensions: Option<usize>) -> Result<(), StoreError> {
        let mut overlay = Overlay::new(self);
        for op in batch.ops() {
            overlay.check(op, dimensions)?;
        }
        Ok(())
    }

    fn nearest(&self, vector: &[f32], limit: usize) -> Vec<ChunkMatch> {
        let mut hits: Vec<(f32, &StoredChunk, &CodeUnit)> = self
            .chunks
            .values()
            .filter(|stored| stored.chunk.embedding.len() == vector.len())
            .filter_map(|stored| {
                let unit = self.units.get(&stored.chunk.unit_id)?;
                Some((cosine_similarity(vector, &stored.chunk.embedding), stored, unit))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.sequence.cmp(&b.1.sequence))
        });
        hits.into_iter()
            .take(limit)
            .map(|(score, stored, unit)| ChunkMatch {
                chunk_id: stored.chunk.id.clone(),
                text: stored.chunk.text.clone(),
                score,
                sequence: stored.sequence,
                unit: unit.clone(),
            })
            .collect()
    }

    fn history(&self, path: &str, since: Option<DateTime<Utc>>) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = self
            .revisions_by_path
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|key| {
                let NodeKey::Revision {
                    repo_id,
                    revision,
                    path,
                } = key
                else {
                    return None;
                };
                let file_revision = self.revisions.get(&revision_id(repo_id, revision, path))?;
                let commit = self.commits.get(&commit_id(repo_id, revision))?;
                Some(HistoryEntry {
                    commit: commit.clone(),
                    revision: file_revision.clone(),
                })
            })
            .filter(|entry| since.map_or(true, |since| entry.commit.committed_at >= since))
            .collect();
        entries.sort_by(|a, b| {
            b.commit
                .committed_at
                .cmp(&a.commit.committed_at)
                .then_with(|| a.commit.revision.cmp(&b.commit.revision))
        });
        entries
    }

    fn stats(&self) -> GraphStats {
        GraphStats {
            files: self.files.len(),
            units: self.units.len(),
            chunks: self.chunks.len(),
            commits: self.commits.len(),
            authors: self.authors.len(),
            file_revisions: self.revisions.len(),
            edges: self.edge_count,
            last_file_sync: self.files.values().map(|f| f.synced_at).max(),
        }
    }

    fn to_snapshot(&self) -> GraphSnapshot {
        let mut files: Vec<SourceFile> = self.files.values().cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let mut units: Vec<CodeUnit> = self.units.values().cloned().collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        let mut chunks: Vec<SnapshotChunk> = self
            .chunks
            .values()
            .map(|stored| SnapshotChunk {
                sequence: stored.sequence,
                chunk: stored.chunk.clone(),
            })
            .collect();
        chunks.sort_by_key(|c| c.sequence);
        let mut commits: Vec<Commit> = self.commits.values().cloned().collect();
        commits.sort_by(|a, b| {
            (&a.repo_id, &a.revision).cmp(&(&b.repo_id, &b.revision))
        });
        let mut authors: Vec<Author> = self.authors.values().cloned().collect();
        authors.sort_by(|a, b| (&a.repo_id, &a.email).cmp(&(&b.repo_id, &b.email)));
        let mut revisions: Vec<FileRevision> = self.revisions.values().cloned().collect();
        revisions.sort_by(|a, b| {
            (&a.repo_id, &a.revision, &a.path).cmp(&(&b.repo_id, &b.revision, &b.path))
        });
        let mut edges: Vec<GraphEdge> = self
            .outgoing
            .iter()
            .flat_map(|(source, set)| {
                set.iter()
                    .map(move |(kind, target)| GraphEdge::new(*kind, source.clone(), target.clone()))
            })
            .collect();
        edges.sort();

        GraphSnapshot {
            version: SNAPSHOT_VERSION,
            next_sequence: self.next_sequence,
            files,
            units,
            chunks,
            commits,
            authors,
            revisions,
            edges,
        }
    }

    fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, StoreError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Invalid(format!(
                "unsupported graph snapshot version {}",
                snapshot.version
            )));
        }

        let mut graph = Self::default();
        for file in snapshot.files {
            graph.files.insert(file.path.clone(), file);
        }
        for unit in snapshot.units {
            graph
                .units_by_file
                .entry(unit.path.clone())
                .or_default()
                .insert(unit.id.clone());
            graph
                .units_by_name
                .entry(unit.name.clone())
                .or_default()
                .insert(unit.id.clone());
            graph.units.insert(unit.id.clone(), unit);
        }
        let mut next_sequence = snapshot.next_sequence;
        for stored in snapshot.chunks {
            next_sequence = next_sequence.max(stored.sequence + 1);
            graph.chunks.insert(
                stored.chunk.id.clone(),
                StoredChunk {
                    chunk: stored.chunk,
                    sequence: stored.sequence,
                },
            );
        }
        graph.next_sequence = next_sequence;
        for commit in snapshot.commits {
            graph
                .commits
                .insert(commit_id(&commit.repo_id, &commit.revision), commit);
        }
        for author in snapshot.authors {
            graph
                .authors
                .insert(commit_id(&author.repo_id, &author.email), author);
        }
        for revision in snapshot.revisions {
            graph
                .revisions_by_path
                .entry(revision.path.clone())
                .or_default()
                .insert(NodeKey::revision(
                    &revision.repo_id,
                    &revision.revision,
                    &revision.path,
                ));
            graph.revisions.insert(
                revision_id(&revision.repo_id, &revision.revision, &revision.path),
                revision,
            );
        }
        for edge in snapshot.edges {
            if !graph.contains(&edge.source) || !graph.contains(&edge.target) {
                warn!("Dropping dangling edge {:?} {} -> {}", edge.kind, edge.source, edge.target);
                continue;
            }
            graph.insert_edge(edge.kind, edge.source, edge.target);
        }
        Ok(graph)
    }
}

fn unlink(adjacency: &mut Adjacency, key: &NodeKey, entry: &(EdgeKind, NodeKey)) -> bool {
    let Some(set) = adjacency.get_mut(key) else {
        return false;
    };
    let removed = set.remove(entry);
    if set.is_empty() {
        adjacency.remove(key);
    }
    removed
}

fn remove_indexed<T, Q>(index: &mut HashMap<String, BTreeSet<T>>, key: &str, value: &Q)
where
    T: Ord + Borrow<Q>,
    Q: Ord + ?Sized,
{
    if let Some(set) = index.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// Cosine similarity; 0 for mismatched, empty or zero-length vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut mag_a = 0.0f32;
    let mut mag_b = 0.0f32;
    for (ai, bi) in a.iter().zip(b.iter()) {
        dot += ai * bi;
        mag_a += ai * ai;
        mag_b += bi * bi;
    }
    let mag = (mag_a * mag_b).sqrt();
    if mag == 0.0 {
        0.0
    } else {
        dot / mag
    }
}

/// Existence view of the graph while a batch is being checked.
struct Overlay<'g> {
    graph: &'g KnowledgeGraph,
    added: HashSet<NodeKey>,
    removed: HashSet<NodeKey>,
    /// unit id -> owning path for units added by the batch
    unit_paths: HashMap<String, String>,
}

impl<'g> Overlay<'g> {
    fn new(graph: &'g KnowledgeGraph) -> Self {
        Self {
            graph,
            added: HashSet::new(),
            removed: HashSet::new(),
            unit_paths: HashMap::new(),
        }
    }

    fn exists(&self, key: &NodeKey) -> bool {
        self.added.contains(key) || (!self.removed.contains(key) && self.graph.contains(key))
    }

    fn add(&mut self, key: NodeKey) {
        self.removed.remove(&key);
        self.added.insert(key);
    }

    fn remove(&mut self, key: NodeKey) {
        self.added.remove(&key);
        self.removed.insert(key);
    }

    fn unit_path(&self, id: &str) -> Option<&str> {
        if !self.exists(&NodeKey::Unit(id.to_string())) {
            return None;
        }
        self.unit_paths
            .get(id)
            .map(String::as_str)
            .or_else(|| self.graph.units.get(id).map(|u| u.path.as_str()))
    }

    fn file_units(&self, path: &str) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .graph
            .units_by_file
            .get(path)
            .cloned()
            .unwrap_or_default();
        ids.extend(
            self.unit_paths
                .iter()
                .filter(|(_, owner)| owner.as_str() == path)
                .map(|(id, _)| id.clone()),
        );
        ids.into_iter().collect()
    }

    fn clear(&mut self, path: &str) {
        for id in self.file_units(path) {
            let key = NodeKey::Unit(id.clone());
            for chunk in self
                .graph
                .edges(&key, EdgeKind::Describes, Direction::Incoming)
            {
                self.remove(chunk);
            }
            self.unit_paths.remove(&id);
            self.remove(key);
        }
    }

    fn require(&self, key: &NodeKey, context: &str) -> Result<(), StoreError> {
        if self.exists(key) {
            Ok(())
        } else {
            Err(StoreError::Invalid(format!("{}: {} does not exist", context, key)))
        }
    }

    fn check(&mut self, op: &WriteOp, dimensions: Option<usize>) -> Result<(), StoreError> {
        match op {
            WriteOp::UpsertNode(node) => {
                node.validate().map_err(StoreError::Invalid)?;
                match node {
                    GraphNode::CodeUnit(unit) => {
                        self.require(&NodeKey::File(unit.path.clone()), &unit.id)?;
                        self.unit_paths.insert(unit.id.clone(), unit.path.clone());
                    }
                    GraphNode::SemanticChunk(chunk) => {
                        self.require(&NodeKey::Unit(chunk.unit_id.clone()), &chunk.id)?;
                        if let Some(expected) = dimensions {
                            if chunk.embedding.len() != expected {
                                return Err(StoreError::Invalid(format!(
                                    "chunk {} has {} dimensions, expected {}",
                                    chunk.id,
                                    chunk.embedding.len(),
                                    expected
                                )));
                            }
                        }
                    }
                    _ => {}
                }
                self.add(node.key());
            }
            WriteOp::UpsertEdge(edge) => {
                edge.validate().map_err(StoreError::Invalid)?;
                let context = format!("{:?} edge", edge.kind);
                self.require(&edge.source, &context)?;
                self.require(&edge.target, &context)?;
            }
            WriteOp::ClearFileContents { path } => self.clear(path),
            WriteOp::RemoveFile { path } => {
                self.clear(path);
                self.remove(NodeKey::File(path.clone()));
            }
            WriteOp::ReplaceImports { path, targets } => {
                self.require(&NodeKey::File(path.clone()), "import source")?;
                for target in targets {
                    self.require(&NodeKey::File(target.clone()), "import target")?;
                }
            }
            WriteOp::ReplaceFileCalls { path, calls } => {
                self.require(&NodeKey::File(path.clone()), "call source")?;
                for (caller, callee) in calls {
                    match self.unit_path(caller) {
                        Some(owner) if owner == path.as_str() => {}
                        Some(owner) => {
                            return Err(StoreError::Invalid(format!(
                                "caller {} belongs to {}, not {}",
                                caller, owner, path
                            )))
                        }
                        None => {
                            return Err(StoreError::Invalid(format!(
                                "caller {} does not exist",
                                caller
                            )))
                        }
                    }
                    self.require(&NodeKey::Unit(callee.clone()), "callee")?;
                }
            }
            WriteOp::RetainHistory { repo_id, .. } => {
                if repo_id.trim().is_empty() {
                    return Err(StoreError::Invalid("repo id must not be empty".to_string()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotChunk {
    sequence: u64,
    #[serde(flatten)]
    chunk: SemanticChunk,
}

/// On-disk form of the graph.
#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    next_sequence: u64,
    files: Vec<SourceFile>,
    units: Vec<CodeUnit>,
    chunks: Vec<SnapshotChunk>,
    commits: Vec<Commit>,
    authors: Vec<Author>,
    revisions: Vec<FileRevision>,
    edges: Vec<GraphEdge>,
}

/// Graph store held in memory and saved to `graph.json` on commit.
///
/// Batches are validated against the current graph plus the batch's own
/// earlier ops, then applied under one write lock, so readers see either
/// none or all of a batch.
pub struct LocalGraphStore {
    graph: RwLock<KnowledgeGraph>,
    path: Option<PathBuf>,
    dimensions: Option<usize>,
    dirty: AtomicBool,
    writes: AtomicU64,
}

impl LocalGraphStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            graph: RwLock::new(KnowledgeGraph::default()),
            path: None,
            dimensions: None,
            dirty: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Load the snapshot in `dir`, or start empty if there is none.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(GRAPH_FILE);

        let graph = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: GraphSnapshot = serde_json::from_str(&content)?;
            let graph = KnowledgeGraph::from_snapshot(snapshot)?;
            info!(
                "Loaded graph from {}: {} files, {} units, {} commits",
                path.display(),
                graph.files.len(),
                graph.units.len(),
                graph.commits.len()
            );
            graph
        } else {
            debug!("No graph at {}, starting empty", path.display());
            KnowledgeGraph::default()
        };

        Ok(Self {
            graph: RwLock::new(graph),
            path: Some(path),
            dimensions: None,
            dirty: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        })
    }

    /// Reject chunks whose embedding length differs from `dimensions`.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Snapshot location, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total node and edge mutations applied since the store was opened.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphStore for LocalGraphStore {
    async fn apply(&self, batch: WriteBatch) -> Result<WriteSummary, StoreError> {
        if batch.is_empty() {
            return Ok(WriteSummary::default());
        }
        let mut graph = self.graph.write().await;
        graph.check(&batch, self.dimensions)?;

        let mut summary = WriteSummary::default();
        for op in batch.into_ops() {
            graph.apply_op(op, &mut summary);
        }

        if !summary.is_noop() {
            let mutations = summary.nodes_written
                + summary.nodes_removed
                + summary.edges_written
                + summary.edges_removed;
            self.writes.fetch_add(mutations as u64, Ordering::SeqCst);
            self.dirty.store(true, Ordering::SeqCst);
        }
        debug!(
            "Applied batch: +{} -{} nodes, +{} -{} edges",
            summary.nodes_written,
            summary.nodes_removed,
            summary.edges_written,
            summary.edges_removed
        );
        Ok(summary)
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            debug!("Graph not dirty, skipping save");
            return Ok(());
        }

        let result = async {
            let json = {
                let graph = self.graph.read().await;
                serde_json::to_vec(&graph.to_snapshot())?
            };
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok::<usize, StoreError>(json.len())
        }
        .await;

        match result {
            Ok(bytes) => {
                info!("Saved graph to {} ({} bytes)", path.display(), bytes);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn node(&self, key: &NodeKey) -> Result<Option<GraphNode>, StoreError> {
        Ok(self.graph.read().await.get(key))
    }

    async fn contains(&self, key: &NodeKey) -> Result<bool, StoreError> {
        Ok(self.graph.read().await.contains(key))
    }

    async fn file_paths(&self) -> Result<Vec<String>, StoreError> {
        let graph = self.graph.read().await;
        let mut paths: Vec<String> = graph.files.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn units_in_file(&self, path: &str) -> Result<Vec<CodeUnit>, StoreError> {
        let graph = self.graph.read().await;
        let mut units: Vec<CodeUnit> = graph
            .units_by_file
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|id| graph.units.get(id).cloned())
            .collect();
        units.sort_by_key(|u| u.span.start_byte);
        Ok(units)
    }

    async fn units_named(&self, name: &str) -> Result<Vec<CodeUnit>, StoreError> {
        let graph = self.graph.read().await;
        let mut units: Vec<CodeUnit> = graph
            .units_by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| graph.units.get(id).cloned())
            .collect();
        units.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.span.start_byte.cmp(&b.span.start_byte))
        });
        Ok(units)
    }

    async fn neighbors(
        &self,
        key: &NodeKey,
        kind: EdgeKind,
        direction: Direction,
    ) -> Result<Vec<NodeKey>, StoreError> {
        Ok(self.graph.read().await.edges(key, kind, direction))
    }

    async fn nearest_chunks(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, StoreError> {
        if limit == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.graph.read().await.nearest(vector, limit))
    }

    async fn file_history(
        &self,
        path: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.graph.read().await.history(path, since))
    }

    async fn stats(&self) -> Result<GraphStats, StoreError> {
        Ok(self.graph.read().await.stats())
    }
}
