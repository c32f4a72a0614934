//! The graph store interface.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CodeUnit, Commit, EdgeKind, FileRevision, GraphEdge, GraphNode, NodeKey};

/// Errors raised by a graph store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid write: {0}")]
    Invalid(String),

    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize graph: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// One mutation. Batches of these are validated as a whole and applied
/// atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or update a node by identity
    UpsertNode(GraphNode),
    /// Insert an edge if absent; both endpoints must exist
    UpsertEdge(GraphEdge),
    /// Remove a file's units and chunks and every edge touching them
    ClearFileContents { path: String },
    /// Remove a file, its contents and every edge touching any of them
    RemoveFile { path: String },
    /// Replace the file's outgoing import edges
    ReplaceImports { path: String, targets: Vec<String> },
    /// Replace the call edges leaving the file's units: (caller id, callee id)
    ReplaceFileCalls {
        path: String,
        calls: Vec<(String, String)>,
    },
    /// Drop the repository's commits not in `revisions`, with their file
    /// revisions and orphaned authors
    RetainHistory {
        repo_id: String,
        revisions: HashSet<String>,
    },
}

/// An ordered list of writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn upsert(&mut self, node: GraphNode) -> &mut Self {
        self.push(WriteOp::UpsertNode(node))
    }

    pub fn edge(&mut self, edge: GraphEdge) -> &mut Self {
        self.push(WriteOp::UpsertEdge(edge))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

impl From<Vec<WriteOp>> for WriteBatch {
    fn from(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }
}

/// What a batch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub nodes_written: usize,
    pub nodes_removed: usize,
    pub edges_written: usize,
    pub edges_removed: usize,
    /// Files whose units lost call edges because their callees were removed
    pub orphaned_callers: BTreeSet<String>,
}

impl WriteSummary {
    pub fn merge(&mut self, other: WriteSummary) {
        self.nodes_written += other.nodes_written;
        self.nodes_removed += other.nodes_removed;
        self.edges_written += other.edges_written;
        self.edges_removed += other.edges_removed;
        self.orphaned_callers.extend(other.orphaned_callers);
    }

    pub fn is_noop(&self) -> bool {
        self.nodes_written == 0
            && self.nodes_removed == 0
            && self.edges_written == 0
            && self.edges_removed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A nearest-neighbour hit joined to the unit it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    /// Insertion order of the chunk; lower was stored first
    pub sequence: u64,
    pub unit: CodeUnit,
}

/// A commit that touched a file, with the per-file change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub commit: Commit,
    pub revision: FileRevision,
}

/// Entity counts and sync markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub files: usize,
    pub units: usize,
    pub chunks: usize,
    pub commits: usize,
    pub authors: usize,
    pub file_revisions: usize,
    pub edges: usize,
    /// Most recent `synced_at` over all source files
    pub last_file_sync: Option<DateTime<Utc>>,
}

/// Backing graph database.
///
/// Only the ingestion side writes; retrieval goes through the read methods.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Validate and apply a batch. Nothing is applied if any op is invalid.
    async fn apply(&self, batch: WriteBatch) -> Result<WriteSummary, StoreError>;

    /// Make every applied batch durable.
    async fn commit(&self) -> Result<(), StoreError>;

    async fn node(&self, key: &NodeKey) -> Result<Option<GraphNode>, StoreError>;

    async fn contains(&self, key: &NodeKey) -> Result<bool, StoreError> {
        Ok(self.node(key).await?.is_some())
    }

    /// All source file paths, sorted.
    async fn file_paths(&self) -> Result<Vec<String>, StoreError>;

    /// Units owned by a file, in source order.
    async fn units_in_file(&self, path: &str) -> Result<Vec<CodeUnit>, StoreError>;

    /// Units with the given unqualified name, ordered by path then offset.
    async fn units_named(&self, name: &str) -> Result<Vec<CodeUnit>, StoreError>;

    /// Adjacent nodes over one edge kind, sorted.
    async fn neighbors(
        &self,
        key: &NodeKey,
        kind: EdgeKind,
        direction: Direction,
    ) -> Result<Vec<NodeKey>, StoreError>;

    /// Up to `limit` chunks by descending cosine similarity; equal scores keep
    /// insertion order.
    async fn nearest_chunks(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, StoreError>;

    /// Commits touching `path`, newest first, optionally only since a time.
    async fn file_history(
        &self,
        path: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn stats(&self) -> Result<GraphStats, StoreError>;
}
