//! Read-only queries over the graph.
//!
//! Nothing here writes. Lookups of a path or revision the graph does not
//! know return `Ok(None)` rather than an error.

pub mod hybrid;
pub mod impact;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use codemem_config::RetrievalConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::extractor::UnitKind;
use crate::graph::{
    Author, ChangeKind, ChunkMatch, CodeUnit, Commit, Direction, EdgeKind, FileRevision,
    GraphNode, GraphStore, NodeKey,
};

pub use hybrid::{FileSignals, RankedHit};
pub use impact::ImpactEntry;

/// A semantic search result joined to the unit it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Cosine similarity to the query
    pub score: f32,
    pub unit_id: String,
    pub path: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: UnitKind,
    pub line_start: usize,
    pub line_end: usize,
    pub signature: Option<String>,
    /// The embedded, context-prefixed text
    pub text: String,
}

impl From<ChunkMatch> for SearchHit {
    fn from(m: ChunkMatch) -> Self {
        Self {
            chunk_id: m.chunk_id,
            score: m.score,
            unit_id: m.unit.id,
            path: m.unit.path,
            name: m.unit.name,
            qualified_name: m.unit.qualified_name,
            kind: m.unit.kind,
            line_start: m.unit.span.line_start,
            line_end: m.unit.span.line_end,
            signature: m.unit.signature,
            text: m.text,
        }
    }
}

/// Import edges of one file, kept apart by direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    pub path: String,
    /// Files this file imports
    pub imports: Vec<String>,
    /// Files importing this file
    pub imported_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub path: String,
    pub max_depth: usize,
    pub affected: Vec<ImpactEntry>,
}

/// One commit in a file's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHistoryEntry {
    pub revision: String,
    pub committed_at: DateTime<Utc>,
    pub author_email: String,
    pub subject: String,
    pub change: ChangeKind,
    pub previous_path: Option<String>,
    pub additions: u32,
    pub deletions: u32,
}

/// A commit with its author and the files it touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitContext {
    pub commit: Commit,
    pub author: Option<Author>,
    pub files: Vec<FileRevision>,
}

/// A definition listed in [`FileInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub id: String,
    pub qualified_name: String,
    pub line_start: usize,
    pub line_end: usize,
    pub signature: Option<String>,
}

impl From<&CodeUnit> for UnitSummary {
    fn from(unit: &CodeUnit) -> Self {
        Self {
            id: unit.id.clone(),
            qualified_name: unit.qualified_name.clone(),
            line_start: unit.span.line_start,
            line_end: unit.span.line_end,
            signature: unit.signature.clone(),
        }
    }
}

/// One file's definitions grouped by kind, in source order, with its
/// import edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub language: String,
    pub fingerprint: String,
    /// When the file's contents were last written to the graph
    pub synced_at: DateTime<Utc>,
    pub classes: Vec<UnitSummary>,
    pub functions: Vec<UnitSummary>,
    pub methods: Vec<UnitSummary>,
    pub imports: Vec<String>,
    pub imported_by: Vec<String>,
}

/// Answers search, dependency, impact and history queries.
#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn GraphStore>,
    embedder: Embedder,
    config: RetrievalConfig,
    repo_id: String,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Embedder,
        config: RetrievalConfig,
        repo_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            repo_id: repo_id.into(),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Nearest chunks to the embedded query, most similar first.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;
        self.search_by_vector(&vector, limit).await
    }

    pub async fn search_by_vector(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        let matches = self.store.nearest_chunks(vector, limit).await?;
        debug!("Vector search returned {} hits", matches.len());
        Ok(matches.into_iter().map(SearchHit::from).collect())
    }

    pub async fn dependencies(&self, path: &str) -> Result<Option<Dependencies>> {
        let key = NodeKey::File(path.to_string());
        if !self.store.contains(&key).await? {
            return Ok(None);
        }
        let files = |keys: Vec<NodeKey>| -> Vec<String> {
            keys.iter()
                .filter_map(|k| k.as_file().map(str::to_string))
                .collect()
        };
        let imports = self
            .store
            .neighbors(&key, EdgeKind::Imports, Direction::Outgoing)
            .await?;
        let imported_by = self
            .store
            .neighbors(&key, EdgeKind::Imports, Direction::Incoming)
            .await?;
        Ok(Some(Dependencies {
            path: path.to_string(),
            imports: files(imports),
            imported_by: files(imported_by),
        }))
    }

    pub async fn file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        let Some(GraphNode::SourceFile(file)) =
            self.store.node(&NodeKey::File(path.to_string())).await?
        else {
            return Ok(None);
        };
        let Some(deps) = self.dependencies(path).await? else {
            return Ok(None);
        };

        let mut info = FileInfo {
            path: file.path,
            language: file.language,
            fingerprint: file.fingerprint,
            synced_at: file.synced_at,
            classes: Vec::new(),
            functions: Vec::new(),
            methods: Vec::new(),
            imports: deps.imports,
            imported_by: deps.imported_by,
        };
        for unit in self.store.units_in_file(path).await? {
            let group = match unit.kind {
                UnitKind::Class => &mut info.classes,
                UnitKind::Function => &mut info.functions,
                UnitKind::Method => &mut info.methods,
            };
            group.push(UnitSummary::from(&unit));
        }
        Ok(Some(info))
    }

    pub async fn impact(&self, path: &str, max_depth: usize) -> Result<Option<ImpactReport>> {
        if !self.store.contains(&NodeKey::File(path.to_string())).await? {
            return Ok(None);
        }
        let max_depth = max_depth.max(1);
        let affected = impact::dependents(self.store.as_ref(), path, max_depth).await?;
        Ok(Some(ImpactReport {
            path: path.to_string(),
            max_depth,
            affected,
        }))
    }

    /// Re-rank candidates with structure and churn inside `window` ending now.
    pub async fn hybrid_rank(
        &self,
        candidates: Vec<SearchHit>,
        window: Duration,
    ) -> Result<Vec<RankedHit>> {
        self.hybrid_rank_at(candidates, window, Utc::now()).await
    }

    pub async fn hybrid_rank_at(
        &self,
        candidates: Vec<SearchHit>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedHit>> {
        let since = now - window;
        let paths: BTreeSet<&str> = candidates.iter().map(|hit| hit.path.as_str()).collect();

        let mut signals = FileSignals::default();
        for path in paths {
            let importers = self
                .store
                .neighbors(
                    &NodeKey::File(path.to_string()),
                    EdgeKind::Imports,
                    Direction::Incoming,
                )
                .await?;
            let commits = self
                .store
                .file_history(path, Some(since))
                .await?
                .iter()
                .filter(|entry| entry.commit.committed_at <= now)
                .count();
            signals.fan_in.insert(path.to_string(), importers.len());
            signals.churn.insert(path.to_string(), commits);
        }

        Ok(hybrid::rank(candidates, &signals, &self.config.hybrid))
    }

    /// Commits touching `path`, newest first.
    ///
    /// Files no longer on disk keep their history; `None` only when the path
    /// is unknown to both domains.
    pub async fn file_history(
        &self,
        path: &str,
        limit: usize,
    ) -> Result<Option<Vec<FileHistoryEntry>>> {
        let entries = self.store.file_history(path, None).await?;
        if entries.is_empty() && !self.store.contains(&NodeKey::File(path.to_string())).await? {
            return Ok(None);
        }
        Ok(Some(
            entries
                .into_iter()
                .filter(|entry| entry.commit.repo_id == self.repo_id)
                .take(limit)
                .map(|entry| FileHistoryEntry {
                    revision: entry.commit.revision,
                    committed_at: entry.commit.committed_at,
                    author_email: entry.commit.author_email,
                    subject: entry.commit.subject,
                    change: entry.revision.change,
                    previous_path: entry.revision.previous_path,
                    additions: entry.revision.additions,
                    deletions: entry.revision.deletions,
                })
                .collect(),
        ))
    }

    pub async fn commit_context(&self, revision: &str) -> Result<Option<CommitContext>> {
        let key = NodeKey::commit(&self.repo_id, revision);
        let Some(GraphNode::Commit(commit)) = self.store.node(&key).await? else {
            return Ok(None);
        };

        let mut author = None;
        for author_key in self
            .store
            .neighbors(&key, EdgeKind::AuthoredBy, Direction::Outgoing)
            .await?
        {
            if let Some(GraphNode::Author(a)) = self.store.node(&author_key).await? {
                author = Some(a);
            }
        }

        let mut files = Vec::new();
        for revision_key in self
            .store
            .neighbors(&key, EdgeKind::Touches, Direction::Outgoing)
            .await?
        {
            if let Some(GraphNode::FileRevision(r)) = self.store.node(&revision_key).await? {
                files.push(r);
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Some(CommitContext {
            commit,
            author,
            files,
        }))
    }
}
