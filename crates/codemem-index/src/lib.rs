//! Knowledge graph synchronization for source repositories.
//!
//! This crate provides:
//! - A four-stage ingestion pipeline (scan, entities and embeddings, imports, calls)
//! - Tree-sitter extraction for Rust, Python, JavaScript/TypeScript and Go
//! - A transactional graph store with vector search over semantic chunks
//! - Per-file and per-repository checkpoints for incremental runs
//! - Debounced file watching feeding incremental syncs
//! - Commit history ingestion from git
//! - Retrieval: semantic search, dependencies, impact analysis, hybrid ranking

pub mod checkpoint;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod graph;
pub mod history;
pub mod pipeline;
pub mod retrieval;
pub mod sync;

// Re-exports
pub use checkpoint::{CheckpointKey, CheckpointStore};
pub use embeddings::{Embedder, EmbeddingProvider, OpenAiEmbeddings};
pub use engine::{EngineBuilder, EngineStatus, KnowledgeGraphEngine};
pub use error::{Result, SyncError};
pub use extractor::SyntaxExtractor;
pub use graph::{GraphStats, GraphStore, LocalGraphStore};
pub use history::{GitCli, HistoryReport, HistorySyncMode, HistorySynchronizer, VcsSource};
pub use pipeline::{IngestionPipeline, SyncReport};
pub use retrieval::{
    CommitContext, Dependencies, FileHistoryEntry, FileInfo, ImpactEntry, ImpactReport,
    RankedHit, RetrievalEngine, SearchHit, UnitSummary,
};
pub use sync::{FileEvent, FileEventKind, FileWatcher, IncrementalSynchronizer};
