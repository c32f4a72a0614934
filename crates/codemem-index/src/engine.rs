//! The engine facade: one repository's graph, checkpoints, pipeline,
//! history synchronizer and retrieval behind a single handle.
//!
//! Front-ends (the CLI, a protocol server) only talk to
//! [`KnowledgeGraphEngine`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use codemem_config::Config;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointStore, CHECKPOINT_FILE};
use crate::embeddings::{Embedder, EmbeddingProvider, OpenAiEmbeddings};
use crate::error::Result;
use crate::extractor::SyntaxExtractor;
use crate::graph::{GraphStats, GraphStore, LocalGraphStore};
use crate::history::{GitCli, HistoryReport, HistorySyncMode, HistorySynchronizer, VcsSource};
use crate::pipeline::{ImportResolver, IngestSettings, IngestionPipeline, SyncReport};
use crate::retrieval::{
    CommitContext, Dependencies, FileHistoryEntry, FileInfo, ImpactReport, RankedHit,
    RetrievalEngine, SearchHit,
};
use crate::sync::{FileEvent, FileEventKind, FileWatcher, IncrementalSynchronizer, SyncTarget};

/// Entity counts and sync markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub repo_id: String,
    pub root: PathBuf,
    #[serde(flatten)]
    pub graph: GraphStats,
    /// Files with an advanced checkpoint
    pub checkpointed_files: usize,
    pub history_checkpoint: Option<String>,
}

/// Builds a [`KnowledgeGraphEngine`] from configuration, with any part
/// replaceable.
pub struct EngineBuilder {
    root: PathBuf,
    config: Config,
    store: Option<Arc<dyn GraphStore>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    vcs: Option<Arc<dyn VcsSource>>,
    extractor: Option<Arc<SyntaxExtractor>>,
    resolver: Option<Arc<dyn ImportResolver>>,
}

impl EngineBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: Config::default(),
            store: None,
            checkpoints: None,
            provider: None,
            vcs: None,
            extractor: None,
            resolver: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VcsSource>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<SyntaxExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ImportResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<KnowledgeGraphEngine> {
        let config = self.config;
        config.validate()?;
        let root = std::fs::canonicalize(&self.root)?;
        let repo_id = root.display().to_string();
        let data_dir = config.data_dir(&root);
        let dimensions = config.embedding.dimensions;

        let store: Arc<dyn GraphStore> = match self.store {
            Some(store) => store,
            None if config.graph.persist => {
                Arc::new(LocalGraphStore::open(&data_dir)?.with_dimensions(dimensions))
            }
            None => Arc::new(LocalGraphStore::in_memory().with_dimensions(dimensions)),
        };
        let checkpoints = match self.checkpoints {
            Some(checkpoints) => checkpoints,
            None if config.graph.persist => {
                Arc::new(CheckpointStore::open(data_dir.join(CHECKPOINT_FILE))?)
            }
            None => Arc::new(CheckpointStore::in_memory()),
        };
        let provider: Arc<dyn EmbeddingProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(OpenAiEmbeddings::from_config(&config.embedding)?),
        };
        let vcs: Arc<dyn VcsSource> = match self.vcs {
            Some(vcs) => vcs,
            None => Arc::new(GitCli::new(&root)),
        };
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(SyntaxExtractor::with_defaults()));

        let embedder = Embedder::from_config(provider, &config.embedding);
        let settings = IngestSettings::from_config(&root, &config.indexing);
        let mut pipeline =
            IngestionPipeline::new(store.clone(), checkpoints.clone(), embedder.clone(), settings)
                .with_extractor(extractor)
                .with_price(config.embedding.price_per_million_tokens);
        if let Some(resolver) = self.resolver {
            pipeline = pipeline.with_resolver(resolver);
        }
        let history =
            HistorySynchronizer::new(store.clone(), checkpoints.clone(), vcs, repo_id.clone());
        let retrieval =
            RetrievalEngine::new(store.clone(), embedder, config.retrieval.clone(), repo_id.clone());

        info!("Engine ready for {} (data in {})", repo_id, data_dir.display());
        Ok(KnowledgeGraphEngine {
            root,
            repo_id,
            config,
            store,
            checkpoints,
            pipeline,
            history,
            retrieval,
            sync_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }
}

/// Synchronization and retrieval for one repository.
pub struct KnowledgeGraphEngine {
    root: PathBuf,
    repo_id: String,
    config: Config,
    store: Arc<dyn GraphStore>,
    checkpoints: Arc<CheckpointStore>,
    pipeline: IngestionPipeline,
    history: HistorySynchronizer,
    retrieval: RetrievalEngine,
    /// Held by every write operation so syncs never overlap
    sync_lock: tokio::sync::Mutex<()>,
    /// Token of the running (or next) full sync
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for KnowledgeGraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeGraphEngine")
            .field("repo_id", &self.repo_id)
            .field("root", &self.root)
            .finish()
    }
}

impl KnowledgeGraphEngine {
    pub fn builder(root: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        *current = token.clone();
        token
    }

    /// Stop the running full sync from scheduling more files.
    pub fn cancel(&self) {
        let current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        current.cancel();
    }

    /// Run the four-stage pipeline over the whole repository.
    pub async fn sync_full(&self) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let token = self.fresh_token();
        self.pipeline.run_full(token).await
    }

    /// Apply one (already debounced) file event.
    pub async fn sync_incremental(&self, event: &FileEvent) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        debug!("Incremental sync: {} {}", event.kind, event.path);
        match event.kind {
            FileEventKind::Created | FileEventKind::Modified => {
                self.pipeline.sync_file(&event.path).await
            }
            FileEventKind::Deleted => self.pipeline.remove_file(&event.path).await,
        }
    }

    pub async fn sync_history(&self, mode: HistorySyncMode) -> Result<HistoryReport> {
        let _guard = self.sync_lock.lock().await;
        self.history.sync(mode).await
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.retrieval.search(query, limit).await
    }

    pub async fn dependencies(&self, path: &str) -> Result<Option<Dependencies>> {
        self.retrieval.dependencies(path).await
    }

    /// Definitions and import edges of one file.
    pub async fn file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        self.retrieval.file_info(path).await
    }

    pub async fn impact(&self, path: &str, max_depth: usize) -> Result<Option<ImpactReport>> {
        self.retrieval.impact(path, max_depth).await
    }

    /// Re-rank semantic candidates; `window` defaults to the configured
    /// churn window.
    pub async fn hybrid_rank(
        &self,
        candidates: Vec<SearchHit>,
        window: Option<Duration>,
    ) -> Result<Vec<RankedHit>> {
        let window = window.unwrap_or_else(|| {
            Duration::days(i64::from(self.config.retrieval.churn_window_days))
        });
        self.retrieval.hybrid_rank(candidates, window).await
    }

    pub async fn file_history(
        &self,
        path: &str,
        limit: usize,
    ) -> Result<Option<Vec<FileHistoryEntry>>> {
        self.retrieval.file_history(path, limit).await
    }

    pub async fn commit_context(&self, revision: &str) -> Result<Option<CommitContext>> {
        self.retrieval.commit_context(revision).await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let graph = self.store.stats().await?;
        Ok(EngineStatus {
            repo_id: self.repo_id.clone(),
            root: self.root.clone(),
            graph,
            checkpointed_files: self.checkpoints.tracked_files().await.len(),
            history_checkpoint: self.history.checkpoint().await,
        })
    }

    /// Watcher for this repository's files.
    pub fn watcher(&self) -> FileWatcher {
        FileWatcher::new(
            Arc::new(self.pipeline.settings().clone()),
            self.pipeline.extractor(),
        )
    }

    /// Consumer applying watcher events to this engine.
    pub fn synchronizer(self: &Arc<Self>) -> IncrementalSynchronizer<Self> {
        IncrementalSynchronizer::new(self.clone(), self.config.watch.debounce())
    }
}

#[async_trait]
impl SyncTarget for KnowledgeGraphEngine {
    async fn apply_event(&self, event: &FileEvent) -> Result<SyncReport> {
        self.sync_incremental(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingError;
    use crate::error::SyncError;
    use tempfile::tempdir;

    struct Constant;

    #[async_trait]
    impl EmbeddingProvider for Constant {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "constant"
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.dimensions = 2;
        config
    }

    fn build(root: &Path, config: Config) -> Result<KnowledgeGraphEngine> {
        KnowledgeGraphEngine::builder(root)
            .with_config(config)
            .with_embedding_provider(Arc::new(Constant))
            .build()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = config();
        config.indexing.worker_limit = 0;
        let err = build(dir.path(), config).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_persisted_state_survives_reopen() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lib.py"), "def run():\n    return 1\n").unwrap();

        let engine = build(dir.path(), config()).unwrap();
        assert!(format!("{:?}", engine).contains("KnowledgeGraphEngine"));
        let report = engine.sync_full().await.unwrap();
        assert_eq!(report.files_new, 1);
        drop(engine);

        let engine = build(dir.path(), config()).unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.graph.files, 1);
        assert_eq!(status.checkpointed_files, 1);
        assert_eq!(status.history_checkpoint, None);

        let report = engine.sync_full().await.unwrap();
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.embedding_calls, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_run_does_not_leak_into_next_sync() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("lib.py"), "def run():\n    return 1\n").unwrap();
        let mut config = config();
        config.graph.persist = false;
        let engine = build(dir.path(), config).unwrap();

        engine.cancel();
        let report = engine.sync_full().await.unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.files_new, 1);
    }
}
