//! The staged ingestion pipeline.
//!
//! A full run goes through four stages:
//! 1. scan the repository and diff it against the checkpoints
//! 2. extract, embed and write each new or changed file
//! 3. resolve import edges for the files written in stage 2, and for every
//!    file when files appeared or disappeared
//! 4. resolve call edges for every file whose call graph is stale, including
//!    files calling a name whose definitions changed
//!
//! File checkpoints only advance once every stage has committed.

pub mod calls;
pub mod entities;
pub mod imports;
pub mod scan;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codemem_config::IndexingConfig;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::embeddings::{Embedder, UsageSnapshot};
use crate::error::{Result, SyncError};
use crate::extractor::SyntaxExtractor;
use crate::fingerprint::fingerprint;
use crate::graph::{
    GraphNode, GraphStore, NodeKey, SourceFile, StoreError, WriteBatch, WriteOp, WriteSummary,
};

pub use calls::{resolve_callee, CallOutcome};
pub use entities::{chunk_text, FileOutcome, IngestedFile};
pub use imports::{FileIndex, ImportOutcome, ImportResolver, PathSuffixResolver};
pub use scan::{Collected, ScanFilter, ScannedFile, Worklist};

const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(200);

/// Scan settings for one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    pub root: PathBuf,
    pub extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub respect_gitignore: bool,
    pub worker_limit: usize,
}

impl IngestSettings {
    pub fn from_config(root: &Path, config: &IndexingConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            extensions: config.extensions.clone(),
            ignore_dirs: config.ignore_dirs.clone(),
            ignore_patterns: config.ignore_patterns.clone(),
            respect_gitignore: config.respect_gitignore,
            worker_limit: config.worker_limit.max(1),
        }
    }
}

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Read,
    Extract,
    Embed,
    Write,
    Imports,
    Calls,
    Delete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Extract => "extract",
            Self::Embed => "embed",
            Self::Write => "write",
            Self::Imports => "imports",
            Self::Calls => "calls",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A file that could not be fully processed this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub stage: Stage,
    pub reason: String,
}

/// What a synchronization run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,
    pub files_scanned: usize,
    pub files_new: usize,
    pub files_changed: usize,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub units_written: usize,
    pub chunks_embedded: usize,
    pub embedding_calls: u64,
    pub import_edges_written: usize,
    pub call_edges_written: usize,
    pub unresolved_imports: usize,
    pub unresolved_calls: usize,
    pub failures: Vec<FileFailure>,
    /// Files ingested despite syntax errors
    pub parse_warnings: Vec<String>,
    pub cancelled: bool,
    pub duration_ms: u64,
    pub embedding_usage: UsageSnapshot,
}

impl SyncReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Everything one run needs, passed explicitly to every stage.
#[derive(Clone)]
pub struct IngestContext {
    pub store: Arc<dyn GraphStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub embedder: Embedder,
    pub extractor: Arc<SyntaxExtractor>,
    pub resolver: Arc<dyn ImportResolver>,
    pub settings: Arc<IngestSettings>,
    pub price_per_million_tokens: f64,
    pub cancel: CancellationToken,
}

/// Run a store operation, retrying transient failures with backoff.
///
/// Transient failures that outlast the retries become
/// [`SyncError::TransientExternal`].
async fn with_store_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < STORE_ATTEMPTS => {
                attempt += 1;
                let delay = STORE_BACKOFF * 2u32.pow(attempt - 1);
                warn!("Graph {} failed ({}), retrying in {:?}", what, e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => return Err(SyncError::TransientExternal(e.to_string())),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Apply a batch, retrying transient store failures.
pub async fn apply_with_retry(store: &dyn GraphStore, batch: WriteBatch) -> Result<WriteSummary> {
    with_store_retry("write", || store.apply(batch.clone())).await
}

/// Make applied batches durable, retrying transient store failures.
pub async fn commit_with_retry(store: &dyn GraphStore) -> Result<()> {
    with_store_retry("commit", || store.commit()).await
}

/// Drives the four stages over one repository.
pub struct IngestionPipeline {
    store: Arc<dyn GraphStore>,
    checkpoints: Arc<CheckpointStore>,
    embedder: Embedder,
    extractor: Arc<SyntaxExtractor>,
    resolver: Arc<dyn ImportResolver>,
    settings: Arc<IngestSettings>,
    price_per_million_tokens: f64,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        checkpoints: Arc<CheckpointStore>,
        embedder: Embedder,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            checkpoints,
            embedder,
            extractor: Arc::new(SyntaxExtractor::with_defaults()),
            resolver: Arc::new(PathSuffixResolver),
            settings: Arc::new(settings),
            price_per_million_tokens: 0.0,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<SyntaxExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ImportResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_price(mut self, price_per_million_tokens: f64) -> Self {
        self.price_per_million_tokens = price_per_million_tokens;
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub fn extractor(&self) -> Arc<SyntaxExtractor> {
        self.extractor.clone()
    }

    /// Fresh context for one run, with its own usage counters.
    pub fn context(&self, cancel: CancellationToken) -> IngestContext {
        IngestContext {
            store: self.store.clone(),
            checkpoints: self.checkpoints.clone(),
            embedder: self.embedder.for_run(),
            extractor: self.extractor.clone(),
            resolver: self.resolver.clone(),
            settings: self.settings.clone(),
            price_per_million_tokens: self.price_per_million_tokens,
            cancel,
        }
    }

    /// Synchronize the whole repository.
    pub async fn run_full(&self, cancel: CancellationToken) -> Result<SyncReport> {
        let ctx = self.context(cancel);
        let mut report = SyncReport::new();
        let span = info_span!("sync_full", run_id = %report.run_id);
        async {
            let start = Instant::now();
            run_stages(&ctx, &mut report).await?;
            report.embedding_usage = ctx.embedder.usage().snapshot(ctx.price_per_million_tokens);
            report.embedding_calls = report.embedding_usage.calls;
            report.duration_ms = start.elapsed().as_millis() as u64;
            info!(
                "Sync finished in {}ms: {} scanned, {} new, {} changed, {} deleted, {} failed{}",
                report.duration_ms,
                report.files_scanned,
                report.files_new,
                report.files_changed,
                report.files_deleted,
                report.failures.len(),
                if report.cancelled { " (cancelled)" } else { "" }
            );
            Ok::<(), SyncError>(())
        }
        .instrument(span)
        .await?;
        Ok(report)
    }

    /// Stages 2 and 3 for one created or modified file.
    ///
    /// Call edges are left to the next full run: the call-graph checkpoints
    /// of the file, its orphaned callers and every file calling one of its
    /// unit names are cleared instead.
    pub async fn sync_file(&self, path: &str) -> Result<SyncReport> {
        let ctx = self.context(CancellationToken::new());
        let mut report = SyncReport::new();
        let start = Instant::now();

        let filter = ScanFilter::new(&ctx.settings)?;
        if !filter.accepts(&ctx.extractor, path) {
            debug!("Ignoring event for excluded path {}", path);
            return Ok(report);
        }
        let absolute = ctx.settings.root.join(path);
        let bytes = match tokio::fs::read(&absolute).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.remove_file(path).await;
            }
            Err(e) => return Err(e.into()),
        };
        let Some(language) = ctx.extractor.detect_language(Path::new(path)) else {
            return Ok(report);
        };
        let file = ScannedFile {
            path: path.to_string(),
            absolute,
            language: language.to_string(),
            fingerprint: fingerprint(&bytes),
        };
        report.files_scanned = 1;

        let previous = ctx
            .checkpoints
            .get(&CheckpointKey::File(path.to_string()))
            .await;
        match previous.as_deref() {
            Some(fp) if fp == file.fingerprint => {
                debug!("{} unchanged, skipping", path);
                report.files_unchanged = 1;
                return Ok(report);
            }
            Some(_) => report.files_changed = 1,
            None => report.files_new = 1,
        }

        let mut updates = Vec::new();
        match entities::ingest_file(&ctx, &file).await {
            FileOutcome::Ingested(ingested) => {
                record_ingested(&mut report, &ingested);
                let paths = ctx.store.file_paths().await?;
                let others = load_stored(&ctx, paths.iter().filter(|p| p.as_str() != path).collect::<Vec<_>>()).await?;

                let mut jobs = vec![(path.to_string(), ingested.imports.clone())];
                if previous.is_none() {
                    jobs.extend(others.iter().map(|f| (f.path.clone(), f.imports.clone())));
                }
                let failed =
                    link_import_jobs(&ctx, jobs, &FileIndex::new(paths), &mut report).await;
                commit_with_retry(ctx.store.as_ref()).await?;

                if ingested.is_complete() && !failed.contains(path) {
                    updates.push((
                        CheckpointKey::File(path.to_string()),
                        Some(ingested.fingerprint.clone()),
                    ));
                }
                let mut stale = callers_of(&others, &ingested.unit_names);
                stale.extend(ingested.orphaned_callers.iter().cloned());
                stale.insert(path.to_string());
                updates.extend(stale.into_iter().map(|p| (CheckpointKey::CallGraph(p), None)));
            }
            FileOutcome::Failed(failure) => report.failures.push(failure),
            FileOutcome::Skipped { .. } => report.cancelled = true,
        }
        ctx.checkpoints.set_batch(updates).await?;

        report.embedding_usage = ctx.embedder.usage().snapshot(ctx.price_per_million_tokens);
        report.embedding_calls = report.embedding_usage.calls;
        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Remove a deleted file and everything it owns, then re-resolve the
    /// imports of the remaining files.
    pub async fn remove_file(&self, path: &str) -> Result<SyncReport> {
        let ctx = self.context(CancellationToken::new());
        let mut report = SyncReport::new();
        let start = Instant::now();

        let names: BTreeSet<String> = ctx
            .store
            .units_in_file(path)
            .await?
            .into_iter()
            .map(|unit| unit.name)
            .collect();
        let summary = apply_with_retry(
            ctx.store.as_ref(),
            WriteBatch::from(vec![WriteOp::RemoveFile {
                path: path.to_string(),
            }]),
        )
        .await?;

        let mut stale = summary.orphaned_callers.clone();
        if summary.nodes_removed > 0 {
            let paths = ctx.store.file_paths().await?;
            let remaining = load_stored(&ctx, paths.iter()).await?;
            stale.extend(callers_of(&remaining, &names));
            let jobs = remaining
                .iter()
                .map(|f| (f.path.clone(), f.imports.clone()))
                .collect();
            link_import_jobs(&ctx, jobs, &FileIndex::new(paths), &mut report).await;
        }
        commit_with_retry(ctx.store.as_ref()).await?;

        let mut updates = vec![
            (CheckpointKey::File(path.to_string()), None),
            (CheckpointKey::CallGraph(path.to_string()), None),
        ];
        updates.extend(stale.into_iter().map(|p| (CheckpointKey::CallGraph(p), None)));
        ctx.checkpoints.set_batch(updates).await?;

        if summary.nodes_removed > 0 {
            report.files_deleted = 1;
            info!("Removed {} from the graph", path);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }
}

/// `SourceFile` nodes for `paths`, skipping any not in the graph.
async fn load_stored<'a>(
    ctx: &IngestContext,
    paths: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<SourceFile>> {
    let mut stored = Vec::new();
    for path in paths {
        if let Some(GraphNode::SourceFile(file)) =
            ctx.store.node(&NodeKey::File(path.clone())).await?
        {
            stored.push(file);
        }
    }
    Ok(stored)
}

/// Files among `stored` that call any of `names`.
fn callers_of(stored: &[SourceFile], names: &BTreeSet<String>) -> BTreeSet<String> {
    if names.is_empty() {
        return BTreeSet::new();
    }
    stored
        .iter()
        .filter(|file| file.callees.iter().any(|name| names.contains(name)))
        .map(|file| file.path.clone())
        .collect()
}

/// Stage 3 over `(path, import references)` pairs. Returns the paths whose
/// edges could not be written.
async fn link_import_jobs(
    ctx: &IngestContext,
    jobs: Vec<(String, Vec<String>)>,
    files: &FileIndex,
    report: &mut SyncReport,
) -> BTreeSet<String> {
    let linking: Vec<_> = jobs
        .iter()
        .map(|(path, targets)| async move {
            let result = imports::link_imports(ctx, path, targets, files).await;
            (path.clone(), result)
        })
        .collect();
    let results: Vec<(String, Result<ImportOutcome>)> = stream::iter(linking)
        .buffer_unordered(ctx.settings.worker_limit)
        .collect()
        .await;

    let mut failed = BTreeSet::new();
    for (path, result) in results {
        match result {
            Ok(outcome) => {
                report.import_edges_written += outcome.edges_written;
                report.unresolved_imports += outcome.unresolved;
            }
            Err(e) => {
                warn!("Import linking failed for {}: {}", path, e);
                failed.insert(path.clone());
                report.failures.push(FileFailure {
                    path,
                    stage: Stage::Imports,
                    reason: e.to_string(),
                });
            }
        }
    }
    failed
}

fn record_ingested(report: &mut SyncReport, ingested: &IngestedFile) {
    report.units_written += ingested.units;
    report.chunks_embedded += ingested.chunks;
    if ingested.parse_errors.is_some() {
        report.parse_warnings.push(ingested.path.clone());
    }
    if let Some(failure) = &ingested.embedding_failure {
        report.failures.push(failure.clone());
    }
}

async fn run_stages(ctx: &IngestContext, report: &mut SyncReport) -> Result<()> {
    let workers = ctx.settings.worker_limit;

    // Stage 1: scan and diff
    let settings = ctx.settings.clone();
    let extractor = ctx.extractor.clone();
    let collected =
        tokio::task::spawn_blocking(move || scan::collect_files(&settings, &extractor))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;
    let mut known: BTreeSet<String> = ctx.checkpoints.tracked_files().await.into_iter().collect();
    known.extend(ctx.store.file_paths().await?);
    let worklist = scan::detect_changes(collected, &ctx.checkpoints, known).await;

    report.files_scanned = worklist.scanned();
    report.files_new = worklist.new.len();
    report.files_changed = worklist.changed.len();
    report.files_unchanged = worklist.unchanged.len();
    info!(
        "Scanned {} files: {} new, {} changed, {} deleted, {} unreadable",
        report.files_scanned,
        report.files_new,
        report.files_changed,
        worklist.deleted.len(),
        worklist.unreadable.len()
    );
    report.failures.extend(worklist.unreadable.iter().cloned());

    // unit names whose candidate sets change this run
    let mut affected_names: BTreeSet<String> = BTreeSet::new();
    let mut orphaned: BTreeSet<String> = BTreeSet::new();
    let mut updates: Vec<(CheckpointKey, Option<String>)> = Vec::new();
    for path in &worklist.deleted {
        let removed = async {
            let units = ctx.store.units_in_file(path).await?;
            let batch = WriteBatch::from(vec![WriteOp::RemoveFile { path: path.clone() }]);
            let summary = apply_with_retry(ctx.store.as_ref(), batch).await?;
            Ok::<_, SyncError>((units, summary))
        };
        match removed.await {
            Ok((units, summary)) => {
                affected_names.extend(units.into_iter().map(|unit| unit.name));
                orphaned.extend(summary.orphaned_callers);
                report.files_deleted += 1;
                updates.push((CheckpointKey::File(path.clone()), None));
                updates.push((CheckpointKey::CallGraph(path.clone()), None));
                debug!("Removed deleted file {}", path);
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", path, e);
                report.failures.push(FileFailure {
                    path: path.clone(),
                    stage: Stage::Delete,
                    reason: e.to_string(),
                });
            }
        }
    }

    // Stage 2: entities and embeddings
    let jobs: Vec<_> = worklist
        .to_ingest()
        .map(|file| entities::ingest_file(ctx, file))
        .collect();
    let outcomes: Vec<FileOutcome> = stream::iter(jobs).buffer_unordered(workers).collect().await;

    let mut ingested: BTreeMap<String, IngestedFile> = BTreeMap::new();
    let mut blocked: BTreeSet<String> = worklist
        .unreadable
        .iter()
        .map(|failure| failure.path.clone())
        .collect();
    for outcome in outcomes {
        match outcome {
            FileOutcome::Ingested(file) => {
                record_ingested(report, &file);
                orphaned.extend(file.orphaned_callers.iter().cloned());
                affected_names.extend(file.unit_names.iter().cloned());
                ingested.insert(file.path.clone(), file);
            }
            FileOutcome::Failed(failure) => {
                blocked.insert(failure.path.clone());
                report.failures.push(failure);
            }
            FileOutcome::Skipped { path } => {
                blocked.insert(path);
                report.cancelled = true;
            }
        }
    }
    info!(
        "Stage 2 wrote {} files, {} units, {} chunks",
        ingested.len(),
        report.units_written,
        report.chunks_embedded
    );

    if ctx.cancel.is_cancelled() {
        report.cancelled = true;
        commit_with_retry(ctx.store.as_ref()).await?;
        ctx.checkpoints.set_batch(updates).await?;
        warn!("Sync cancelled after stage 2; {} files left for the next run", blocked.len());
        return Ok(());
    }

    // Stage 3: imports. A file appearing or disappearing can change what
    // any reference resolves to.
    let file_set_changed = !worklist.new.is_empty() || report.files_deleted > 0;
    let untouched: Vec<SourceFile> = if file_set_changed || !affected_names.is_empty() {
        let paths: Vec<String> = worklist
            .unchanged
            .iter()
            .filter(|file| !blocked.contains(&file.path))
            .map(|file| file.path.clone())
            .collect();
        load_stored(ctx, paths.iter()).await?
    } else {
        Vec::new()
    };

    let mut jobs: Vec<(String, Vec<String>)> = ingested
        .values()
        .map(|file| (file.path.clone(), file.imports.clone()))
        .collect();
    if file_set_changed {
        debug!("File set changed; re-resolving imports of {} files", untouched.len());
        jobs.extend(untouched.iter().map(|f| (f.path.clone(), f.imports.clone())));
    }
    let files = FileIndex::new(ctx.store.file_paths().await?);
    blocked.extend(link_import_jobs(ctx, jobs, &files, report).await);

    // Stage 4: calls, for every file whose call edges may be stale
    let callers = callers_of(&untouched, &affected_names);
    let call_graph = ctx.checkpoints.call_graph_checkpoints().await;
    let stale: Vec<&ScannedFile> = worklist
        .on_disk()
        .filter(|file| !blocked.contains(&file.path) || ingested.contains_key(&file.path))
        .filter(|file| {
            ingested.contains_key(&file.path)
                || orphaned.contains(&file.path)
                || callers.contains(&file.path)
                || call_graph.get(&file.path) != Some(&file.fingerprint)
        })
        .collect();
    debug!("Rebuilding call edges for {} files", stale.len());

    let jobs: Vec<_> = stale
        .into_iter()
        .map(|file| async move { (file.path.clone(), calls::link_calls(ctx, file).await) })
        .collect();
    let call_results: Vec<(String, Result<CallOutcome>)> =
        stream::iter(jobs).buffer_unordered(workers).collect().await;
    for (path, result) in call_results {
        match result {
            Ok(outcome) => {
                report.call_edges_written += outcome.edges_written;
                report.unresolved_calls += outcome.unresolved;
                updates.push((CheckpointKey::CallGraph(path), Some(outcome.fingerprint)));
            }
            Err(e) => {
                warn!("Call linking failed for {}: {}", path, e);
                blocked.insert(path.clone());
                report.failures.push(FileFailure {
                    path,
                    stage: Stage::Calls,
                    reason: e.to_string(),
                });
            }
        }
    }

    // Durable graph first, then checkpoints
    commit_with_retry(ctx.store.as_ref()).await?;
    for (path, file) in &ingested {
        if file.is_complete() && !blocked.contains(path) {
            updates.push((CheckpointKey::File(path.clone()), Some(file.fingerprint.clone())));
        }
    }
    ctx.checkpoints.set_batch(updates).await?;
    Ok(())
}
