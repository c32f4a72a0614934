//! Stage 2: extract a file's units, embed them, and replace its contents.

use std::collections::BTreeSet;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use super::scan::ScannedFile;
use super::{apply_with_retry, FileFailure, IngestContext, Stage};
use crate::extractor::{Extraction, ParseStatus, UnitKind};
use crate::fingerprint::{fingerprint, fingerprint_parts};
use crate::graph::{CodeUnit, GraphNode, SemanticChunk, SourceFile, WriteBatch, WriteOp};

/// What stage 2 did with one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// Contents were replaced in the graph
    Ingested(IngestedFile),
    /// Nothing was written
    Failed(FileFailure),
    /// Cancelled before the file was started
    Skipped { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestedFile {
    pub path: String,
    /// Fingerprint of the content that was ingested
    pub fingerprint: String,
    pub units: usize,
    pub chunks: usize,
    /// Import references as written, for stage 3
    pub imports: Vec<String>,
    /// Syntax error count for partially parsed files
    pub parse_errors: Option<usize>,
    /// Units left without a chunk because embedding failed
    pub embedding_failure: Option<FileFailure>,
    /// Files whose call edges into this file's old units were dropped
    pub orphaned_callers: BTreeSet<String>,
    /// Unqualified names of the units before and after the write
    pub unit_names: BTreeSet<String>,
}

impl IngestedFile {
    /// Whether the file's checkpoint may advance.
    pub fn is_complete(&self) -> bool {
        self.embedding_failure.is_none()
    }
}

/// Text embedded for a unit: its position in the file followed by its source.
///
/// `Context: File src/app.py > Class Repo > Method save`
pub fn chunk_text(unit: &CodeUnit) -> String {
    let mut context = vec![format!("File {}", unit.path)];
    if let Some(class) = &unit.enclosing_class {
        context.push(format!("Class {}", class));
    }
    let label = match unit.kind {
        UnitKind::Class => "Class",
        UnitKind::Function => "Function",
        UnitKind::Method => "Method",
    };
    context.push(format!("{} {}", label, unit.name));
    format!("Context: {}\n\n{}", context.join(" > "), unit.source)
}

/// Run stage 2 for one file.
pub async fn ingest_file(ctx: &IngestContext, file: &ScannedFile) -> FileOutcome {
    if ctx.cancel.is_cancelled() {
        return FileOutcome::Skipped {
            path: file.path.clone(),
        };
    }
    let failed = |stage: Stage, reason: String| {
        warn!("{} failed for {}: {}", stage, file.path, reason);
        FileOutcome::Failed(FileFailure {
            path: file.path.clone(),
            stage,
            reason,
        })
    };

    let bytes = match tokio::fs::read(&file.absolute).await {
        Ok(bytes) => bytes,
        Err(e) => return failed(Stage::Read, e.to_string()),
    };
    let content_fingerprint = fingerprint(&bytes);
    let source = String::from_utf8_lossy(&bytes).into_owned();

    let extractor = ctx.extractor.clone();
    let language = file.language.clone();
    let extraction = match tokio::task::spawn_blocking(move || extractor.extract(&source, &language))
        .await
    {
        Ok(Ok(extraction)) => extraction,
        Ok(Err(e)) => return failed(Stage::Extract, e.to_string()),
        Err(e) => return failed(Stage::Extract, format!("extraction task failed: {}", e)),
    };

    let units: Vec<CodeUnit> = extraction
        .definitions
        .iter()
        .map(|def| CodeUnit::from_definition(&file.path, def))
        .collect();
    let previous = match ctx.store.units_in_file(&file.path).await {
        Ok(previous) => previous,
        Err(e) => return failed(Stage::Write, e.to_string()),
    };
    let unit_names: BTreeSet<String> = previous
        .iter()
        .chain(units.iter())
        .map(|unit| unit.name.clone())
        .collect();
    let (chunks, embedding_failure) = embed_units(ctx, &file.path, &units).await;
    let imports = import_targets(&extraction);

    let mut batch = WriteBatch::new();
    batch
        .push(WriteOp::ClearFileContents {
            path: file.path.clone(),
        })
        .upsert(GraphNode::SourceFile(SourceFile {
            path: file.path.clone(),
            language: file.language.clone(),
            fingerprint: content_fingerprint.clone(),
            synced_at: Utc::now(),
            imports: imports.clone(),
            callees: callee_names(&extraction),
        }));
    for unit in &units {
        batch.upsert(GraphNode::CodeUnit(unit.clone()));
    }
    for chunk in &chunks {
        batch.upsert(GraphNode::SemanticChunk(chunk.clone()));
    }

    let summary = match apply_with_retry(ctx.store.as_ref(), batch).await {
        Ok(summary) => summary,
        Err(e) => return failed(Stage::Write, e.to_string()),
    };
    debug!(
        "Ingested {}: {} units, {} chunks",
        file.path,
        units.len(),
        chunks.len()
    );

    FileOutcome::Ingested(IngestedFile {
        path: file.path.clone(),
        fingerprint: content_fingerprint,
        units: units.len(),
        chunks: chunks.len(),
        imports,
        parse_errors: match extraction.status {
            ParseStatus::Partial { error_nodes } => Some(error_nodes),
            ParseStatus::Complete => None,
        },
        embedding_failure,
        orphaned_callers: summary.orphaned_callers,
        unit_names,
    })
}

fn import_targets(extraction: &Extraction) -> Vec<String> {
    extraction
        .imports
        .iter()
        .map(|import| import.target.clone())
        .collect()
}

fn callee_names(extraction: &Extraction) -> Vec<String> {
    let names: BTreeSet<&str> = extraction.calls.iter().map(|c| c.name.as_str()).collect();
    names.into_iter().map(str::to_string).collect()
}

/// Embed every unit concurrently. Failed units get no chunk.
async fn embed_units(
    ctx: &IngestContext,
    path: &str,
    units: &[CodeUnit],
) -> (Vec<SemanticChunk>, Option<FileFailure>) {
    let texts: Vec<String> = units.iter().map(chunk_text).collect();
    let results = join_all(texts.iter().map(|text| ctx.embedder.embed(text))).await;

    let mut chunks = Vec::with_capacity(units.len());
    let mut failed = Vec::new();
    for ((unit, text), result) in units.iter().zip(texts).zip(results) {
        match result {
            Ok(embedding) => chunks.push(SemanticChunk {
                id: fingerprint_parts(&[&unit.id, &text]),
                unit_id: unit.id.clone(),
                text,
                embedding,
                created_at: Utc::now(),
            }),
            Err(e) => {
                warn!("No chunk for {}: {}", unit.id, e);
                failed.push(format!("{}: {}", unit.qualified_name, e));
            }
        }
    }

    let failure = (!failed.is_empty()).then(|| FileFailure {
        path: path.to_string(),
        stage: Stage::Embed,
        reason: format!(
            "{} of {} units missing a chunk ({})",
            failed.len(),
            units.len(),
            failed.join("; ")
        ),
    });
    (chunks, failure)
}
