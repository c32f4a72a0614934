//! Stage 4: resolve call sites to code units and rebuild call edges.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::scan::ScannedFile;
use super::{apply_with_retry, IngestContext};
use crate::error::{Result, SyncError};
use crate::extractor::CallSite;
use crate::fingerprint::fingerprint;
use crate::graph::{CodeUnit, WriteBatch, WriteOp};

/// Pick the unit a call to `name` from `caller_path` refers to.
///
/// A single candidate wins. Otherwise candidates in the caller's own file
/// win, the first defined one if several. Anything else is ambiguous.
pub fn resolve_callee<'a>(caller_path: &str, candidates: &'a [CodeUnit]) -> Option<&'a CodeUnit> {
    match candidates {
        [] => None,
        [only] => Some(only),
        _ => candidates
            .iter()
            .filter(|unit| unit.path == caller_path)
            .min_by_key(|unit| unit.span.start_byte),
    }
}

/// Result of rebuilding one file's call edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOutcome {
    /// Fingerprint of the content the calls were read from
    pub fingerprint: String,
    pub resolved: usize,
    pub unresolved: usize,
    pub edges_written: usize,
}

/// Re-read `file`, resolve its call sites against the graph and replace the
/// call edges leaving its units.
pub async fn link_calls(ctx: &IngestContext, file: &ScannedFile) -> Result<CallOutcome> {
    let bytes = tokio::fs::read(&file.absolute).await?;
    let content_fingerprint = fingerprint(&bytes);
    let source = String::from_utf8_lossy(&bytes).into_owned();

    let extractor = ctx.extractor.clone();
    let language = file.language.clone();
    let extraction = tokio::task::spawn_blocking(move || extractor.extract(&source, &language))
        .await
        .map_err(|e| SyncError::ParseFailure {
            path: file.path.clone(),
            reason: e.to_string(),
        })??;

    let units = ctx.store.units_in_file(&file.path).await?;
    let by_qualified: HashMap<&str, &CodeUnit> = units
        .iter()
        .map(|unit| (unit.qualified_name.as_str(), unit))
        .collect();

    let mut candidates: HashMap<String, Vec<CodeUnit>> = HashMap::new();
    let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
    let mut outcome = CallOutcome {
        fingerprint: content_fingerprint,
        ..Default::default()
    };

    for call in &extraction.calls {
        let Some(caller) = caller_unit(call, &by_qualified) else {
            continue;
        };
        if !candidates.contains_key(&call.name) {
            let found = ctx.store.units_named(&call.name).await?;
            candidates.insert(call.name.clone(), found);
        }
        let named = candidates
            .get(&call.name)
            .map(Vec::as_slice)
            .unwrap_or_default();
        match resolve_callee(&file.path, named) {
            Some(callee) if callee.id == caller.id => {}
            Some(callee) => {
                outcome.resolved += 1;
                edges.insert((caller.id.clone(), callee.id.clone()));
            }
            None => {
                debug!(
                    "Unresolved call {} in {} ({} candidates)",
                    call.callee,
                    caller.id,
                    named.len()
                );
                outcome.unresolved += 1;
            }
        }
    }

    let batch = WriteBatch::from(vec![WriteOp::ReplaceFileCalls {
        path: file.path.clone(),
        calls: edges.into_iter().collect(),
    }]);
    let summary = apply_with_retry(ctx.store.as_ref(), batch).await?;
    outcome.edges_written = summary.edges_written;
    Ok(outcome)
}

fn caller_unit<'a>(
    call: &CallSite,
    by_qualified: &HashMap<&str, &'a CodeUnit>,
) -> Option<&'a CodeUnit> {
    let caller = call.caller.as_deref()?;
    by_qualified.get(caller).copied()
}
