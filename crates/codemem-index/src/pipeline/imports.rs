//! Stage 3: resolve import references to repository files.

use std::collections::BTreeSet;

use tracing::debug;

use super::{apply_with_retry, IngestContext};
use crate::error::Result;
use crate::graph::{WriteBatch, WriteOp};

/// Index of the repository's files for import resolution.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    /// (path, module stem), sorted by path
    entries: Vec<(String, String)>,
}

impl FileIndex {
    pub fn new(paths: impl IntoIterator<Item = String>) -> Self {
        let mut entries: Vec<(String, String)> = paths
            .into_iter()
            .map(|path| {
                let stem = module_stem(&path);
                (path, stem)
            })
            .collect();
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries
            .binary_search_by(|(p, _)| p.as_str().cmp(path))
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, s)| (p.as_str(), s.as_str()))
    }
}

/// Maps an import reference to the file it names.
pub trait ImportResolver: Send + Sync {
    /// Repository path `target` refers to when imported from `importer`.
    fn resolve(&self, importer: &str, target: &str, files: &FileIndex) -> Option<String>;
}

/// Resolves relative imports against the importer's directory and module
/// paths (`a.b`, `a::b`, `a/b`) by matching path suffixes.
///
/// Among several matches the shortest path wins, then the lexicographically
/// smallest.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathSuffixResolver;

impl ImportResolver for PathSuffixResolver {
    fn resolve(&self, importer: &str, target: &str, files: &FileIndex) -> Option<String> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        let resolved = match relative_base(importer, target) {
            Relative::Path(base) => resolve_relative(&base, files),
            Relative::NotRelative => resolve_module(target, files),
            Relative::Escapes => None,
        };
        resolved.filter(|path| path != importer)
    }
}

enum Relative {
    /// Segments of the referenced module, relative to the repository root
    Path(Vec<String>),
    NotRelative,
    /// Points above the repository root
    Escapes,
}

fn relative_base(importer: &str, target: &str) -> Relative {
    let mut dir: Vec<String> = importer.split('/').map(str::to_string).collect();
    dir.pop();

    // ./x, ../x
    if target.starts_with("./") || target.starts_with("../") {
        return match normalize(dir, target.split('/')) {
            Some(base) => Relative::Path(base),
            None => Relative::Escapes,
        };
    }

    // self::x, super::x
    if target.starts_with("self::") || target.starts_with("super::") {
        let mut module = dir;
        let file_stem = importer
            .rsplit('/')
            .next()
            .and_then(|f| f.strip_suffix(".rs"))
            .unwrap_or("");
        if !matches!(file_stem, "lib" | "main" | "mod") {
            module.push(file_stem.to_string());
        }
        let mut segments = target.split("::").peekable();
        while let Some(&head) = segments.peek() {
            match head {
                "self" => {}
                "super" => {
                    if module.pop().is_none() {
                        return Relative::Escapes;
                    }
                }
                _ => break,
            }
            segments.next();
        }
        module.extend(segments.map(str::to_string));
        return Relative::Path(module);
    }

    // .x, ..x.y
    if target.starts_with('.') {
        let dots = target.chars().take_while(|c| *c == '.').count();
        let rest = &target[dots..];
        let mut base = dir;
        for _ in 1..dots {
            if base.pop().is_none() {
                return Relative::Escapes;
            }
        }
        base.extend(
            rest.split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        return Relative::Path(base);
    }

    Relative::NotRelative
}

fn normalize<'a>(mut base: Vec<String>, parts: impl Iterator<Item = &'a str>) -> Option<Vec<String>> {
    for part in parts {
        match part {
            "" | "." => {}
            ".." => {
                base.pop()?;
            }
            other => base.push(other.to_string()),
        }
    }
    Some(base)
}

/// Path without extension and without a trailing package marker
/// (`__init__`, `mod`, `index`).
fn module_stem(path: &str) -> String {
    let without_ext = match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => &path[..dot],
        _ => path,
    };
    for marker in ["/__init__", "/mod", "/index"] {
        if let Some(stripped) = without_ext.strip_suffix(marker) {
            return stripped.to_string();
        }
    }
    without_ext.to_string()
}

fn pick<'a>(candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    candidates
        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .map(str::to_string)
}

fn resolve_relative(base: &[String], files: &FileIndex) -> Option<String> {
    // trailing segments may name an item inside the module
    for len in (1..=base.len()).rev() {
        let key = base[..len].join("/");
        if files.contains(&key) {
            return Some(key);
        }
        let found = pick(
            files
                .iter()
                .filter(|(_, stem)| *stem == key)
                .map(|(path, _)| path),
        );
        if found.is_some() {
            return found;
        }
    }
    None
}

fn segments(target: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = target
        .split(|c| c == '.' || c == '/' || c == ':' || c == '\\')
        .filter(|s| !s.is_empty() && *s != "@")
        .collect();
    if parts.first() == Some(&"crate") {
        parts.remove(0);
    }
    parts
}

fn ends_with_segments(stem: &str, key: &str) -> bool {
    stem == key || stem.ends_with(&format!("/{}", key))
}

fn contains_segments(stem: &str, key: &str) -> bool {
    let padded = format!("/{}/", stem);
    padded.contains(&format!("/{}/", key))
}

fn resolve_module(target: &str, files: &FileIndex) -> Option<String> {
    let parts = segments(target);
    if parts.is_empty() {
        return None;
    }

    // keep the leading segment, drop trailing ones
    for len in (1..=parts.len()).rev() {
        let key = parts[..len].join("/");
        let found = pick(
            files
                .iter()
                .filter(|(_, stem)| ends_with_segments(stem, &key))
                .map(|(path, _)| path),
        );
        if found.is_some() {
            return found;
        }
    }

    // segment-aligned substring, dropping leading segments (package hosts)
    for start in 0..parts.len() {
        let key = parts[start..].join("/");
        let found = pick(
            files
                .iter()
                .filter(|(_, stem)| contains_segments(stem, &key))
                .map(|(path, _)| path),
        );
        if found.is_some() {
            return found;
        }
    }
    None
}

/// Result of linking one file's imports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportOutcome {
    pub resolved: usize,
    pub unresolved: usize,
    pub edges_written: usize,
}

/// Resolve `targets` and replace the file's import edges.
pub async fn link_imports(
    ctx: &IngestContext,
    path: &str,
    targets: &[String],
    files: &FileIndex,
) -> Result<ImportOutcome> {
    let mut resolved = BTreeSet::new();
    let mut outcome = ImportOutcome::default();
    for target in targets {
        match ctx.resolver.resolve(path, target, files) {
            Some(file) => {
                outcome.resolved += 1;
                resolved.insert(file);
            }
            None => {
                debug!("Unresolved import {} in {}", target, path);
                outcome.unresolved += 1;
            }
        }
    }

    let batch = WriteBatch::from(vec![WriteOp::ReplaceImports {
        path: path.to_string(),
        targets: resolved.into_iter().collect(),
    }]);
    let summary = apply_with_retry(ctx.store.as_ref(), batch).await?;
    outcome.edges_written = summary.edges_written;
    Ok(outcome)
}
