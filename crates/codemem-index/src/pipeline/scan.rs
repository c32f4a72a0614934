//! Stage 1: walk the repository and diff it against the checkpoints.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use super::{FileFailure, IngestSettings, Stage};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::error::{Result, SyncError};
use crate::extractor::SyntaxExtractor;
use crate::fingerprint::fingerprint;

/// A supported file found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    /// Repository-relative path with `/` separators
    pub path: String,
    pub absolute: PathBuf,
    pub language: String,
    pub fingerprint: String,
}

/// What a walk found on disk.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub files: Vec<ScannedFile>,
    /// Supported files that exist but could not be read
    pub unreadable: Vec<FileFailure>,
}

/// Stage 1 output.
#[derive(Debug, Clone, Default)]
pub struct Worklist {
    pub new: Vec<ScannedFile>,
    pub changed: Vec<ScannedFile>,
    pub unchanged: Vec<ScannedFile>,
    /// Known to the checkpoints or the graph but gone from disk
    pub deleted: Vec<String>,
    /// On disk but unreadable; their graph contents are left as they were
    pub unreadable: Vec<FileFailure>,
}

impl Worklist {
    /// Files stage 2 must (re)ingest, new first.
    pub fn to_ingest(&self) -> impl Iterator<Item = &ScannedFile> {
        self.new.iter().chain(self.changed.iter())
    }

    /// Every supported file currently on disk.
    pub fn on_disk(&self) -> impl Iterator<Item = &ScannedFile> {
        self.new
            .iter()
            .chain(self.changed.iter())
            .chain(self.unchanged.iter())
    }

    pub fn scanned(&self) -> usize {
        self.new.len() + self.changed.len() + self.unchanged.len()
    }
}

/// Repository-relative form of `absolute`, or `None` outside `root`.
pub fn relative_path(root: &Path, absolute: &Path) -> Option<String> {
    let relative = absolute.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// The rules deciding which repository paths belong in the graph.
///
/// The full walk and single-file events both go through it, so a path the
/// walk would skip never enters the graph through an event either.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    root: PathBuf,
    extensions: Vec<String>,
    ignore_dirs: Vec<String>,
    overrides: Override,
    /// Root `.gitignore`, `.git/info/exclude` and the global excludes
    gitignore: Vec<Gitignore>,
    respect_gitignore: bool,
}

impl ScanFilter {
    pub fn new(settings: &IngestSettings) -> Result<Self> {
        let root = &settings.root;
        let mut overrides = OverrideBuilder::new(root);
        for pattern in &settings.ignore_patterns {
            overrides
                .add(&format!("!{}", pattern))
                .map_err(|e| invalid_pattern(pattern, e))?;
        }
        let overrides = overrides
            .build()
            .map_err(|e| invalid_pattern("<overrides>", e))?;

        let mut gitignore = Vec::new();
        if settings.respect_gitignore {
            let mut builder = GitignoreBuilder::new(root);
            for file in [root.join(".gitignore"), root.join(".git/info/exclude")] {
                if file.is_file() {
                    if let Some(e) = builder.add(&file) {
                        warn!("Skipping rules in {}: {}", file.display(), e);
                    }
                }
            }
            gitignore.push(
                builder
                    .build()
                    .map_err(|e| invalid_pattern(".gitignore", e))?,
            );
            let (global, error) = Gitignore::global();
            if let Some(e) = error {
                debug!("Global gitignore: {}", e);
            }
            gitignore.push(global);
        }

        Ok(Self {
            root: root.clone(),
            extensions: settings.extensions.clone(),
            ignore_dirs: settings.ignore_dirs.clone(),
            overrides,
            gitignore,
            respect_gitignore: settings.respect_gitignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extension allow-list, hidden and ignored directories, and ignore
    /// patterns. Gitignore rules are left to the caller.
    pub fn admits(&self, extractor: &SyntaxExtractor, path: &str) -> bool {
        let rel = Path::new(path);
        let Some(ext) = rel.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        if !self.extensions.iter().any(|allowed| allowed == ext) {
            return false;
        }
        if extractor.detect_language(rel).is_none() {
            return false;
        }

        let parts: Vec<&str> = path.split('/').collect();
        if parts.iter().any(|part| part.starts_with('.')) {
            return false;
        }
        let dirs = &parts[..parts.len().saturating_sub(1)];
        if dirs
            .iter()
            .any(|dir| self.ignore_dirs.iter().any(|ignored| ignored == dir))
        {
            return false;
        }

        if self.overrides.matched(rel, false).is_ignore() {
            return false;
        }
        // a pattern naming a directory excludes everything below it
        (1..parts.len()).all(|len| {
            !self
                .overrides
                .matched(parts[..len].join("/"), true)
                .is_ignore()
        })
    }

    /// Whether a scan would pick up `path` (repository-relative).
    ///
    /// Reads the `.gitignore` of every directory between the root and the
    /// file, so prefer [`ScanFilter::admits`] inside a walk that already
    /// applies them.
    pub fn accepts(&self, extractor: &SyntaxExtractor, path: &str) -> bool {
        self.admits(extractor, path) && !self.is_gitignored(path)
    }

    fn is_gitignored(&self, path: &str) -> bool {
        if !self.respect_gitignore {
            return false;
        }
        let rel = Path::new(path);
        if self
            .gitignore
            .iter()
            .any(|rules| rules.matched_path_or_any_parents(rel, false).is_ignore())
        {
            return true;
        }

        let parts: Vec<&str> = path.split('/').collect();
        for depth in 1..parts.len() {
            let dir = self.root.join(parts[..depth].join("/"));
            let file = dir.join(".gitignore");
            if !file.is_file() {
                continue;
            }
            let mut builder = GitignoreBuilder::new(&dir);
            if let Some(e) = builder.add(&file) {
                warn!("Skipping rules in {}: {}", file.display(), e);
            }
            let Ok(rules) = builder.build() else {
                continue;
            };
            let below = parts[depth..].join("/");
            if rules
                .matched_path_or_any_parents(Path::new(&below), false)
                .is_ignore()
            {
                return true;
            }
        }
        false
    }
}

/// Collect supported files under the root, sorted by path.
///
/// Reads every file to fingerprint it; run on a blocking thread.
pub fn collect_files(settings: &IngestSettings, extractor: &SyntaxExtractor) -> Result<Collected> {
    let root = &settings.root;
    let filter = ScanFilter::new(settings)?;
    let ignore_dirs = settings.ignore_dirs.clone();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(settings.respect_gitignore)
        .git_global(settings.respect_gitignore)
        .git_exclude(settings.respect_gitignore)
        .require_git(false)
        .overrides(filter.overrides.clone())
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
            !(is_dir
                && entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| ignore_dirs.iter().any(|d| d == name)))
        })
        .build();

    let mut collected = Collected::default();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }
        let absolute = entry.path();
        let Some(path) = relative_path(root, absolute) else {
            continue;
        };
        if !filter.admits(extractor, &path) {
            continue;
        }
        let Some(language) = extractor.detect_language(absolute) else {
            continue;
        };
        let bytes = match std::fs::read(absolute) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read {}: {}", path, e);
                collected.unreadable.push(FileFailure {
                    path,
                    stage: Stage::Read,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        collected.files.push(ScannedFile {
            path,
            absolute: absolute.to_path_buf(),
            language: language.to_string(),
            fingerprint: fingerprint(&bytes),
        });
    }

    collected.files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(
        "Collected {} files under {} ({} unreadable)",
        collected.files.len(),
        root.display(),
        collected.unreadable.len()
    );
    Ok(collected)
}

fn invalid_pattern(pattern: &str, e: ignore::Error) -> SyncError {
    SyncError::Config(codemem_config::ConfigError::Invalid(format!(
        "ignore pattern {}: {}",
        pattern, e
    )))
}

/// Classify scanned files against their checkpoints.
///
/// `known` is every path the graph or checkpoints know about; those
/// neither scanned nor unreadable are deleted.
pub async fn detect_changes(
    collected: Collected,
    checkpoints: &CheckpointStore,
    known: BTreeSet<String>,
) -> Worklist {
    let mut worklist = Worklist::default();
    let on_disk: BTreeSet<String> = collected
        .files
        .iter()
        .map(|f| f.path.clone())
        .chain(collected.unreadable.iter().map(|f| f.path.clone()))
        .collect();

    for file in collected.files {
        match checkpoints
            .get(&CheckpointKey::File(file.path.clone()))
            .await
        {
            None => worklist.new.push(file),
            Some(previous) if previous != file.fingerprint => worklist.changed.push(file),
            Some(_) => worklist.unchanged.push(file),
        }
    }
    worklist.deleted = known.difference(&on_disk).cloned().collect();
    worklist.unreadable = collected.unreadable;
    worklist
}

#[cfg(test)]
mod tests {
    use super::*;
    use codemem_config::IndexingConfig;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn settings(root: &Path) -> IngestSettings {
        IngestSettings::from_config(root, &IndexingConfig::default())
    }

    #[test]
    fn test_relative_path() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_path(root, Path::new("/repo/src/a.py")).as_deref(),
            Some("src/a.py")
        );
        assert_eq!(relative_path(root, Path::new("/other/a.py")), None);
        assert_eq!(relative_path(root, root), None);
    }

    #[test]
    fn test_collect_files_filters() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/app.py", "def main(): pass\n");
        write(root, "src/util.ts", "export function f() {}\n");
        write(root, "README.md", "# readme\n");
        write(root, "node_modules/pkg/index.js", "module.exports = 1;\n");
        write(root, ".codemem/cache.py", "x = 1\n");
        write(root, "build/gen.py", "x = 1\n");
        write(root, "src/generated.py", "x = 1\n");
        write(root, ".gitignore", "generated.py\n");

        let extractor = SyntaxExtractor::with_defaults();
        let files = collect_files(&settings(root), &extractor).unwrap().files;
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/app.py", "src/util.ts"]);
        assert_eq!(files[0].language, "python");
        assert_eq!(files[1].language, "typescript");
        assert_eq!(files[0].fingerprint, fingerprint(b"def main(): pass\n"));
    }

    #[test]
    fn test_ignore_patterns() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/app.py", "x = 1\n");
        write(root, "src/app_test.py", "x = 1\n");

        let mut settings = settings(root);
        settings.ignore_patterns = vec!["*_test.py".to_string()];
        let files = collect_files(&settings, &SyntaxExtractor::with_defaults())
            .unwrap()
            .files;
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/app.py"]);
    }

    #[test]
    fn test_filter_admits() {
        let mut settings = settings(Path::new("/repo"));
        settings.ignore_patterns = vec!["*_test.py".to_string(), "gen".to_string()];
        let filter = ScanFilter::new(&settings).unwrap();
        let extractor = SyntaxExtractor::with_defaults();
        assert!(filter.admits(&extractor, "src/a.py"));
        assert!(!filter.admits(&extractor, "src/a.txt"));
        assert!(!filter.admits(&extractor, "node_modules/a.js"));
        assert!(!filter.admits(&extractor, ".codemem/a.py"));
        assert!(!filter.admits(&extractor, "src/a_test.py"));
        assert!(!filter.admits(&extractor, "src/gen/a.py"));
        // pyi is supported by the grammar but not in the allow-list
        assert!(!filter.admits(&extractor, "src/a.pyi"));
    }

    #[test]
    fn test_filter_accepts_honors_gitignore() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, ".gitignore", "generated.py\nvendor/\n");
        write(root, "src/.gitignore", "local_*.py\n");

        let filter = ScanFilter::new(&settings(root)).unwrap();
        let extractor = SyntaxExtractor::with_defaults();
        assert!(filter.accepts(&extractor, "src/app.py"));
        assert!(!filter.accepts(&extractor, "src/generated.py"));
        assert!(!filter.accepts(&extractor, "vendor/lib.py"));
        assert!(!filter.accepts(&extractor, "src/local_settings.py"));
        assert!(filter.accepts(&extractor, "local_settings.py"));

        let mut settings = settings(root);
        settings.respect_gitignore = false;
        let filter = ScanFilter::new(&settings).unwrap();
        assert!(filter.accepts(&extractor, "src/generated.py"));
    }

    #[test]
    fn test_invalid_ignore_pattern_is_a_config_error() {
        let mut settings = settings(Path::new("/repo"));
        settings.ignore_patterns = vec!["src/[".to_string()];
        assert!(matches!(
            ScanFilter::new(&settings),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_detect_changes() {
        let checkpoints = CheckpointStore::in_memory();
        checkpoints
            .set_batch(vec![
                (CheckpointKey::File("same.py".into()), Some("h1".into())),
                (CheckpointKey::File("edit.py".into()), Some("old".into())),
                (CheckpointKey::File("gone.py".into()), Some("h3".into())),
            ])
            .await
            .unwrap();

        let scanned = |path: &str, fp: &str| ScannedFile {
            path: path.to_string(),
            absolute: PathBuf::from(path),
            language: "python".to_string(),
            fingerprint: fp.to_string(),
        };
        let files = vec![
            scanned("edit.py", "new"),
            scanned("fresh.py", "h4"),
            scanned("same.py", "h1"),
        ];
        let mut known: BTreeSet<String> = checkpoints.tracked_files().await.into_iter().collect();
        known.insert("graph_only.py".to_string());

        let collected = Collected {
            files,
            unreadable: Vec::new(),
        };
        let worklist = detect_changes(collected, &checkpoints, known).await;
        assert_eq!(worklist.new.len(), 1);
        assert_eq!(worklist.new[0].path, "fresh.py");
        assert_eq!(worklist.changed[0].path, "edit.py");
        assert_eq!(worklist.unchanged[0].path, "same.py");
        assert_eq!(worklist.deleted, vec!["gone.py", "graph_only.py"]);
        assert_eq!(worklist.scanned(), 3);
        assert_eq!(worklist.to_ingest().count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_not_deleted() {
        let checkpoints = CheckpointStore::in_memory();
        checkpoints
            .set_batch(vec![
                (CheckpointKey::File("locked.py".into()), Some("h1".into())),
                (CheckpointKey::File("gone.py".into()), Some("h2".into())),
            ])
            .await
            .unwrap();
        let known: BTreeSet<String> = checkpoints.tracked_files().await.into_iter().collect();

        let collected = Collected {
            files: Vec::new(),
            unreadable: vec![FileFailure {
                path: "locked.py".to_string(),
                stage: Stage::Read,
                reason: "permission denied".to_string(),
            }],
        };
        let worklist = detect_changes(collected, &checkpoints, known).await;
        assert_eq!(worklist.deleted, vec!["gone.py"]);
        assert_eq!(worklist.unreadable.len(), 1);
        assert_eq!(worklist.unreadable[0].path, "locked.py");
        assert_eq!(worklist.scanned(), 0);
    }
}
