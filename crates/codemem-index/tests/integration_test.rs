//! End-to-end tests for the synchronization engine.
//!
//! Each test builds an engine over a temporary repository with an in-memory
//! graph, a deterministic keyword embedding provider and a scripted history.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use codemem_config::Config;
use codemem_index::embeddings::EmbeddingError;
use codemem_index::graph::{ChangeKind, Direction, EdgeKind, NodeKey};
use codemem_index::history::{CommitRecord, FileChange};
use codemem_index::{
    EmbeddingProvider, FileEvent, HistorySyncMode, ImpactEntry, KnowledgeGraphEngine, SyncError,
    VcsSource,
};

const VOCABULARY: [&str; 8] = [
    "parse", "token", "network", "socket", "storage", "disk", "render", "pixel",
];

/// Counts vocabulary words, so texts sharing words are similar.
struct KeywordEmbeddings;

#[async_trait]
impl EmbeddingProvider for KeywordEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; VOCABULARY.len()];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            if let Some(i) = VOCABULARY.iter().position(|v| *v == word) {
                vector[i] += 1.0;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        VOCABULARY.len()
    }

    fn model_name(&self) -> &str {
        "keywords"
    }
}

/// Fixed commit list; the last entry is head.
struct ScriptedVcs {
    commits: Vec<CommitRecord>,
    head: Option<String>,
}

#[async_trait]
impl VcsSource for ScriptedVcs {
    async fn head(&self) -> anyhow::Result<Option<String>> {
        Ok(self.head.clone())
    }

    async fn contains_revision(&self, revision: &str) -> anyhow::Result<bool> {
        Ok(self.commits.iter().any(|c| c.revision == revision))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> anyhow::Result<bool> {
        let mut stack = vec![descendant.to_string()];
        let mut seen = HashSet::new();
        while let Some(rev) = stack.pop() {
            if rev == ancestor {
                return Ok(true);
            }
            if !seen.insert(rev.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.iter().find(|c| c.revision == rev) {
                stack.extend(commit.parents.iter().cloned());
            }
        }
        Ok(false)
    }

    async fn commits_since(
        &self,
        _since: Option<&str>,
        _head: &str,
    ) -> anyhow::Result<Vec<CommitRecord>> {
        Ok(self.commits.clone())
    }
}

fn commit(revision: &str, parents: &[&str], minute: u32, paths: &[&str]) -> CommitRecord {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap();
    CommitRecord {
        revision: revision.to_string(),
        parents: parents.iter().map(|p| p.to_string()).collect(),
        author_name: "Ada".to_string(),
        author_email: "ada@example.com".to_string(),
        authored_at: at,
        committed_at: at,
        subject: format!("change {}", revision),
        body: String::new(),
        changes: paths
            .iter()
            .map(|path| FileChange {
                path: path.to_string(),
                previous_path: None,
                change: ChangeKind::Modified,
                additions: 2,
                deletions: 1,
            })
            .collect(),
    }
}

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(full, content).unwrap();
}

fn config() -> Config {
    let mut config = Config::default();
    config.graph.persist = false;
    config.embedding.dimensions = VOCABULARY.len();
    config.watch.debounce_ms = 20;
    config
}

fn engine_with(dir: &TempDir, vcs: ScriptedVcs) -> KnowledgeGraphEngine {
    engine_configured(dir, config(), vcs)
}

fn engine_configured(dir: &TempDir, config: Config, vcs: ScriptedVcs) -> KnowledgeGraphEngine {
    KnowledgeGraphEngine::builder(dir.path())
        .with_config(config)
        .with_embedding_provider(Arc::new(KeywordEmbeddings))
        .with_vcs(Arc::new(vcs))
        .build()
        .unwrap()
}

fn no_history() -> ScriptedVcs {
    ScriptedVcs {
        commits: Vec::new(),
        head: None,
    }
}

async fn callees_of(engine: &KnowledgeGraphEngine, unit: &str) -> Vec<NodeKey> {
    engine
        .store()
        .neighbors(
            &NodeKey::Unit(unit.to_string()),
            EdgeKind::Calls,
            Direction::Outgoing,
        )
        .await
        .unwrap()
}

fn engine(dir: &TempDir) -> KnowledgeGraphEngine {
    engine_with(dir, no_history())
}

/// a imports b, b imports c, c imports d; main calls helper across files.
fn chain_repo() -> TempDir {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "a.py",
        "import b\n\ndef main():\n    \"\"\"render pixel\"\"\"\n    return helper()\n",
    );
    write(
        dir.path(),
        "b.py",
        "import c\n\ndef helper():\n    \"\"\"parse token parse\"\"\"\n    return 1\n",
    );
    write(
        dir.path(),
        "c.py",
        "import d\n\ndef connect():\n    \"\"\"network socket\"\"\"\n    return 2\n",
    );
    write(
        dir.path(),
        "d.py",
        "def save():\n    \"\"\"storage disk\"\"\"\n    return 3\n",
    );
    dir
}

#[tokio::test]
async fn test_full_sync_builds_graph() {
    let dir = chain_repo();
    let engine = engine(&dir);

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_scanned, 4);
    assert_eq!(report.files_new, 4);
    assert_eq!(report.units_written, 4);
    assert_eq!(report.chunks_embedded, 4);
    assert_eq!(report.import_edges_written, 3);
    assert!(report.failures.is_empty());

    let deps = engine.dependencies("b.py").await.unwrap().unwrap();
    assert_eq!(deps.imports, vec!["c.py".to_string()]);
    assert_eq!(deps.imported_by, vec!["a.py".to_string()]);

    let callees = engine
        .store()
        .neighbors(
            &NodeKey::Unit("a.py:main".to_string()),
            EdgeKind::Calls,
            Direction::Outgoing,
        )
        .await
        .unwrap();
    assert_eq!(callees, vec![NodeKey::Unit("b.py:helper".to_string())]);

    let status = engine.status().await.unwrap();
    assert_eq!(status.graph.files, 4);
    assert_eq!(status.checkpointed_files, 4);
    assert!(status.graph.last_file_sync.is_some());
}

#[tokio::test]
async fn test_resync_without_changes_is_idempotent() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();
    let before = engine.status().await.unwrap().graph;

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_unchanged, 4);
    assert_eq!(report.files_new + report.files_changed + report.files_deleted, 0);
    assert_eq!(report.units_written, 0);
    assert_eq!(report.embedding_calls, 0);

    let after = engine.status().await.unwrap().graph;
    assert_eq!(before.files, after.files);
    assert_eq!(before.units, after.units);
    assert_eq!(before.chunks, after.chunks);
    assert_eq!(before.edges, after.edges);
}

#[tokio::test]
async fn test_any_byte_change_is_detected() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    write(
        dir.path(),
        "d.py",
        "def save():\n    \"\"\"storage disk\"\"\"\n    return 3\n\n",
    );
    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_changed, 1);
    assert_eq!(report.files_unchanged, 3);
}

#[tokio::test]
async fn test_deleting_a_file_leaves_no_dangling_edges() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    fs::remove_file(dir.path().join("b.py")).unwrap();
    let report = engine.sync_incremental(&FileEvent::deleted("b.py")).await.unwrap();
    assert_eq!(report.files_deleted, 1);

    assert!(engine.dependencies("b.py").await.unwrap().is_none());
    let deps = engine.dependencies("a.py").await.unwrap().unwrap();
    assert!(deps.imports.is_empty());
    let callees = engine
        .store()
        .neighbors(
            &NodeKey::Unit("a.py:main".to_string()),
            EdgeKind::Calls,
            Direction::Outgoing,
        )
        .await
        .unwrap();
    assert!(callees.is_empty());
    assert!(engine
        .checkpoints()
        .get(&codemem_index::CheckpointKey::File("b.py".to_string()))
        .await
        .is_none());

    // the same sweep happens on a full run
    fs::remove_file(dir.path().join("c.py")).unwrap();
    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_deleted, 1);
    assert!(engine.dependencies("c.py").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_definitions_get_distinct_identities() {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "dup.py",
        "def helper():\n    return 1\n\ndef helper():\n    return 2\n",
    );
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    let units = engine.store().units_in_file("dup.py").await.unwrap();
    let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["dup.py:helper", "dup.py:helper#2"]);

    write(
        dir.path(),
        "dup.py",
        "def helper():\n    return 1\n\ndef helper():\n    return 3\n",
    );
    engine
        .sync_incremental(&FileEvent::modified("dup.py"))
        .await
        .unwrap();
    let units = engine.store().units_in_file("dup.py").await.unwrap();
    assert_eq!(units.len(), 2);
    assert!(units[1].source.contains("return 3"));
}

#[tokio::test]
async fn test_impact_is_bounded_by_depth() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    let report = engine.impact("d.py", 2).await.unwrap().unwrap();
    assert_eq!(
        report.affected,
        vec![
            ImpactEntry {
                depth: 1,
                path: "c.py".to_string()
            },
            ImpactEntry {
                depth: 2,
                path: "b.py".to_string()
            },
        ]
    );

    let report = engine.impact("d.py", 10).await.unwrap().unwrap();
    assert_eq!(report.affected.len(), 3);
    assert!(engine.impact("nope.py", 3).await.unwrap().is_none());
}

#[tokio::test]
async fn test_search_ranks_by_similarity() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    let hits = engine.search("parse the token", 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].unit_id, "b.py:helper");
    assert!(hits[0].score >= hits[1].score);

    let hits = engine.search("network socket", 1).await.unwrap();
    assert_eq!(hits[0].path, "c.py");

    assert!(engine.search("parse", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_history_parents_precede_children() {
    let dir = chain_repo();
    // Listed child first; the synchronizer has to reorder.
    let vcs = ScriptedVcs {
        commits: vec![
            commit("c3", &["c2"], 3, &["a.py"]),
            commit("c2", &["c1"], 2, &["b.py", "a.py"]),
            commit("c1", &[], 1, &["a.py"]),
        ],
        head: Some("c3".to_string()),
    };
    let engine = engine_with(&dir, vcs);
    engine.sync_full().await.unwrap();

    let report = engine.sync_history(HistorySyncMode::Full).await.unwrap();
    assert_eq!(report.commits_written, 3);
    assert_eq!(report.checkpoint_after.as_deref(), Some("c3"));

    let repo_id = engine.repo_id().to_string();
    for (child, parent) in [("c3", "c2"), ("c2", "c1")] {
        let parents = engine
            .store()
            .neighbors(
                &NodeKey::commit(&repo_id, child),
                EdgeKind::Parent,
                Direction::Outgoing,
            )
            .await
            .unwrap();
        assert_eq!(parents, vec![NodeKey::commit(&repo_id, parent)]);
    }

    let history = engine.file_history("a.py", 10).await.unwrap().unwrap();
    let revisions: Vec<&str> = history.iter().map(|h| h.revision.as_str()).collect();
    assert_eq!(revisions, vec!["c3", "c2", "c1"]);

    let context = engine.commit_context("c2").await.unwrap().unwrap();
    assert_eq!(context.author.unwrap().email, "ada@example.com");
    let files: Vec<&str> = context.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(files, vec!["a.py", "b.py"]);

    // head already recorded
    let report = engine
        .sync_history(HistorySyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(report.commits_written, 0);
}

#[tokio::test]
async fn test_unknown_checkpoint_is_a_divergence() {
    let dir = chain_repo();
    let vcs = ScriptedVcs {
        commits: vec![commit("c1", &[], 1, &["a.py"])],
        head: Some("c1".to_string()),
    };
    let engine = engine_with(&dir, vcs);
    engine
        .checkpoints()
        .set(
            codemem_index::CheckpointKey::Revision(engine.repo_id().to_string()),
            Some("gone".to_string()),
        )
        .await
        .unwrap();

    let err = engine
        .sync_history(HistorySyncMode::Incremental)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::HistoryDivergence { .. }));

    let report = engine.sync_history(HistorySyncMode::Full).await.unwrap();
    assert_eq!(report.checkpoint_after.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_event_burst_collapses_to_one_sync() {
    let dir = chain_repo();
    let engine = Arc::new(engine(&dir));
    engine.sync_full().await.unwrap();

    write(
        dir.path(),
        "d.py",
        "def save():\n    \"\"\"storage disk pixel\"\"\"\n    return 4\n",
    );
    let (tx, rx) = mpsc::channel(16);
    for _ in 0..5 {
        tx.send(FileEvent::modified("d.py")).await.unwrap();
    }
    drop(tx);

    let stats = engine
        .synchronizer()
        .run(rx, CancellationToken::new())
        .await;
    assert_eq!(stats.received, 5);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.failed, 0);

    let units = engine.store().units_in_file("d.py").await.unwrap();
    assert!(units[0].source.contains("return 4"));
}

#[tokio::test]
async fn test_ignored_files_never_enter_the_graph() {
    let dir = chain_repo();
    write(dir.path(), "node_modules/lib/x.py", "def hidden():\n    pass\n");
    write(dir.path(), "notes.txt", "parse token\n");
    let engine = engine(&dir);

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_scanned, 4);
    let report = engine
        .sync_incremental(&FileEvent::created("notes.txt"))
        .await
        .unwrap();
    assert_eq!(report.files_scanned, 0);
    assert_eq!(engine.status().await.unwrap().graph.files, 4);
}

#[tokio::test]
async fn test_events_honor_ignore_patterns_and_gitignore() {
    let dir = chain_repo();
    write(dir.path(), ".gitignore", "scratch.py\n");
    write(dir.path(), "a_test.py", "def check():\n    return helper()\n");
    let mut config = config();
    config.indexing.ignore_patterns = vec!["*_test.py".to_string()];
    let engine = engine_configured(&dir, config, no_history());

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_scanned, 4);

    write(dir.path(), "scratch.py", "def tmp():\n    pass\n");
    for path in ["a_test.py", "scratch.py"] {
        let report = engine
            .sync_incremental(&FileEvent::created(path))
            .await
            .unwrap();
        assert_eq!(report.files_scanned, 0, "{} should be ignored", path);
    }
    assert_eq!(engine.status().await.unwrap().graph.files, 4);
    assert!(engine.dependencies("a_test.py").await.unwrap().is_none());
}

#[tokio::test]
async fn test_recreated_file_is_imported_again() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();
    let original = fs::read_to_string(dir.path().join("b.py")).unwrap();

    fs::remove_file(dir.path().join("b.py")).unwrap();
    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_deleted, 1);
    assert!(callees_of(&engine, "a.py:main").await.is_empty());

    write(dir.path(), "b.py", &original);
    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_new, 1);
    assert_eq!(report.files_unchanged, 3);

    let deps = engine.dependencies("b.py").await.unwrap().unwrap();
    assert_eq!(deps.imported_by, vec!["a.py".to_string()]);
    assert_eq!(deps.imports, vec!["c.py".to_string()]);
    assert_eq!(
        callees_of(&engine, "a.py:main").await,
        vec![NodeKey::Unit("b.py:helper".to_string())]
    );
}

#[tokio::test]
async fn test_recreated_file_is_imported_again_incrementally() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();
    let original = fs::read_to_string(dir.path().join("b.py")).unwrap();

    fs::remove_file(dir.path().join("b.py")).unwrap();
    engine
        .sync_incremental(&FileEvent::deleted("b.py"))
        .await
        .unwrap();
    write(dir.path(), "b.py", &original);
    let report = engine
        .sync_incremental(&FileEvent::created("b.py"))
        .await
        .unwrap();
    assert_eq!(report.files_new, 1);

    let deps = engine.dependencies("b.py").await.unwrap().unwrap();
    assert_eq!(deps.imported_by, vec!["a.py".to_string()]);

    // call edges follow on the next full run
    engine.sync_full().await.unwrap();
    assert_eq!(
        callees_of(&engine, "a.py:main").await,
        vec![NodeKey::Unit("b.py:helper".to_string())]
    );
}

#[tokio::test]
async fn test_new_definition_links_unchanged_callers() {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "a.py",
        "import z\n\ndef main():\n    return zed()\n",
    );
    let engine = engine(&dir);
    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.unresolved_imports, 1);
    assert_eq!(report.unresolved_calls, 1);
    assert!(callees_of(&engine, "a.py:main").await.is_empty());

    write(dir.path(), "z.py", "def zed():\n    return 1\n");
    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_new, 1);
    assert_eq!(report.files_unchanged, 1);
    assert_eq!(report.unresolved_calls, 0);

    assert_eq!(
        callees_of(&engine, "a.py:main").await,
        vec![NodeKey::Unit("z.py:zed".to_string())]
    );
    let deps = engine.dependencies("z.py").await.unwrap().unwrap();
    assert_eq!(deps.imported_by, vec!["a.py".to_string()]);
}

#[tokio::test]
async fn test_new_definition_from_event_marks_callers_stale() {
    let dir = tempdir().unwrap();
    write(
        dir.path(),
        "a.py",
        "import z\n\ndef main():\n    return zed()\n",
    );
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    write(dir.path(), "z.py", "def zed():\n    return 1\n");
    engine
        .sync_incremental(&FileEvent::created("z.py"))
        .await
        .unwrap();
    assert!(engine
        .checkpoints()
        .get(&codemem_index::CheckpointKey::CallGraph("a.py".to_string()))
        .await
        .is_none());

    let report = engine.sync_full().await.unwrap();
    assert_eq!(report.files_unchanged, 2);
    assert_eq!(
        callees_of(&engine, "a.py:main").await,
        vec![NodeKey::Unit("z.py:zed".to_string())]
    );
}

#[tokio::test]
async fn test_file_info_lists_definitions() {
    let dir = chain_repo();
    let engine = engine(&dir);
    engine.sync_full().await.unwrap();

    let info = engine.file_info("b.py").await.unwrap().unwrap();
    assert_eq!(info.language, "python");
    let functions: Vec<&str> = info
        .functions
        .iter()
        .map(|u| u.qualified_name.as_str())
        .collect();
    assert_eq!(functions, vec!["helper"]);
    assert!(info.classes.is_empty());
    assert_eq!(info.imports, vec!["c.py".to_string()]);
    assert_eq!(info.imported_by, vec!["a.py".to_string()]);
    assert!(engine.file_info("missing.py").await.unwrap().is_none());
}
