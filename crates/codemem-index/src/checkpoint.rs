//! Checkpoint store for tracking the last processed state.
//!
//! Checkpoints make synchronization incremental: a file whose fingerprint
//! matches its checkpoint is skipped, and history sync resumes from the
//! last recorded revision. A checkpoint is only ever advanced after the
//! graph writes it describes have been committed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Checkpoint file name inside the data directory.
pub const CHECKPOINT_FILE: &str = "checkpoints.json";

const CHECKPOINT_VERSION: u32 = 1;

/// What a checkpoint records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckpointKey {
    /// Fingerprint a file's entities were last ingested at
    File(String),
    /// Fingerprint a file's call edges were last built at
    CallGraph(String),
    /// Last synchronized revision of a repository
    Revision(String),
}

/// Persisted checkpoint state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Checkpoints {
    version: u32,
    #[serde(default)]
    files: BTreeMap<String, String>,
    #[serde(default)]
    call_graph: BTreeMap<String, String>,
    #[serde(default)]
    revisions: BTreeMap<String, String>,
}

impl Checkpoints {
    fn new() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            ..Default::default()
        }
    }

    fn get(&self, key: &CheckpointKey) -> Option<&String> {
        match key {
            CheckpointKey::File(path) => self.files.get(path),
            CheckpointKey::CallGraph(path) => self.call_graph.get(path),
            CheckpointKey::Revision(repo) => self.revisions.get(repo),
        }
    }

    fn set(&mut self, key: CheckpointKey, value: Option<String>) {
        let (table, id) = match key {
            CheckpointKey::File(path) => (&mut self.files, path),
            CheckpointKey::CallGraph(path) => (&mut self.call_graph, path),
            CheckpointKey::Revision(repo) => (&mut self.revisions, repo),
        };
        match value {
            Some(value) => {
                table.insert(id, value);
            }
            None => {
                table.remove(&id);
            }
        }
    }
}

/// Durable key-value record of processed state.
pub struct CheckpointStore {
    state: RwLock<Checkpoints>,
    path: Option<PathBuf>,
}

impl CheckpointStore {
    /// A store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Checkpoints::new()),
            path: None,
        }
    }

    /// Load checkpoints from `path`, or start empty if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(CheckpointError::Io)?;
            let state: Checkpoints =
                serde_json::from_str(&content).map_err(CheckpointError::Parse)?;
            if state.version != CHECKPOINT_VERSION {
                return Err(CheckpointError::Version(state.version));
            }
            debug!(
                "Loaded {} file checkpoints from {}",
                state.files.len(),
                path.display()
            );
            state
        } else {
            Checkpoints::new()
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, key: &CheckpointKey) -> Option<String> {
        self.state.read().await.get(key).cloned()
    }

    /// Set (`Some`) or clear (`None`) one checkpoint.
    pub async fn set(
        &self,
        key: CheckpointKey,
        value: Option<String>,
    ) -> Result<(), CheckpointError> {
        self.set_batch(vec![(key, value)]).await
    }

    /// Apply all updates or none.
    ///
    /// The updates are applied to a copy which is persisted before it
    /// replaces the live state, so a failed write leaves both disk and
    /// memory unchanged.
    pub async fn set_batch(
        &self,
        updates: Vec<(CheckpointKey, Option<String>)>,
    ) -> Result<(), CheckpointError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let mut next = state.clone();
        for (key, value) in updates {
            next.set(key, value);
        }
        if next == *state {
            return Ok(());
        }
        if let Some(path) = &self.path {
            persist(path, &next).await?;
        }
        *state = next;
        Ok(())
    }

    /// Paths with a file checkpoint, sorted.
    pub async fn tracked_files(&self) -> Vec<String> {
        self.state.read().await.files.keys().cloned().collect()
    }

    /// All call-graph checkpoints by path.
    pub async fn call_graph_checkpoints(&self) -> BTreeMap<String, String> {
        self.state.read().await.call_graph.clone()
    }
}

async fn persist(path: &Path, state: &Checkpoints) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(CheckpointError::Io)?;
    }
    let content = serde_json::to_string_pretty(state).map_err(CheckpointError::Serialize)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(CheckpointError::Io)?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(CheckpointError::Io)
}

/// Errors that can occur when reading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse checkpoints: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize checkpoints: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unsupported checkpoint version {0}")]
    Version(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_and_set() {
        let store = CheckpointStore::in_memory();
        let key = CheckpointKey::File("src/lib.rs".to_string());

        assert_eq!(store.get(&key).await, None);
        store.set(key.clone(), Some("hash1".to_string())).await.unwrap();
        assert_eq!(store.get(&key).await.as_deref(), Some("hash1"));

        store.set(key.clone(), None).await.unwrap();
        assert_eq!(store.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_key_kinds_are_separate() {
        let store = CheckpointStore::in_memory();
        store
            .set_batch(vec![
                (CheckpointKey::File("a.py".into()), Some("f".into())),
                (CheckpointKey::CallGraph("a.py".into()), Some("c".into())),
                (CheckpointKey::Revision("repo".into()), Some("abc".into())),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.get(&CheckpointKey::File("a.py".into())).await.as_deref(),
            Some("f")
        );
        assert_eq!(
            store.get(&CheckpointKey::CallGraph("a.py".into())).await.as_deref(),
            Some("c")
        );
        assert_eq!(store.tracked_files().await, vec!["a.py".to_string()]);
        assert_eq!(store.call_graph_checkpoints().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        {
            let store = CheckpointStore::open(&path).unwrap();
            store
                .set(CheckpointKey::Revision("repo".into()), Some("c3".into()))
                .await
                .unwrap();
            store
                .set(CheckpointKey::File("b.py".into()), Some("h".into()))
                .await
                .unwrap();
        }

        let reopened = CheckpointStore::open(&path).unwrap();
        assert_eq!(
            reopened
                .get(&CheckpointKey::Revision("repo".into()))
                .await
                .as_deref(),
            Some("c3")
        );
        assert_eq!(reopened.tracked_files().await, vec!["b.py".to_string()]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        // a regular file where the parent directory should be
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "").unwrap();
        let path = blocker.join(CHECKPOINT_FILE);
        let store = CheckpointStore::open(&path).unwrap();

        let key = CheckpointKey::File("a.py".into());
        assert!(store.set(key.clone(), Some("h".into())).await.is_err());
        assert_eq!(store.get(&key).await, None);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            CheckpointStore::open(&path),
            Err(CheckpointError::Parse(_))
        ));
    }
}
