//! Errors surfaced by synchronization and retrieval.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::embeddings::EmbeddingError;
use crate::extractor::ExtractError;
use crate::graph::StoreError;

/// Result alias for engine operations.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// An external dependency kept failing after every retry.
    #[error("External dependency unavailable: {0}")]
    TransientExternal(String),

    #[error("Could not extract {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    /// The checkpointed revision is no longer an ancestor of head; only a
    /// full reconciliation can continue.
    #[error("History diverged: checkpoint {checkpoint} is not an ancestor of {head}")]
    HistoryDivergence { checkpoint: String, head: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Graph store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Version control error: {0:#}")]
    Vcs(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] codemem_config::ConfigError),

    #[error("Watcher error: {0}")]
    Watcher(#[from] crate::sync::WatcherError),
}

impl SyncError {
    /// Whether a retry of the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientExternal(_) | Self::Io(_) => true,
            Self::Store(e) => e.is_transient(),
            Self::Embedding(e) => {
                e.is_transient()
                    || matches!(
                        e,
                        EmbeddingError::Timeout(_) | EmbeddingError::CircuitOpen { .. }
                    )
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::TransientExternal("graph".into()).is_transient());
        assert!(SyncError::Embedding(EmbeddingError::Transient("503".into())).is_transient());
        assert!(!SyncError::Embedding(EmbeddingError::Permanent("400".into())).is_transient());
        assert!(SyncError::Embedding(EmbeddingError::CircuitOpen {
            retry_in: std::time::Duration::from_secs(5)
        })
        .is_transient());
        assert!(!SyncError::HistoryDivergence {
            checkpoint: "a".into(),
            head: "b".into()
        }
        .is_transient());
    }

    #[test]
    fn test_divergence_message() {
        let err = SyncError::HistoryDivergence {
            checkpoint: "abc".into(),
            head: "def".into(),
        };
        assert_eq!(
            err.to_string(),
            "History diverged: checkpoint abc is not an ancestor of def"
        );
    }
}
