//! Configuration for the codemem knowledge graph engine.
//!
//! Settings are layered, later layers overriding earlier ones:
//! - built-in defaults
//! - the user file (`<config dir>/codemem/config.toml`)
//! - the repository file (`<repo>/.codemem/config.toml`)
//! - environment variables (`CODEMEM_<SECTION>__<KEY>`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Per-repository data directory, relative to the repository root.
pub const DATA_DIR: &str = ".codemem";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable consulted when no embedding API key is configured.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Errors raised while loading, validating or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub graph: GraphConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub watch: WatchConfig,
    pub history: HistoryConfig,
    pub retrieval: RetrievalConfig,
}

/// Where the graph and checkpoints live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Data directory; relative paths resolve against the repository root
    pub data_dir: String,
    /// Persist the graph snapshot on commit. Disabled means in-memory only.
    pub persist: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            data_dir: DATA_DIR.to_string(),
            persist: true,
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    /// Falls back to `OPENAI_API_KEY` when unset
    pub api_key: Option<String>,
    pub base_url: String,
    /// Deadline for a single embedding call
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry
    pub backoff_ms: u64,
    /// Maximum in-flight embedding calls
    pub max_concurrency: usize,
    /// Inputs longer than this are truncated before sending
    pub max_chars: usize,
    /// USD per million tokens, used for the usage estimate
    pub price_per_million_tokens: f64,
    /// Consecutive failed requests that stop further calls
    pub breaker_threshold: u32,
    /// How long calls stay stopped before one trial request
    pub breaker_cooldown_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-large".to_string(),
            dimensions: 3072,
            api_key: None,
            base_url: "https://api.openai.com/v1/embeddings".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            backoff_ms: 1000,
            max_concurrency: 8,
            max_chars: 24_000,
            price_per_million_tokens: 0.13,
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// The configured key, or the `OPENAI_API_KEY` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// Repository scanning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// File extensions (without the dot) that are ingested
    pub extensions: Vec<String>,
    /// Directory names skipped anywhere in the tree
    pub ignore_dirs: Vec<String>,
    /// Additional gitignore-style globs to skip
    pub ignore_patterns: Vec<String>,
    pub respect_gitignore: bool,
    /// Files processed concurrently per stage
    pub worker_limit: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: ["py", "js", "jsx", "ts", "tsx", "rs", "go"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_dirs: [
                "node_modules",
                "__pycache__",
                ".git",
                "dist",
                "build",
                ".venv",
                "venv",
                ".pytest_cache",
                ".mypy_cache",
                "target",
                "vendor",
                "bin",
                "obj",
                DATA_DIR,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignore_patterns: Vec::new(),
            respect_gitignore: true,
            worker_limit: 4,
        }
    }
}

/// Filesystem watch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Commit history ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
}

/// Retrieval defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub default_max_depth: usize,
    pub hybrid: HybridWeights,
    /// Churn window used when a hybrid query does not pass one
    pub churn_window_days: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            default_max_depth: 3,
            hybrid: HybridWeights::default(),
            churn_window_days: 90,
        }
    }
}

/// Weights of the hybrid ranking signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub semantic: f64,
    pub structural: f64,
    pub recency: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            semantic: 0.65,
            structural: 0.20,
            recency: 0.15,
        }
    }
}

impl HybridWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [self.semantic, self.structural, self.recency];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "retrieval.hybrid weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Invalid(
                "retrieval.hybrid weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration for a repository, applying every layer.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let user_file = dirs::config_dir().map(|d| d.join("codemem").join(CONFIG_FILE));
        Self::load_layers(user_file.as_deref(), &repo_root.join(DATA_DIR).join(CONFIG_FILE))
    }

    /// Load from explicit user and repository files (either may be missing).
    pub fn load_layers(user_file: Option<&Path>, repo_file: &Path) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = user_file {
            debug!("User config: {}", path.display());
            builder = builder.add_source(config::File::from(path).required(false));
        }
        debug!("Repository config: {}", repo_file.display());
        builder = builder
            .add_source(config::File::from(repo_file).required(false))
            .add_source(
                config::Environment::with_prefix("CODEMEM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimensions must be > 0".to_string(),
            ));
        }
        if self.embedding.breaker_threshold == 0 {
            return Err(ConfigError::Invalid(
                "embedding.breaker_threshold must be > 0".to_string(),
            ));
        }
        if self.embedding.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "embedding.max_concurrency must be > 0".to_string(),
            ));
        }
        if self.indexing.worker_limit == 0 {
            return Err(ConfigError::Invalid(
                "indexing.worker_limit must be > 0".to_string(),
            ));
        }
        if self.indexing.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "indexing.extensions must not be empty".to_string(),
            ));
        }
        self.retrieval.hybrid.validate()
    }

    /// Write this configuration to `<repo>/.codemem/config.toml`.
    pub fn save(&self, repo_root: &Path) -> Result<PathBuf, ConfigError> {
        let dir = repo_root.join(DATA_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Absolute data directory for a repository, with `~` expanded.
    pub fn data_dir(&self, repo_root: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(&self.graph.data_dir);
        let path = PathBuf::from(expanded.as_ref());
        if path.is_absolute() {
            path
        } else {
            repo_root.join(path)
        }
    }
}

/// Nearest ancestor of `start` holding a `.codemem` directory, else one
/// holding `.git`, else `start` itself.
pub fn find_repo_root(start: &Path) -> PathBuf {
    let marked = |marker: &str| {
        start
            .ancestors()
            .find(|dir| dir.join(marker).is_dir())
            .map(Path::to_path_buf)
    };
    marked(DATA_DIR)
        .or_else(|| marked(".git"))
        .unwrap_or_else(|| start.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.embedding.dimensions, 3072);
        assert_eq!(config.watch.debounce(), Duration::from_secs(1));
        assert_eq!(config.retrieval.hybrid.semantic, 0.65);
        assert_eq!(config.retrieval.hybrid.structural, 0.20);
        assert_eq!(config.retrieval.hybrid.recency, 0.15);
        assert!(config.indexing.ignore_dirs.iter().any(|d| d == "node_modules"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_repo_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let repo_file = dir.path().join("config.toml");
        std::fs::write(
            &repo_file,
            "[embedding]\nmodel = \"small\"\ndimensions = 8\n\n[watch]\ndebounce_ms = 250\n",
        )
        .unwrap();

        let config = Config::load_layers(None, &repo_file).unwrap();
        assert_eq!(config.embedding.model, "small");
        assert_eq!(config.embedding.dimensions, 8);
        assert_eq!(config.watch.debounce_ms, 250);
        // untouched sections keep their defaults
        assert_eq!(config.indexing.worker_limit, 4);
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = tempdir().unwrap();
        let config =
            Config::load_layers(Some(&dir.path().join("nope.toml")), &dir.path().join("x.toml"))
                .unwrap();
        assert_eq!(config.graph, GraphConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = Config::default();
        config.retrieval.hybrid = HybridWeights {
            semantic: 0.0,
            structural: 0.0,
            recency: 0.0,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.retrieval.hybrid.semantic = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.indexing.worker_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.breaker_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.history.enabled = true;
        config.retrieval.default_limit = 12;

        let path = config.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(DATA_DIR).join(CONFIG_FILE));

        let reloaded = Config::load_layers(None, &path).unwrap();
        assert!(reloaded.history.enabled);
        assert_eq!(reloaded.retrieval.default_limit, 12);
    }

    #[test]
    fn test_data_dir_resolution() {
        let config = Config::default();
        let root = Path::new("/repo");
        assert_eq!(config.data_dir(root), PathBuf::from("/repo/.codemem"));

        let mut absolute = Config::default();
        absolute.graph.data_dir = "/var/lib/codemem".to_string();
        assert_eq!(absolute.data_dir(root), PathBuf::from("/var/lib/codemem"));
    }

    #[test]
    fn test_find_repo_root() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_repo_root(&nested), nested);

        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        assert_eq!(find_repo_root(&nested), dir.path());

        std::fs::create_dir_all(dir.path().join("a").join(DATA_DIR)).unwrap();
        assert_eq!(find_repo_root(&nested), dir.path().join("a"));
    }
}
