//! Configuration loading and validation.
//!
//! Configuration is resolved with the following precedence (highest wins):
//!
//! 1. Environment variables (`OSGREP_*`)
//! 2. Project config (`<repo>/.osgrep/config.toml`)
//! 3. User config (`~/.config/osgrep/config.toml`)
//! 4. Compiled-in defaults
//!
//! CLI flags are applied on top of the loaded `Config` by the `osgrep-cli`
//! crate itself; this module only knows about files and environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OsgrepError, OsgrepResult};

/// Top-level configuration for osgrep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Repository root path to index.
    pub repo_path: PathBuf,

    /// Indexing / chunking configuration.
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Incremental sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Search / retrieval configuration.
    #[serde(default)]
    pub search: SearchConfig,

    /// Embedding model configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// On-disk storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// On-disk chunk store and vector-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Name of the store directory under `.osgrep/store/` -- lets a repo
    /// keep more than one named index (e.g. a scratch index alongside the
    /// default one) without colliding on disk.
    #[serde(default = "StorageConfig::default_store_name")]
    pub store_name: String,

    /// Maximum number of dense vectors held in the in-memory ANN cache
    /// before the least-recently-used entry is evicted. Bounds resident
    /// memory for repos too large to keep fully in RAM.
    #[serde(default = "StorageConfig::default_vector_cache_max_entries")]
    pub vector_cache_max_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_name: Self::default_store_name(),
            vector_cache_max_entries: Self::default_vector_cache_max_entries(),
        }
    }
}

impl StorageConfig {
    fn default_store_name() -> String {
        "store".to_string()
    }
    fn default_vector_cache_max_entries() -> usize {
        50_000
    }
}

/// Indexing and chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Additional file patterns to exclude from indexing (glob syntax),
    /// on top of `.gitignore`-style ignore files.
    #[serde(default = "IndexingConfig::default_excludes")]
    pub exclude_patterns: Vec<String>,

    /// Maximum file size to index (in bytes). Files larger than this are skipped.
    #[serde(default = "IndexingConfig::default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum chunk size in tokens before an oversize element is split.
    #[serde(default = "IndexingConfig::default_max_chunk_tokens")]
    pub max_chunk_tokens: u32,

    /// Whether to follow symbolic links during the directory walk.
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Overlap fraction for intra-element splitting (0.0 - 0.5). Controls
    /// how much content is repeated between consecutive chunks when a
    /// single oversize element is split into multiple chunks.
    #[serde(default = "IndexingConfig::default_overlap_fraction")]
    pub overlap_fraction: f64,

    /// Number of lines either side of an unparsed region to use for the
    /// line-window fallback chunker.
    #[serde(default = "IndexingConfig::default_fallback_window_lines")]
    pub fallback_window_lines: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Self::default_excludes(),
            max_file_size: Self::default_max_file_size(),
            max_chunk_tokens: Self::default_max_chunk_tokens(),
            follow_symlinks: false,
            overlap_fraction: Self::default_overlap_fraction(),
            fallback_window_lines: Self::default_fallback_window_lines(),
        }
    }
}

impl IndexingConfig {
    fn default_excludes() -> Vec<String> {
        vec![
            ".git".into(),
            "node_modules".into(),
            "target".into(),
            "__pycache__".into(),
            ".venv".into(),
            "venv".into(),
            "dist".into(),
            "build".into(),
            ".next".into(),
            "*.lock".into(),
            "*.min.js".into(),
            "*.min.css".into(),
            "*.map".into(),
        ]
    }

    fn default_max_file_size() -> u64 {
        10 * 1024 * 1024
    }

    fn default_max_chunk_tokens() -> u32 {
        512
    }

    fn default_overlap_fraction() -> f64 {
        0.12
    }

    fn default_fallback_window_lines() -> usize {
        60
    }
}

/// Incremental sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of files being hashed/chunked/embedded concurrently.
    #[serde(default = "SyncConfig::default_concurrency")]
    pub concurrency: usize,

    /// Number of chunks to accumulate before flushing a batch to storage.
    #[serde(default = "SyncConfig::default_flush_batch_size")]
    pub flush_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            flush_batch_size: Self::default_flush_batch_size(),
        }
    }
}

impl SyncConfig {
    fn default_concurrency() -> usize {
        8
    }

    fn default_flush_batch_size() -> usize {
        256
    }
}

/// Search-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default number of results to return.
    #[serde(default = "SearchConfig::default_limit")]
    pub default_limit: usize,

    /// Maximum number of results a single query may request.
    #[serde(default = "SearchConfig::default_max_limit")]
    pub max_limit: usize,

    /// Reciprocal rank fusion constant (the `K` in `1 / (K + rank)`).
    #[serde(default = "SearchConfig::default_rrf_k")]
    pub rrf_k: u32,

    /// Number of candidates pulled from each of the dense and keyword
    /// retrieval stages before fusion.
    #[serde(default = "SearchConfig::default_candidate_pool_size")]
    pub candidate_pool_size: usize,

    /// Reranker configuration.
    #[serde(default)]
    pub reranker: RerankerConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: Self::default_limit(),
            max_limit: Self::default_max_limit(),
            rrf_k: Self::default_rrf_k(),
            candidate_pool_size: Self::default_candidate_pool_size(),
            reranker: RerankerConfig::default(),
        }
    }
}

impl SearchConfig {
    fn default_limit() -> usize {
        10
    }
    fn default_max_limit() -> usize {
        100
    }
    fn default_rrf_k() -> u32 {
        60
    }
    /// The floor in `PRE_RERANK_K = max(candidate_pool_size, 4 * k)`.
    fn default_candidate_pool_size() -> usize {
        40
    }
}

/// Late-interaction reranker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Whether reranking is enabled at all. When the worker pool is
    /// degraded, reranking is skipped regardless of this flag.
    #[serde(default = "RerankerConfig::default_enabled")]
    pub enabled: bool,

    /// Maximum number of fused candidates to pass to the reranker.
    #[serde(default = "RerankerConfig::default_max_candidates")]
    pub max_candidates: usize,

    /// Whether to fall back to pooled ColBERT vectors (single vector per
    /// chunk, cosine-scored) when the worker pool cannot service a full
    /// per-token MaxSim rerank.
    #[serde(default = "RerankerConfig::default_allow_pooled_fallback")]
    pub allow_pooled_fallback: bool,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_candidates: Self::default_max_candidates(),
            allow_pooled_fallback: Self::default_allow_pooled_fallback(),
        }
    }
}

impl RerankerConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_max_candidates() -> usize {
        100
    }
    fn default_allow_pooled_fallback() -> bool {
        true
    }
}

/// Embedding model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Override path to the dense encoder ONNX model. Empty means use the
    /// auto-managed cache location.
    #[serde(default)]
    pub dense_model_path: Option<PathBuf>,

    /// Override path to the late-interaction (ColBERT) encoder ONNX model.
    #[serde(default)]
    pub colbert_model_path: Option<PathBuf>,

    /// Batch size for embedding inference inside a worker.
    #[serde(default = "EmbeddingConfig::default_batch_size")]
    pub batch_size: usize,

    /// Maximum sequence length for the tokenizer, in tokens.
    #[serde(default = "EmbeddingConfig::default_max_seq_length")]
    pub max_seq_length: usize,

    /// Skip downloading models over the network; fail with `ModelUnavailable`
    /// instead if they are not already cached. Mirrors `OSGREP_SKIP_MODEL_DOWNLOAD`.
    #[serde(default)]
    pub skip_model_download: bool,

    /// Text prepended to every search query (not to indexed chunks) before
    /// dense tokenization. The dense encoder was trained with asymmetric
    /// query/document instructions, so an un-prefixed query underperforms
    /// its matching document embedding.
    #[serde(default = "EmbeddingConfig::default_dense_query_prefix")]
    pub dense_query_prefix: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dense_model_path: None,
            colbert_model_path: None,
            batch_size: Self::default_batch_size(),
            max_seq_length: Self::default_max_seq_length(),
            skip_model_download: false,
            dense_query_prefix: Self::default_dense_query_prefix(),
        }
    }
}

impl EmbeddingConfig {
    fn default_batch_size() -> usize {
        32
    }
    fn default_max_seq_length() -> usize {
        512
    }
    fn default_dense_query_prefix() -> String {
        "Represent this query for searching relevant code: ".to_string()
    }
}

/// Process-isolated embedding worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker processes to maintain.
    #[serde(default = "PoolConfig::default_worker_count")]
    pub worker_count: usize,

    /// How long to wait for a single inference task before considering the
    /// worker hung and killing it.
    #[serde(default = "PoolConfig::default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Resident-set-size cap (megabytes) above which a worker is recycled
    /// after finishing its current task.
    #[serde(default = "PoolConfig::default_max_rss_mb")]
    pub max_rss_mb: u64,

    /// Minimum delay before restarting a worker that exited or was killed,
    /// to avoid a hot crash loop.
    #[serde(default = "PoolConfig::default_restart_cooldown_ms")]
    pub restart_cooldown_ms: u64,

    /// Maximum number of consecutive restarts within one cooldown window
    /// before the pool gives up on that slot and runs degraded.
    #[serde(default = "PoolConfig::default_max_consecutive_restarts")]
    pub max_consecutive_restarts: u32,

    /// How long to wait for a freshly spawned worker to report its models
    /// loaded before treating the spawn as failed.
    #[serde(default = "PoolConfig::default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Force exactly one worker process regardless of `worker_count` --
    /// useful under a tight process ulimit (CI sandboxes) or when
    /// debugging a model issue with a single, easy-to-attach-to process.
    #[serde(default)]
    pub single_worker: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: Self::default_worker_count(),
            task_timeout_secs: Self::default_task_timeout_secs(),
            max_rss_mb: Self::default_max_rss_mb(),
            restart_cooldown_ms: Self::default_restart_cooldown_ms(),
            max_consecutive_restarts: Self::default_max_consecutive_restarts(),
            startup_timeout_ms: Self::default_startup_timeout_ms(),
            single_worker: false,
        }
    }
}

impl PoolConfig {
    /// The inference runtime is not thread-safe across sibling threads in
    /// the host process, so the pool defaults to a single worker; callers
    /// who want more isolation/throughput opt in via `OSGREP_WORKER_COUNT`,
    /// capped at `HARD_CAP` below.
    fn default_worker_count() -> usize {
        1
    }
    /// Environment-override ceiling for `worker_count` (`HARD_CAP` in the
    /// spec): beyond this, sibling ONNX Runtime sessions contend for the
    /// same CPU cache lines without meaningful throughput gain.
    pub const HARD_CAP: usize = 4;
    fn default_task_timeout_secs() -> u64 {
        60
    }
    fn default_max_rss_mb() -> u64 {
        6144
    }
    fn default_restart_cooldown_ms() -> u64 {
        500
    }
    fn default_max_consecutive_restarts() -> u32 {
        5
    }
    fn default_startup_timeout_ms() -> u64 {
        30_000
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Whether to output logs as JSON instead of the default human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }
}

impl Config {
    /// Load configuration from defaults, overlaid by user config, project
    /// config, and finally environment overrides.
    pub fn load(repo_path: &Path) -> OsgrepResult<Self> {
        let mut config = Self::defaults(repo_path);

        if let Some(user_config_dir) = dirs::config_dir() {
            let user_config_path = user_config_dir.join("osgrep").join("config.toml");
            if user_config_path.exists() {
                config.merge_from_file(&user_config_path)?;
            }
        }

        let project_config_path = repo_path.join(".osgrep").join("config.toml");
        if project_config_path.exists() {
            config.merge_from_file(&project_config_path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Create a default configuration for the given repo path.
    pub fn defaults(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            indexing: IndexingConfig::default(),
            sync: SyncConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            pool: PoolConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Merge values from a TOML config file (non-destructive overlay: a
    /// section absent from the file leaves the current value untouched).
    fn merge_from_file(&mut self, path: &Path) -> OsgrepResult<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content).map_err(|e| OsgrepError::Config {
            details: format!("invalid TOML in {}: {e}", path.display()),
        })?;

        if let Some(v) = overlay.get("indexing") {
            if let Ok(parsed) = v.clone().try_into::<IndexingConfig>() {
                self.indexing = parsed;
            }
        }
        if let Some(v) = overlay.get("sync") {
            if let Ok(parsed) = v.clone().try_into::<SyncConfig>() {
                self.sync = parsed;
            }
        }
        if let Some(v) = overlay.get("search") {
            if let Ok(parsed) = v.clone().try_into::<SearchConfig>() {
                self.search = parsed;
            }
        }
        if let Some(v) = overlay.get("embedding") {
            if let Ok(parsed) = v.clone().try_into::<EmbeddingConfig>() {
                self.embedding = parsed;
            }
        }
        if let Some(v) = overlay.get("pool") {
            if let Ok(parsed) = v.clone().try_into::<PoolConfig>() {
                self.pool = parsed;
            }
        }
        if let Some(v) = overlay.get("storage") {
            if let Ok(parsed) = v.clone().try_into::<StorageConfig>() {
                self.storage = parsed;
            }
        }
        if let Some(v) = overlay.get("logging") {
            if let Ok(parsed) = v.clone().try_into::<LoggingConfig>() {
                self.logging = parsed;
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (`OSGREP_*` prefix).
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("OSGREP_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(model) = std::env::var("OSGREP_DENSE_MODEL_PATH") {
            self.embedding.dense_model_path = Some(PathBuf::from(model));
        }
        if let Ok(model) = std::env::var("OSGREP_COLBERT_MODEL_PATH") {
            self.embedding.colbert_model_path = Some(PathBuf::from(model));
        }
        if std::env::var("OSGREP_SKIP_MODEL_DOWNLOAD").is_ok_and(|v| v == "1" || v == "true") {
            self.embedding.skip_model_download = true;
        }
        if let Ok(workers) = std::env::var("OSGREP_WORKER_COUNT") {
            if let Ok(n) = workers.parse::<usize>() {
                self.pool.worker_count = n.clamp(1, PoolConfig::HARD_CAP);
            }
        }
        if let Ok(ms) = std::env::var("OSGREP_WORKER_TIMEOUT_MS") {
            if let Ok(n) = ms.parse::<u64>() {
                self.pool.startup_timeout_ms = n;
            }
        }
        if let Ok(ms) = std::env::var("OSGREP_WORKER_TASK_TIMEOUT_MS") {
            if let Ok(n) = ms.parse::<u64>() {
                self.pool.task_timeout_secs = n.div_ceil(1000).max(1);
            }
        }
        if std::env::var("OSGREP_SINGLE_WORKER").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
            self.pool.single_worker = true;
        }
        if let Ok(max) = std::env::var("OSGREP_VECTOR_CACHE_MAX") {
            if let Ok(n) = max.parse::<usize>() {
                self.storage.vector_cache_max_entries = n;
            }
        }
        // `MXBAI_STORE` is the name the spec documents for this override
        // (a holdover from the embedding vendor the store name convention
        // was borrowed from); `OSGREP_STORE` is kept as the namespaced
        // alias, checked second so `MXBAI_STORE` wins if both are set.
        if let Ok(store) = std::env::var("OSGREP_STORE") {
            self.storage.store_name = store;
        }
        if let Ok(store) = std::env::var("MXBAI_STORE") {
            self.storage.store_name = store;
        }
    }

    /// Returns the `.osgrep` directory root for this repo (parent of the
    /// writer lock, the metadata cache and the vector/FTS store).
    pub fn osgrep_dir(&self) -> PathBuf {
        self.repo_path.join(".osgrep")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::defaults(Path::new("/tmp/test-repo"));
        assert_eq!(config.indexing.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.search.default_limit, 10);
        assert!(config.pool.worker_count >= 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn osgrep_dir_is_repo_relative() {
        let config = Config::defaults(Path::new("/tmp/test-repo"));
        assert_eq!(config.osgrep_dir(), PathBuf::from("/tmp/test-repo/.osgrep"));
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("OSGREP_LOG_LEVEL", "trace");
        let mut config = Config::defaults(Path::new("/tmp/test-repo"));
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "trace");
        std::env::remove_var("OSGREP_LOG_LEVEL");
    }

    #[test]
    fn env_overrides_pool_and_storage_settings() {
        std::env::set_var("OSGREP_WORKER_TASK_TIMEOUT_MS", "1500");
        std::env::set_var("OSGREP_SINGLE_WORKER", "true");
        std::env::set_var("OSGREP_VECTOR_CACHE_MAX", "1234");
        std::env::set_var("OSGREP_STORE", "scratch");

        let mut config = Config::defaults(Path::new("/tmp/test-repo"));
        config.apply_env_overrides();

        assert_eq!(config.pool.task_timeout_secs, 2);
        assert!(config.pool.single_worker);
        assert_eq!(config.storage.vector_cache_max_entries, 1234);
        assert_eq!(config.storage.store_name, "scratch");

        std::env::remove_var("OSGREP_WORKER_TASK_TIMEOUT_MS");
        std::env::remove_var("OSGREP_SINGLE_WORKER");
        std::env::remove_var("OSGREP_VECTOR_CACHE_MAX");
        std::env::remove_var("OSGREP_STORE");
    }
}
