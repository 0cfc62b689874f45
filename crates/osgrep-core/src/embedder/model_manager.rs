//! Automatic embedding model management.
//!
//! Downloads and caches the two ONNX models the worker pool needs -- a
//! dense sentence encoder and a late-interaction (ColBERT-style) token
//! encoder -- on first use. Models are stored in
//! `~/.local/share/osgrep/models/<model-name>/`.
//!
//! Enterprise users should never manually download models: the pool
//! auto-detects missing models and downloads them with progress
//! reporting. After download, the model path is stable and cached
//! forever.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::EmbeddingConfig;
use crate::error::{OsgrepError, OsgrepResult};

/// Metadata for a supported embedding model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Human-readable model name.
    pub name: &'static str,
    /// HuggingFace model ID.
    pub hf_repo: &'static str,
    /// URL to the ONNX model file.
    pub model_url: &'static str,
    /// URL to the tokenizer.json file.
    pub tokenizer_url: &'static str,
    /// Output embedding dimensions (pooled dimension for the dense model,
    /// per-token dimension for the colbert model).
    pub dimensions: usize,
    /// Maximum sequence length the model supports.
    pub max_seq_length: usize,
    /// Approximate download size in bytes (for progress display).
    pub approx_size_bytes: u64,
}

/// Dense sentence encoder -- trained on code-to-text and code-to-code
/// retrieval, pooled to a single 768-dimensional vector per chunk.
pub const DENSE_MODEL: ModelSpec = ModelSpec {
    name: "jina-embeddings-v2-base-code",
    hf_repo: "jinaai/jina-embeddings-v2-base-code",
    model_url: "https://huggingface.co/jinaai/jina-embeddings-v2-base-code/resolve/main/onnx/model.onnx",
    tokenizer_url: "https://huggingface.co/jinaai/jina-embeddings-v2-base-code/resolve/main/tokenizer.json",
    dimensions: crate::types::VECTOR_DIM,
    max_seq_length: 8192,
    approx_size_bytes: 550_000_000,
};

/// Late-interaction (ColBERT-style) token encoder -- one embedding per
/// token, quantized and stored as a `ColbertGrid` for MaxSim reranking.
pub const COLBERT_MODEL: ModelSpec = ModelSpec {
    name: "answerai-colbert-small-v1",
    hf_repo: "answerdotai/answerai-colbert-small-v1",
    model_url: "https://huggingface.co/answerdotai/answerai-colbert-small-v1/resolve/main/onnx/model.onnx",
    tokenizer_url: "https://huggingface.co/answerdotai/answerai-colbert-small-v1/resolve/main/tokenizer.json",
    dimensions: crate::types::COLBERT_DIM,
    max_seq_length: 512,
    approx_size_bytes: 130_000_000,
};

/// Models directory: `~/.local/share/osgrep/models/`
fn models_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("osgrep")
        .join("models")
}

/// Directory for a specific model: `~/.local/share/osgrep/models/<name>/`
pub fn model_dir(spec: &ModelSpec) -> PathBuf {
    models_base_dir().join(spec.name)
}

/// Path to the ONNX model file for a given spec.
pub fn model_path(spec: &ModelSpec) -> PathBuf {
    model_dir(spec).join("model.onnx")
}

/// Path to the tokenizer file for a given spec.
pub fn tokenizer_path(spec: &ModelSpec) -> PathBuf {
    model_dir(spec).join("tokenizer.json")
}

/// Check if the model files exist and are not obviously corrupted.
pub fn is_model_ready(spec: &ModelSpec) -> bool {
    let model = model_path(spec);
    let tokenizer = tokenizer_path(spec);

    if !model.exists() || !tokenizer.exists() {
        return false;
    }

    if let Ok(meta) = std::fs::metadata(&model) {
        if meta.len() < 1_000_000 {
            return false;
        }
    }

    true
}

/// Ensure the model is available, downloading if necessary. Returns the
/// paths to `(model.onnx, tokenizer.json)`.
pub fn ensure_model(spec: &ModelSpec) -> OsgrepResult<(PathBuf, PathBuf)> {
    let model = model_path(spec);
    let tokenizer = tokenizer_path(spec);

    if is_model_ready(spec) {
        tracing::debug!(model = spec.name, path = %model.display(), "embedding model already cached");
        return Ok((model, tokenizer));
    }

    let dir = model_dir(spec);
    std::fs::create_dir_all(&dir)?;

    tracing::info!(model = spec.name, repo = spec.hf_repo, "downloading embedding model (first-time setup)");

    if !model.exists() || std::fs::metadata(&model).map(|m| m.len() < 1_000_000).unwrap_or(true) {
        download_file(
            spec.model_url,
            &model,
            &format!("Downloading {} model", spec.name),
            Some(spec.approx_size_bytes),
        )?;
    }

    if !tokenizer.exists() {
        download_file(spec.tokenizer_url, &tokenizer, &format!("Downloading {} tokenizer", spec.name), None)?;
    }

    let meta_path = dir.join("meta.json");
    let meta = serde_json::json!({
        "model": spec.name,
        "hf_repo": spec.hf_repo,
        "dimensions": spec.dimensions,
        "max_seq_length": spec.max_seq_length,
        "downloaded_at": epoch_marker(),
    });
    if let Ok(content) = serde_json::to_string_pretty(&meta) {
        let _ = std::fs::write(&meta_path, content);
    }

    tracing::info!(model = spec.name, path = %model.display(), "embedding model ready");

    Ok((model, tokenizer))
}

fn download_file(url: &str, dest: &Path, message: &str, expected_size: Option<u64>) -> OsgrepResult<()> {
    let temp_path = dest.with_extension("downloading");

    let response = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .map_err(|e| OsgrepError::Internal(format!("HTTP client error: {e}")))?
        .get(url)
        .send()
        .map_err(|e| {
            OsgrepError::Internal(format!(
                "failed to download model from {url}: {e}\n\
                 Hint: check your internet connection, or set OSGREP_DENSE_MODEL_PATH / \
                 OSGREP_COLBERT_MODEL_PATH to a manually downloaded model."
            ))
        })?;

    if !response.status().is_success() {
        return Err(OsgrepError::Internal(format!("model download failed: HTTP {} from {url}", response.status())));
    }

    let total_size = response.content_length().or(expected_size).unwrap_or(0);

    let pb = if total_size > 0 {
        let pb = indicatif::ProgressBar::new(total_size);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{msg}\n  [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb.set_message(message.to_string());
        pb
    } else {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_message(message.to_string());
        pb
    };

    let mut file = std::fs::File::create(&temp_path)?;
    let mut downloaded: u64 = 0;

    let bytes = response.bytes().map_err(|e| OsgrepError::Internal(format!("download stream error: {e}")))?;

    let chunk_size = 8192;
    for chunk in bytes.chunks(chunk_size) {
        file.write_all(chunk)?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }

    file.flush()?;
    drop(file);

    pb.finish_with_message(format!("{message} -- done"));

    std::fs::rename(&temp_path, dest)?;

    Ok(())
}

/// Resolve the dense model's `(model, tokenizer)` paths, honoring a
/// manual override from config/env and `skip_model_download`.
pub fn resolve_dense_model_files(config: &EmbeddingConfig) -> OsgrepResult<(PathBuf, PathBuf)> {
    resolve_model_files(&DENSE_MODEL, &config.dense_model_path, config.skip_model_download)
}

/// Resolve the colbert model's `(model, tokenizer)` paths.
pub fn resolve_colbert_model_files(config: &EmbeddingConfig) -> OsgrepResult<(PathBuf, PathBuf)> {
    resolve_model_files(&COLBERT_MODEL, &config.colbert_model_path, config.skip_model_download)
}

fn resolve_model_files(
    spec: &ModelSpec,
    override_path: &Option<PathBuf>,
    skip_download: bool,
) -> OsgrepResult<(PathBuf, PathBuf)> {
    if let Some(path) = override_path {
        if path.exists() {
            let tokenizer_path = path.with_file_name("tokenizer.json");
            tracing::debug!(model = %path.display(), "using user-specified model path");
            return Ok((path.clone(), tokenizer_path));
        }
    }

    if is_model_ready(spec) {
        return Ok((model_path(spec), tokenizer_path(spec)));
    }

    if skip_download || std::env::var("OSGREP_SKIP_MODEL_DOWNLOAD").is_ok() {
        tracing::info!(model = spec.name, "model download skipped, operating in degraded mode");
        return Ok((model_path(spec), tokenizer_path(spec)));
    }

    #[cfg(test)]
    {
        return Ok((model_path(spec), tokenizer_path(spec)));
    }

    #[cfg(not(test))]
    {
        match ensure_model(spec) {
            Ok((model, tokenizer)) => Ok((model, tokenizer)),
            Err(e) => {
                tracing::warn!(error = %e, model = spec.name, "model auto-download failed, will operate in degraded mode");
                Ok((model_path(spec), tokenizer_path(spec)))
            }
        }
    }
}

fn epoch_marker() -> String {
    use std::time::SystemTime;
    let now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    format!("epoch:{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_dir_structure() {
        let dir = model_dir(&DENSE_MODEL);
        assert!(dir.ends_with("jina-embeddings-v2-base-code"));

        let model = model_path(&DENSE_MODEL);
        assert!(model.ends_with("model.onnx"));

        let tokenizer = tokenizer_path(&DENSE_MODEL);
        assert!(tokenizer.ends_with("tokenizer.json"));
    }

    #[test]
    fn dense_and_colbert_have_distinct_paths() {
        assert_ne!(model_dir(&DENSE_MODEL), model_dir(&COLBERT_MODEL));
    }

    #[test]
    fn model_not_ready_when_missing() {
        let dummy = ModelSpec {
            name: "non-existent-model-xyz-123",
            hf_repo: "fake/repo",
            model_url: "http://fake.com",
            tokenizer_url: "http://fake.com",
            dimensions: 10,
            max_seq_length: 10,
            approx_size_bytes: 10,
        };
        assert!(!is_model_ready(&dummy));
    }

    #[test]
    fn dense_model_constants() {
        assert_eq!(DENSE_MODEL.dimensions, crate::types::VECTOR_DIM);
        assert!(DENSE_MODEL.model_url.starts_with("https://"));
    }

    #[test]
    fn colbert_model_constants() {
        assert_eq!(COLBERT_MODEL.dimensions, crate::types::COLBERT_DIM);
        assert!(COLBERT_MODEL.model_url.starts_with("https://"));
    }

    #[test]
    fn skip_download_returns_unready_paths_without_network() {
        let config = EmbeddingConfig {
            dense_model_path: None,
            colbert_model_path: None,
            batch_size: 8,
            max_seq_length: 512,
            skip_model_download: true,
            dense_query_prefix: EmbeddingConfig::default().dense_query_prefix,
        };
        let (model, _) = resolve_dense_model_files(&config).expect("resolve should not error");
        assert!(model.ends_with("model.onnx"));
    }
}
