//! Entry point for one embedding worker process.
//!
//! Spawned by [`osgrep_core::pool::WorkerPool`] with its stdin/stdout
//! piped back to the manager. Never invoked directly by a user; it reads
//! config from the current working directory exactly like the main
//! process, then loads its models and blocks serving requests until told
//! to shut down or its stdin pipe closes.

use osgrep_core::config::Config;
use osgrep_core::pool::worker::WorkerModels;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let repo_path = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let config = Config::load(&repo_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "worker failed to load config, using defaults");
        Config::defaults(&repo_path)
    });

    let models = WorkerModels::load(&config.embedding, &config.indexing);
    tracing::info!(
        dense_available = models.dense_available(),
        colbert_available = models.colbert_available(),
        "worker ready"
    );

    if let Err(e) = models.run() {
        tracing::error!(error = %e, "worker request loop exited with an error");
        std::process::exit(1);
    }
}
