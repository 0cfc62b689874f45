//! osgrep CLI.
//!
//! A thin wrapper around `osgrep_core::Engine`: `index` runs an
//! incremental sync, `search` runs a hybrid query. No business logic
//! lives here -- see `osgrep-core` for the engine itself.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use osgrep_core::types::{FilterClause, FilterExpr, FilterOp};
use osgrep_core::Engine;

/// osgrep - local-first semantic code search.
#[derive(Parser, Debug)]
#[command(name = "osgrep", version, about = "Local-first semantic code search")]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Incrementally index a repository.
    Index {
        /// Path to the repository root.
        #[arg(default_value = ".")]
        path: String,
    },

    /// Search the indexed codebase.
    Search {
        /// Search query (natural language or keywords).
        query: String,

        /// Path to the repository root.
        #[arg(long, default_value = ".")]
        path: String,

        /// Maximum number of results. Defaults to the configured
        /// `search.default_limit` when omitted.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only return chunks under this repo-relative path prefix.
        #[arg(long)]
        path_prefix: Option<String>,

        /// Only return chunks of this structural kind (function, class,
        /// method, module, anchor, block, fallback).
        #[arg(long)]
        kind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_env_filter(&cli.log_level).init();

    match cli.command {
        Commands::Index { path } => {
            let root = std::path::Path::new(&path);
            let engine = Engine::open(root).context("failed to open engine")?;
            let result = engine.sync().await.context("sync failed")?;
            println!(
                "indexed {} / {} candidates ({} unchanged, {} deleted, {} stale swept)",
                result.indexed, result.total, result.unchanged, result.deleted, result.swept
            );
        }
        Commands::Search { query, path, limit, path_prefix, kind } => {
            let root = std::path::Path::new(&path);
            let engine = Engine::open(root).context("failed to open engine")?;

            let filter = kind.map(|k| {
                FilterExpr::Clause(FilterClause { key: "kind".into(), op: FilterOp::Equals, value: k })
            });
            let limit = limit.unwrap_or(engine.config().search.default_limit);

            let results = engine
                .search(&query, limit, path_prefix.as_deref(), filter)
                .await
                .context("search failed")?;

            if results.is_empty() {
                println!("no results");
                return Ok(());
            }

            for result in &results {
                println!(
                    "{rank}. {path}:{start}-{end}  score={score:.4}",
                    rank = result.rank + 1,
                    path = result.path,
                    start = result.line_start,
                    end = result.line_end,
                    score = result.score,
                );
                println!("{}", indent(&result.text, 3));
            }
        }
    }

    Ok(())
}

fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    text.lines().map(|line| format!("{pad}{line}")).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indent_prefixes_every_line() {
        assert_eq!(indent("a\nb", 2), "  a\n  b");
    }
}
