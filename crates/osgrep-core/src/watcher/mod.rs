//! Repository tree scanning for the incremental syncer.
//!
//! Live filesystem-event watching is out of scope here (see the crate's
//! top-level docs) -- the syncer re-derives "what changed" from a full
//! tree walk plus the metadata cache on every run rather than subscribing
//! to OS-level change notifications. This module owns that walk: honoring
//! `.gitignore`, a repo-local `.osgrepignore`, and a baked-in denylist,
//! with no symlink following and de-duplication by canonical real path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::config::IndexingConfig;
use crate::error::{OsgrepError, OsgrepResult};
use crate::types::Language;

/// Name of the repo-local ignore file, read in addition to `.gitignore`.
const OSGREP_IGNORE_FILE: &str = ".osgrepignore";

/// Extensions the chunker knows how to handle, beyond tree-sitter
/// grammars: markdown and plain text fall back to the document analyzer,
/// everything else of unknown extension still gets a line-window chunk.
fn is_indexable_extension(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let lang = Language::from_extension(&ext.to_ascii_lowercase());
    lang.is_code() || matches!(lang, Language::Markdown | Language::Text)
}

/// Walk `root`, honoring ignore rules and the indexable-extension
/// allow-list, and return every candidate file as a repo-relative,
/// forward-slash-normalized path. Per-file size/binary checks happen
/// later in the syncer, against a live `stat`/read rather than this
/// one-time snapshot.
pub fn scan_repo(root: &Path, indexing: &IndexingConfig) -> OsgrepResult<Vec<String>> {
    let excludes = build_exclude_set(indexing)?;
    let mut seen_real_paths = HashSet::new();
    let mut out = Vec::new();

    let mut builder = WalkBuilder::new(root);
    builder
        .follow_links(indexing.follow_symlinks)
        .hidden(false)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .parents(true)
        .add_custom_ignore_filename(OSGREP_IGNORE_FILE);
    // The project data directory is never itself a candidate, regardless
    // of whether a `.gitignore` entry for it exists yet.
    builder.filter_entry(|entry| entry.file_name() != ".osgrep");

    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable directory entry during scan");
                continue;
            }
        };

        let is_file = entry.file_type().is_some_and(|ft| ft.is_file());
        if !is_file {
            continue;
        }

        let path = entry.path();
        if !is_indexable_extension(path) {
            continue;
        }

        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if excludes.is_match(relative) {
            continue;
        }

        let real_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !seen_real_paths.insert(real_path) {
            continue;
        }

        out.push(normalize_separators(relative));
    }

    out.sort();
    Ok(out)
}

fn build_exclude_set(indexing: &IndexingConfig) -> OsgrepResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in &indexing.exclude_patterns {
        // A bare name like "node_modules" or "*.lock" should match that
        // name anywhere in the tree, not only at the repo root, so each
        // configured pattern is compiled as both a root-relative and a
        // `**/`-prefixed (any depth, file or directory) glob.
        for variant in [pattern.clone(), format!("**/{pattern}"), format!("**/{pattern}/**")] {
            if let Ok(glob) = Glob::new(&variant) {
                builder.add(glob);
            }
        }
    }
    builder.build().map_err(|e| OsgrepError::Config { details: format!("failed to compile exclude patterns: {e}") })
}

fn normalize_separators(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn scan_finds_source_files_and_skips_excluded_dirs() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/lib.rs", "fn main() {}");
        write(dir.path(), "node_modules/pkg/index.js", "module.exports = {};");
        write(dir.path(), "README.md", "# hello");

        let indexing = IndexingConfig::default();
        let found = scan_repo(dir.path(), &indexing).unwrap();

        assert!(found.contains(&"src/lib.rs".to_string()));
        assert!(found.contains(&"README.md".to_string()));
        assert!(!found.iter().any(|p| p.contains("node_modules")));
    }

    #[test]
    fn scan_skips_non_indexable_extensions() {
        let dir = tempdir().unwrap();
        write(dir.path(), "assets/logo.png", "not real png bytes");

        let indexing = IndexingConfig::default();
        let found = scan_repo(dir.path(), &indexing).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn scan_honors_gitignore() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".gitignore", "ignored/\n");
        write(dir.path(), "ignored/secret.rs", "fn leaked() {}");
        write(dir.path(), "src/lib.rs", "fn main() {}");

        let indexing = IndexingConfig::default();
        let found = scan_repo(dir.path(), &indexing).unwrap();
        assert!(found.contains(&"src/lib.rs".to_string()));
        assert!(!found.iter().any(|p| p.contains("ignored")));
    }

    #[test]
    fn scan_honors_osgrepignore() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".osgrepignore", "vendor/\n");
        write(dir.path(), "vendor/lib.rs", "fn vendored() {}");
        write(dir.path(), "src/lib.rs", "fn main() {}");

        let indexing = IndexingConfig::default();
        let found = scan_repo(dir.path(), &indexing).unwrap();
        assert!(found.contains(&"src/lib.rs".to_string()));
        assert!(!found.iter().any(|p| p.contains("vendor")));
    }

    #[test]
    fn scan_never_descends_into_osgrep_data_dir() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".osgrep/store/chunks.db", "binary-ish content");
        write(dir.path(), "src/lib.rs", "fn main() {}");

        let indexing = IndexingConfig::default();
        let found = scan_repo(dir.path(), &indexing).unwrap();
        assert!(!found.iter().any(|p| p.contains(".osgrep")));
    }

    #[test]
    fn scan_does_not_follow_symlinked_files_by_default() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/original.rs", "fn main() {}");
        let original = dir.path().join("src/original.rs");
        let linked = dir.path().join("src/linked.rs");
        #[cfg(unix)]
        if std::os::unix::fs::symlink(&original, &linked).is_ok() {
            let indexing = IndexingConfig::default();
            let found = scan_repo(dir.path(), &indexing).unwrap();
            assert!(found.contains(&"src/original.rs".to_string()));
            assert!(!found.contains(&"src/linked.rs".to_string()));
        }
    }
}
