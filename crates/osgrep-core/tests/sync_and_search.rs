//! Black-box end-to-end coverage of the scenarios in the indexing spec:
//! fresh index, path filtering, idempotent re-sync, change detection, and
//! stale-path sweep.
//!
//! These exercise the real `osgrep-worker` binary and the ONNX models it
//! loads, so they only run with models present on disk (either downloaded
//! ahead of time or available via `OSGREP_SKIP_MODEL_DOWNLOAD`, in which
//! case the worker degrades and chunking-only properties are checked).
//! Run with: `cargo test --test sync_and_search -- --ignored --nocapture`

use std::fs;

use osgrep_core::config::Config;
use osgrep_core::types::{FilterClause, FilterExpr, FilterOp};
use osgrep_core::Engine;

fn write_fixture_repo(dir: &std::path::Path) {
    fs::write(
        dir.join("main.ts"),
        "function login() {\n  return \"ok\";\n}\n",
    )
    .unwrap();
    fs::write(
        dir.join("utils.ts"),
        "export function helper() {\n  return \"utils\";\n}\n",
    )
    .unwrap();
}

fn test_config(repo: &std::path::Path) -> Config {
    let mut config = Config::defaults(repo);
    config.pool.single_worker = true;
    config
}

/// Scenario 1 + 2: fresh index of two files, then a path-prefix filter.
#[tokio::test]
#[ignore = "requires the osgrep-worker binary and downloaded ONNX models"]
async fn fresh_index_then_path_filter() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture_repo(dir.path());

    let engine = Engine::with_config(test_config(dir.path())).expect("engine should open");
    let sync_result = engine.sync().await.expect("sync should succeed");
    assert!(sync_result.indexed >= 2, "expected both files to be indexed, got {sync_result:?}");

    let hits = engine.search("login", 5, None, None).await.expect("search should succeed");
    assert!(hits.iter().any(|r| r.path == "main.ts" && r.text.contains("login") && r.score > 0.0));

    let filter = FilterExpr::All(vec![FilterExpr::Clause(FilterClause {
        key: "path".into(),
        op: FilterOp::StartsWith,
        value: "main.ts".into(),
    })]);
    let filtered = engine
        .search("function", 10, None, Some(filter))
        .await
        .expect("filtered search should succeed");
    assert!(!filtered.is_empty());
    assert!(filtered.iter().all(|r| r.path.starts_with("main.ts")));
}

/// Scenario 3: re-running sync on an unchanged tree indexes nothing.
#[tokio::test]
#[ignore = "requires the osgrep-worker binary and downloaded ONNX models"]
async fn idempotent_resync_indexes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture_repo(dir.path());

    let engine = Engine::with_config(test_config(dir.path())).expect("engine should open");
    let first = engine.sync().await.expect("first sync should succeed");
    assert!(first.indexed >= 2);

    let second = engine.sync().await.expect("second sync should succeed");
    assert_eq!(second.indexed, 0, "unchanged tree must not re-embed anything");
}

/// Scenario 4: modifying one file re-embeds only that file.
#[tokio::test]
#[ignore = "requires the osgrep-worker binary and downloaded ONNX models"]
async fn change_detection_touches_only_modified_path() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture_repo(dir.path());

    let engine = Engine::with_config(test_config(dir.path())).expect("engine should open");
    engine.sync().await.expect("first sync should succeed");

    fs::write(
        dir.path().join("main.ts"),
        "function login() {\n  return \"ok\";\n}\n// a trailing comment\n",
    )
    .unwrap();

    let result = engine.sync().await.expect("second sync should succeed");
    assert_eq!(result.indexed, 1, "only main.ts should have been re-embedded");
    assert_eq!(result.unchanged, 1, "utils.ts should have been skipped via the metadata cache");
}

/// Scenario 5: deleting a file sweeps its rows out of the store.
#[tokio::test]
#[ignore = "requires the osgrep-worker binary and downloaded ONNX models"]
async fn stale_sweep_removes_deleted_file() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture_repo(dir.path());

    let engine = Engine::with_config(test_config(dir.path())).expect("engine should open");
    engine.sync().await.expect("first sync should succeed");

    fs::remove_file(dir.path().join("utils.ts")).unwrap();
    let result = engine.sync().await.expect("second sync should succeed");
    assert_eq!(result.swept, 1);

    let hits = engine.search("helper", 5, None, None).await.expect("search should succeed");
    assert!(hits.iter().all(|r| r.path != "utils.ts"));
}

/// Boundary case: an empty file produces no chunks but is still recorded
/// in the metadata cache so the next sync skips re-reading it. Neither
/// assertion touches the pool, so this runs without a live worker.
#[tokio::test]
async fn empty_file_is_skipped_without_touching_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("empty.rs"), b"").unwrap();

    let engine = Engine::with_config(test_config(dir.path())).expect("engine should open");
    let first = engine.sync().await.expect("sync over an empty file should never fail");
    assert_eq!(first.indexed, 0);

    let second = engine.sync().await.expect("re-sync should still never fail");
    assert_eq!(second.unchanged, 1, "the empty file's metadata entry should make the second pass skip it");
}

/// Boundary case: a file containing a NUL byte is treated as binary and
/// scheduled for delete-by-path rather than raising a hard error.
#[tokio::test]
async fn nul_byte_file_is_treated_as_binary() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("blob.rs"), [b'a', 0u8, b'b']).unwrap();

    let engine = Engine::with_config(test_config(dir.path())).expect("engine should open");
    let result = engine.sync().await.expect("sync over a binary file should never fail");
    assert_eq!(result.indexed, 0);
}
