//! Durable `{path -> (hash, mtime, size)}` metadata cache.
//!
//! Backs the Syncer's change-detection fast path: a stat that matches the
//! cached `(mtime_ms, size_bytes)` pair skips hashing entirely, and a hash
//! that matches skips re-chunking and re-embedding. The cache is a pure
//! optimization -- losing it (or wiping it and rebuilding) never produces
//! wrong search results, only a slower next sync.
//!
//! Backed by `rusqlite` in WAL mode, the same engine the `store` module
//! uses for the vector/FTS side, under the project's `meta/` directory.
//! Each entry is `bincode`-encoded and then `lz4`-compressed before being
//! written to a `BLOB` column -- cheap given how repetitive `MetaEntry`'s
//! fields are across a large repo.

use std::io::{Read, Write};
use std::path::Path;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::{OsgrepError, OsgrepResult};

/// One cached file's change-detection fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// SHA-256 hex digest of the file's content at last index time.
    pub hash: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime_ms: u64,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// SQLite-backed metadata cache, one row per repo-relative path.
pub struct MetadataCache {
    conn: Connection,
}

impl MetadataCache {
    /// Open or create the cache database at `db_path` (typically
    /// `<root>/.osgrep/meta/cache.db`).
    pub fn open(db_path: &Path) -> OsgrepResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let cache = Self { conn };
        cache.ensure_schema()?;
        Ok(cache)
    }

    /// Open an in-memory cache, used by tests that don't need durability.
    pub fn open_in_memory() -> OsgrepResult<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn };
        cache.ensure_schema()?;
        Ok(cache)
    }

    fn ensure_schema(&self) -> OsgrepResult<()> {
        self.conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Look up the cached fingerprint for `path`, if any.
    pub fn get(&self, path: &str) -> OsgrepResult<Option<MetaEntry>> {
        let mut stmt = self.conn.prepare_cached("SELECT value FROM file_meta WHERE path = ?1")?;
        let blob: Option<Vec<u8>> = stmt
            .query_row(params![path], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match blob {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the fingerprint for `path`.
    pub fn put(&self, path: &str, entry: &MetaEntry) -> OsgrepResult<()> {
        let bytes = encode_entry(entry)?;
        self.conn.execute(
            "INSERT INTO file_meta (path, value) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET value = excluded.value",
            params![path, bytes],
        )?;
        Ok(())
    }

    /// Insert or replace fingerprints for many paths in one transaction.
    pub fn put_batch<'a, I>(&mut self, entries: I) -> OsgrepResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a MetaEntry)>,
    {
        let tx = self.conn.transaction()?;
        for (path, entry) in entries {
            let bytes = encode_entry(entry)?;
            tx.execute(
                "INSERT INTO file_meta (path, value) VALUES (?1, ?2)
                 ON CONFLICT(path) DO UPDATE SET value = excluded.value",
                params![path, bytes],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove the fingerprint for `path`, if present.
    pub fn delete(&self, path: &str) -> OsgrepResult<()> {
        self.conn.execute("DELETE FROM file_meta WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Remove fingerprints for many paths in one transaction.
    pub fn delete_batch<'a, I>(&mut self, paths: I) -> OsgrepResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let tx = self.conn.transaction()?;
        for path in paths {
            tx.execute("DELETE FROM file_meta WHERE path = ?1", params![path])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Iterate every `(path, entry)` pair currently cached.
    pub fn iter(&self) -> OsgrepResult<Vec<(String, MetaEntry)>> {
        let mut stmt = self.conn.prepare("SELECT path, value FROM file_meta")?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((path, blob))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (path, blob) = row?;
            out.push((path, decode_entry(&blob)?));
        }
        Ok(out)
    }

    /// Whether the cache holds any entries at all. Used by the syncer's
    /// storage/cache inconsistency check on startup.
    pub fn has_any_rows(&self) -> OsgrepResult<bool> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM file_meta LIMIT 1", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Number of cached entries.
    pub fn len(&self) -> OsgrepResult<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM file_meta", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop every cached entry, for corruption recovery (rebuild from scratch).
    pub fn clear(&self) -> OsgrepResult<()> {
        self.conn.execute("DELETE FROM file_meta", [])?;
        Ok(())
    }

    /// Flush WAL contents into the main database file. Correctness never
    /// depends on this running -- it only shortens recovery time on a
    /// dirty shutdown.
    pub fn close(self) -> OsgrepResult<()> {
        self.conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }
}

fn encode_entry(entry: &MetaEntry) -> OsgrepResult<Vec<u8>> {
    let raw = bincode::serialize(entry).map_err(|e| OsgrepError::Serialization(e.to_string()))?;
    let mut encoder = lz4::EncoderBuilder::new()
        .build(Vec::new())
        .map_err(|e| OsgrepError::Internal(format!("lz4 encoder setup failed: {e}")))?;
    encoder.write_all(&raw)?;
    let (compressed, result) = encoder.finish();
    result.map_err(|e| OsgrepError::Internal(format!("lz4 compression failed: {e}")))?;
    Ok(compressed)
}

fn decode_entry(bytes: &[u8]) -> OsgrepResult<MetaEntry> {
    let mut raw = Vec::new();
    let mut decoder = lz4::Decoder::new(bytes).map_err(|e| OsgrepError::Internal(format!("lz4 decoder setup failed: {e}")))?;
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| OsgrepError::Internal(format!("lz4 decompression failed: {e}")))?;
    bincode::deserialize(&raw).map_err(|e| OsgrepError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hash: &str) -> MetaEntry {
        MetaEntry { hash: hash.into(), mtime_ms: 1_700_000_000_000, size_bytes: 42 }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.put("src/lib.rs", &sample("abc")).unwrap();
        let got = cache.get("src/lib.rs").unwrap().unwrap();
        assert_eq!(got, sample("abc"));
    }

    #[test]
    fn get_missing_path_is_none() {
        let cache = MetadataCache::open_in_memory().unwrap();
        assert!(cache.get("nope.rs").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.put("a.rs", &sample("first")).unwrap();
        cache.put("a.rs", &sample("second")).unwrap();
        assert_eq!(cache.get("a.rs").unwrap().unwrap().hash, "second");
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn delete_removes_entry() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.put("a.rs", &sample("x")).unwrap();
        cache.delete("a.rs").unwrap();
        assert!(cache.get("a.rs").unwrap().is_none());
    }

    #[test]
    fn iter_returns_all_entries() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.put("a.rs", &sample("a")).unwrap();
        cache.put("b.rs", &sample("b")).unwrap();
        let mut entries = cache.iter().unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "a.rs");
        assert_eq!(entries[1].0, "b.rs");
    }

    #[test]
    fn has_any_rows_reflects_contents() {
        let cache = MetadataCache::open_in_memory().unwrap();
        assert!(!cache.has_any_rows().unwrap());
        cache.put("a.rs", &sample("a")).unwrap();
        assert!(cache.has_any_rows().unwrap());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = MetadataCache::open_in_memory().unwrap();
        cache.put("a.rs", &sample("a")).unwrap();
        cache.clear().unwrap();
        assert!(!cache.has_any_rows().unwrap());
    }

    #[test]
    fn put_batch_and_delete_batch() {
        let mut cache = MetadataCache::open_in_memory().unwrap();
        let a = sample("a");
        let b = sample("b");
        cache.put_batch([("a.rs", &a), ("b.rs", &b)]).unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        cache.delete_batch(["a.rs"]).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.get("b.rs").unwrap().is_some());
    }
}
