//! Chunk storage: vector ANN, FTS5 keyword search, and path bookkeeping.
//!
//! Backed by `rusqlite` (WAL mode) under the project's `store/` directory,
//! the same engine `index::MetadataCache` uses for the `meta/` side. There
//! is no external ANN library in this dependency stack, so `vector_search`
//! is an exact brute-force cosine scan over the `dense`/`pooled_colbert`
//! columns -- correct rather than sublinear, which is the right tradeoff
//! for the single-repo, single-machine scale this store targets. A small
//! `lru` cache of decoded vectors, bounded by
//! `StorageConfig::vector_cache_max_entries`, absorbs the deserialization
//! cost of repeated scans within one search session.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::{OsgrepError, OsgrepResult};
use crate::types::{Chunk, ChunkKind, ChunkRole, ColbertGrid, FilterExpr, COLBERT_DIM, VECTOR_DIM};

/// Which vector column a `vector_search` call scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorField {
    /// The primary dense sentence embedding.
    Dense,
    /// The pooled (mean) ColBERT embedding, used as a secondary signal
    /// when the primary dense search returns too few candidates.
    PooledColbert,
}

impl VectorField {
    fn column(self) -> &'static str {
        match self {
            VectorField::Dense => "dense",
            VectorField::PooledColbert => "pooled_colbert",
        }
    }

    fn dim(self) -> usize {
        match self {
            VectorField::Dense => VECTOR_DIM,
            VectorField::PooledColbert => COLBERT_DIM,
        }
    }
}

/// One scored candidate returned by `vector_search` or `fts_search`.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// The full chunk record.
    pub chunk: Chunk,
    /// Cosine similarity (vector search) or BM25-derived score (FTS),
    /// higher is better in both cases.
    pub score: f64,
}

/// The vector+FTS chunk store for one project.
pub struct Storage {
    conn: Mutex<Connection>,
    dense_cache: Mutex<LruCache<i64, Vec<f32>>>,
}

impl Storage {
    /// Open or create the store database at `db_path` (typically
    /// `<root>/.osgrep/store/<store_name>.db`).
    pub fn open(db_path: &Path, vector_cache_max_entries: usize) -> OsgrepResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let storage = Self {
            conn: Mutex::new(conn),
            dense_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(vector_cache_max_entries.max(1)).unwrap_or(NonZeroUsize::new(1).unwrap()),
            )),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Open an in-memory store, used by tests.
    pub fn open_in_memory(vector_cache_max_entries: usize) -> OsgrepResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
            dense_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(vector_cache_max_entries.max(1)).unwrap_or(NonZeroUsize::new(1).unwrap()),
            )),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    fn ensure_schema(&self) -> OsgrepResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// (Re)build the FTS5 index from the contents of `chunks`. The virtual
    /// table is created as part of `ensure_schema`; this is for the rare
    /// case the index needs an explicit rebuild (e.g. after a bulk
    /// `INSERT ... SELECT` that bypassed the usual insert path).
    pub fn create_fts_index(&self) -> OsgrepResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])?;
        Ok(())
    }

    /// Insert a batch of fully embedded chunks in one transaction. Rejects
    /// the whole batch with `SchemaMismatch` if any chunk violates the
    /// storage invariants (wrong vector width, non-positive scale, NaNs).
    pub fn insert_batch(&self, chunks: &[Chunk]) -> OsgrepResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        for chunk in chunks {
            validate_chunk(chunk)?;
        }

        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks
                   (id, path, hash, line_start, line_end, text, context_prev, context_next,
                    kind, role, defined_symbols, dense, colbert_rows, colbert_scale, pooled_colbert)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            let mut insert_fts = tx.prepare("INSERT INTO chunks_fts (rowid, text) VALUES (?1, ?2)")?;

            for chunk in chunks {
                let defined_symbols = chunk.defined_symbols.iter().cloned().collect::<Vec<_>>().join("\u{1f}");
                insert_chunk.execute(params![
                    chunk.id.to_string(),
                    chunk.path,
                    chunk.hash,
                    chunk.line_start,
                    chunk.line_end,
                    chunk.text,
                    chunk.context_prev,
                    chunk.context_next,
                    chunk.kind.as_str(),
                    chunk.role.as_str(),
                    defined_symbols,
                    pack_f32(&chunk.dense),
                    pack_colbert_rows(&chunk.colbert),
                    chunk.colbert.scale,
                    pack_f32(&chunk.pooled_colbert),
                ])?;
                let rowid = tx.last_insert_rowid();
                insert_fts.execute(params![rowid, chunk.text])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete every chunk belonging to any of `paths`.
    pub fn delete_paths<I, S>(&self, paths: I) -> OsgrepResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths: Vec<String> = paths.into_iter().map(|p| p.as_ref().to_string()).collect();
        if paths.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut select_rowids = tx.prepare("SELECT rowid FROM chunks WHERE path = ?1")?;
            let mut delete_fts = tx.prepare("DELETE FROM chunks_fts WHERE rowid = ?1")?;
            let mut delete_chunks = tx.prepare("DELETE FROM chunks WHERE path = ?1")?;

            for path in &paths {
                let rowids: Vec<i64> = select_rowids
                    .query_map(params![path], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                for rowid in rowids {
                    delete_fts.execute(params![rowid])?;
                }
                delete_chunks.execute(params![path])?;
            }
        }
        tx.commit()?;

        let mut cache = self.dense_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        Ok(())
    }

    /// Every distinct path currently stored, with its chunk count.
    pub fn list_paths(&self) -> OsgrepResult<std::collections::HashMap<String, usize>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT path, COUNT(*) FROM chunks GROUP BY path")?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((path, count as usize))
        })?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let (path, count) = row?;
            out.insert(path, count);
        }
        Ok(out)
    }

    /// Whether the store holds any chunk at all. Used by the syncer's
    /// storage/cache inconsistency check on startup.
    pub fn has_any_rows(&self) -> OsgrepResult<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks LIMIT 1", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Brute-force cosine-similarity search over `field`, optionally
    /// restricted to paths starting with `path_prefix` and to chunks
    /// matching `filter`. Returns up to `k` results, highest score first.
    pub fn vector_search(
        &self,
        field: VectorField,
        query: &[f32],
        k: usize,
        path_prefix: Option<&str>,
        filter: Option<&FilterExpr>,
    ) -> OsgrepResult<Vec<ScoredChunk>> {
        if query.len() != field.dim() {
            return Err(OsgrepError::SchemaMismatch {
                details: format!("query vector has {} dims, expected {}", query.len(), field.dim()),
            });
        }

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let column = field.column();
        let sql = format!(
            "SELECT rowid, id, path, hash, line_start, line_end, text, context_prev, context_next,
                    kind, role, defined_symbols, dense, colbert_rows, colbert_scale, pooled_colbert, {column}
             FROM chunks
             WHERE (?1 IS NULL OR path LIKE ?1 || '%')"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![path_prefix])?;

        let mut scored = Vec::new();
        {
            let mut cache = self.dense_cache.lock().unwrap_or_else(|e| e.into_inner());
            while let Some(row) = rows.next()? {
                let rowid: i64 = row.get(0)?;
                let field_blob: Vec<u8> = row.get(16)?;
                let vector = cache_or_decode(&mut cache, rowid, &field_blob, field);

                let score = f64::from(cosine(query, &vector));
                let chunk = row_to_chunk(row)?;
                if filter.is_some_and(|f| !f.matches(&chunk)) {
                    continue;
                }
                scored.push(ScoredChunk { chunk, score });
            }
        }

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    /// FTS5 keyword search over chunk text, optionally restricted to
    /// `path_prefix` and `filter`. Returns up to `k` results, best match
    /// first (BM25 is a "lower is better" cost in SQLite, negated here so
    /// higher-is-better holds across both search modes).
    pub fn fts_search(
        &self,
        query: &str,
        k: usize,
        path_prefix: Option<&str>,
        filter: Option<&FilterExpr>,
    ) -> OsgrepResult<Vec<ScoredChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = "SELECT c.rowid, c.id, c.path, c.hash, c.line_start, c.line_end, c.text,
                          c.context_prev, c.context_next, c.kind, c.role, c.defined_symbols,
                          c.dense, c.colbert_rows, c.colbert_scale, c.pooled_colbert,
                          bm25(chunks_fts) AS rank
                   FROM chunks_fts
                   JOIN chunks c ON c.rowid = chunks_fts.rowid
                   WHERE chunks_fts MATCH ?1 AND (?2 IS NULL OR c.path LIKE ?2 || '%')
                   ORDER BY rank
                   LIMIT ?3";
        let mut stmt = conn.prepare(sql)?;
        // Overfetch before `filter` is applied in-process, since FTS MATCH
        // can't see the filter DSL's arbitrary clause tree.
        let overfetch = (k * 4).max(k).max(40);
        let mut rows = stmt.query(params![query, path_prefix, overfetch as i64])?;

        let mut scored = Vec::new();
        while let Some(row) = rows.next()? {
            let bm25_rank: f64 = row.get(16)?;
            let chunk = row_to_chunk(row)?;
            if filter.is_some_and(|f| !f.matches(&chunk)) {
                continue;
            }
            // bm25() in SQLite returns a cost (lower is better); flip sign
            // so this store's score convention (higher is better) is
            // uniform across vector_search and fts_search.
            scored.push(ScoredChunk { chunk, score: -bm25_rank });
            if scored.len() >= k {
                break;
            }
        }
        Ok(scored)
    }

    /// Drop every table. Used for corruption recovery (rebuild from scratch).
    pub fn drop_all(&self) -> OsgrepResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "DROP TABLE IF EXISTS chunks_fts;
             DROP TABLE IF EXISTS chunks;",
        )?;
        drop(conn);
        self.ensure_schema()?;
        let mut cache = self.dense_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        Ok(())
    }

    /// Flush WAL contents into the main database file.
    pub fn close(self) -> OsgrepResult<()> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }
}

fn cache_or_decode(
    cache: &mut LruCache<i64, Vec<f32>>,
    rowid: i64,
    blob: &[u8],
    field: VectorField,
) -> Vec<f32> {
    // Only the dense column benefits from caching across repeated
    // searches within one session; pooled_colbert lookups are rarer
    // (secondary fallback only) and don't share the cache key space.
    if field == VectorField::Dense {
        if let Some(v) = cache.get(&rowid) {
            return v.clone();
        }
        let v = unpack_f32(blob);
        cache.put(rowid, v.clone());
        v
    } else {
        unpack_f32(blob)
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> OsgrepResult<Chunk> {
    let id_str: String = row.get(1)?;
    let path: String = row.get(2)?;
    let hash: String = row.get(3)?;
    let line_start: u32 = row.get(4)?;
    let line_end: u32 = row.get(5)?;
    let text: String = row.get(6)?;
    let context_prev: String = row.get(7)?;
    let context_next: String = row.get(8)?;
    let kind: String = row.get(9)?;
    let role: String = row.get(10)?;
    let defined_symbols: String = row.get(11)?;
    let dense: Vec<u8> = row.get(12)?;
    let colbert_rows: Vec<u8> = row.get(13)?;
    let colbert_scale: f32 = row.get(14)?;
    let pooled_colbert: Vec<u8> = row.get(15)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| OsgrepError::SchemaMismatch { details: format!("invalid chunk id {id_str}: {e}") })?;

    Ok(Chunk {
        id,
        path,
        hash,
        line_start,
        line_end,
        text,
        context_prev,
        context_next,
        kind: ChunkKind::from_str_lossy(&kind),
        role: ChunkRole::from_str_lossy(&role),
        defined_symbols: if defined_symbols.is_empty() {
            Default::default()
        } else {
            defined_symbols.split('\u{1f}').map(str::to_string).collect()
        },
        dense: unpack_f32(&dense),
        colbert: unpack_colbert_rows(&colbert_rows, colbert_scale),
        pooled_colbert: unpack_f32(&pooled_colbert),
    })
}

fn validate_chunk(chunk: &Chunk) -> OsgrepResult<()> {
    if chunk.dense.len() != VECTOR_DIM {
        return Err(OsgrepError::SchemaMismatch {
            details: format!("chunk {} has {} dense dims, expected {VECTOR_DIM}", chunk.id, chunk.dense.len()),
        });
    }
    if chunk.pooled_colbert.len() != COLBERT_DIM {
        return Err(OsgrepError::SchemaMismatch {
            details: format!(
                "chunk {} has {} pooled_colbert dims, expected {COLBERT_DIM}",
                chunk.id,
                chunk.pooled_colbert.len()
            ),
        });
    }
    if !chunk.colbert.is_empty() && chunk.colbert.scale <= 0.0 {
        return Err(OsgrepError::SchemaMismatch {
            details: format!("chunk {} has non-positive colbert scale {}", chunk.id, chunk.colbert.scale),
        });
    }
    if chunk.dense.iter().any(|v| v.is_nan()) || chunk.pooled_colbert.iter().any(|v| v.is_nan()) {
        return Err(OsgrepError::SchemaMismatch { details: format!("chunk {} has a NaN vector component", chunk.id) });
    }
    Ok(())
}

fn pack_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn unpack_f32(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn pack_colbert_rows(grid: &ColbertGrid) -> Vec<u8> {
    let mut out = Vec::with_capacity(grid.rows.len() * COLBERT_DIM);
    for row in &grid.rows {
        out.extend(row.iter().map(|v| *v as u8));
    }
    out
}

fn unpack_colbert_rows(bytes: &[u8], scale: f32) -> ColbertGrid {
    let rows = bytes.chunks_exact(COLBERT_DIM).map(|c| c.iter().map(|b| *b as i8).collect()).collect();
    ColbertGrid { rows, scale }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    // Both operands are expected unit-norm (dense/pooled_colbert vectors
    // are always L2-normalized on write), so the dot product already is
    // the cosine similarity -- no need to divide by magnitudes here.
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn embedded_chunk(path: &str, dense_first: f32) -> Chunk {
        let mut dense = vec![0.0_f32; VECTOR_DIM];
        dense[0] = dense_first;
        crate::types::l2_normalize(&mut dense);

        let colbert = ColbertGrid::quantize(&[vec![0.5_f32; COLBERT_DIM]]);
        let pooled_colbert = colbert.pooled();

        Chunk {
            id: Uuid::new_v4(),
            path: path.into(),
            hash: "deadbeef".into(),
            line_start: 1,
            line_end: 5,
            text: "fn hello_world() { println!(\"hi\"); }".into(),
            context_prev: String::new(),
            context_next: String::new(),
            kind: ChunkKind::Function,
            role: ChunkRole::Implementation,
            defined_symbols: BTreeSet::from(["hello_world".to_string()]),
            dense,
            colbert,
            pooled_colbert,
        }
    }

    #[test]
    fn insert_then_list_paths() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/a.rs", 1.0), embedded_chunk("src/b.rs", 1.0)]).unwrap();
        let paths = storage.list_paths().unwrap();
        assert_eq!(paths.get("src/a.rs"), Some(&1));
        assert_eq!(paths.get("src/b.rs"), Some(&1));
    }

    #[test]
    fn insert_rejects_wrong_dimension_vector() {
        let storage = Storage::open_in_memory(1024).unwrap();
        let mut bad = embedded_chunk("src/a.rs", 1.0);
        bad.dense.pop();
        let err = storage.insert_batch(&[bad]).unwrap_err();
        assert!(matches!(err, OsgrepError::SchemaMismatch { .. }));
    }

    #[test]
    fn delete_paths_removes_chunks_and_fts_rows() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/a.rs", 1.0)]).unwrap();
        storage.delete_paths(["src/a.rs"]).unwrap();
        assert!(!storage.has_any_rows().unwrap());

        let hits = storage.fts_search("hello_world", 10, None, None).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn vector_search_ranks_closer_vector_first() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/near.rs", 0.99), embedded_chunk("src/far.rs", 0.01)]).unwrap();

        let mut query = vec![0.0_f32; VECTOR_DIM];
        query[0] = 1.0;
        crate::types::l2_normalize(&mut query);

        let hits = storage.vector_search(VectorField::Dense, &query, 2, None, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.path, "src/near.rs");
    }

    #[test]
    fn vector_search_honors_path_prefix() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/a.rs", 1.0), embedded_chunk("tests/b.rs", 1.0)]).unwrap();

        let mut query = vec![0.0_f32; VECTOR_DIM];
        query[0] = 1.0;
        crate::types::l2_normalize(&mut query);

        let hits = storage.vector_search(VectorField::Dense, &query, 10, Some("src/"), None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.path, "src/a.rs");
    }

    #[test]
    fn fts_search_finds_matching_text() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/a.rs", 1.0)]).unwrap();
        let hits = storage.fts_search("hello_world", 10, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.path, "src/a.rs");
    }

    #[test]
    fn fts_search_empty_query_returns_nothing() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/a.rs", 1.0)]).unwrap();
        assert!(storage.fts_search("   ", 10, None, None).unwrap().is_empty());
    }

    #[test]
    fn drop_all_clears_store_and_keeps_it_usable() {
        let storage = Storage::open_in_memory(1024).unwrap();
        storage.insert_batch(&[embedded_chunk("src/a.rs", 1.0)]).unwrap();
        storage.drop_all().unwrap();
        assert!(!storage.has_any_rows().unwrap());
        storage.insert_batch(&[embedded_chunk("src/b.rs", 1.0)]).unwrap();
        assert!(storage.has_any_rows().unwrap());
    }
}
