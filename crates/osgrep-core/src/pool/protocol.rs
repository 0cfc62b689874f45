//! Wire protocol between the pool manager and worker processes.
//!
//! Messages are length-prefixed `bincode` frames over the worker's stdin
//! (manager -> worker) and stdout (worker -> manager): a `u32` little-endian
//! byte length followed by the encoded payload. stderr is left free for the
//! worker's own `tracing` output, which the manager forwards into its own
//! logs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Chunk, ColbertGrid, Language};

/// A request sent from the pool manager to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Unique id, echoed back on the matching response so the manager can
    /// match responses to pending requests despite the worker processing
    /// a batch at a time.
    pub id: Uuid,
    pub kind: WorkerRequestKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequestKind {
    /// Embed a batch of chunk texts with both encoders. Returns one
    /// `HybridEmbedding` per input, in order.
    ComputeHybrid { texts: Vec<String> },
    /// Encode a search query with both encoders. Unlike `ComputeHybrid`,
    /// the colbert side stays un-pooled `f32` -- MaxSim needs the full
    /// per-token query matrix, not a quantized grid.
    EncodeQuery { text: String },
    /// Score a query token matrix against a batch of candidate document
    /// grids via MaxSim. Returns one score per candidate, in order.
    Rerank {
        query_matrix: Vec<Vec<f32>>,
        candidates: Vec<ColbertGrid>,
    },
    /// Chunk a file and embed every resulting chunk, in one round trip --
    /// avoids shipping raw file content back and forth for every stage.
    ProcessFile {
        path: String,
        content: String,
        hash: String,
        language: Language,
    },
    /// Liveness probe; the worker replies immediately with `Pong`.
    Ping,
    /// Ask the worker to exit cleanly once this request is processed.
    Shutdown,
}

/// A response sent from a worker process back to the pool manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: Uuid,
    pub kind: WorkerResponseKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerResponseKind {
    /// One hybrid embedding per input text, in order. `None` entries mark
    /// inputs that failed to embed individually (oversize after retry,
    /// tokenizer error) without failing the whole batch.
    Hybrid(Vec<Option<HybridEmbedding>>),
    /// The query-side dense vector and un-pooled colbert token matrix.
    Query(QueryEncoding),
    /// MaxSim scores, one per candidate, in the order requested.
    RerankScores(Vec<f64>),
    /// Fully embedded chunk records for a `ProcessFile` request.
    Chunks(Vec<Chunk>),
    Pong,
    ShuttingDown,
    /// The request failed outright (model not loaded, malformed batch).
    Error { message: String },
}

/// The dense and (quantized) late-interaction embeddings for one chunk of
/// text, as returned by `compute_hybrid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridEmbedding {
    /// `VECTOR_DIM`-wide, unit-norm dense embedding.
    pub dense: Vec<f32>,
    /// Quantized per-token late-interaction grid.
    pub colbert: ColbertGrid,
    /// L2-normalized mean of `colbert`'s rows.
    pub pooled: Vec<f32>,
}

/// The query-side encoding used to drive both the initial ANN lookup and
/// the Stage 4 MaxSim rerank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEncoding {
    /// `VECTOR_DIM`-wide, unit-norm dense embedding of the query.
    pub dense: Vec<f32>,
    /// Per-token `COLBERT_DIM`-wide embeddings, un-pooled, `f32`. Each row
    /// is L2-normalized so MaxSim scores stay comparable across queries.
    pub colbert: Vec<Vec<f32>>,
}

impl QueryEncoding {
    /// The normalized mean of `colbert`'s rows -- the vector used for the
    /// Stage 1 secondary ANN lookup against `pooled_colbert` when dense
    /// candidates run thin.
    pub fn pooled_colbert(&self) -> Vec<f32> {
        if self.colbert.is_empty() {
            return vec![0.0; crate::types::COLBERT_DIM];
        }
        let mut pooled = vec![0.0_f32; crate::types::COLBERT_DIM];
        for row in &self.colbert {
            for (p, v) in pooled.iter_mut().zip(row.iter()) {
                *p += v;
            }
        }
        let n = self.colbert.len() as f32;
        for p in pooled.iter_mut() {
            *p /= n;
        }
        crate::types::l2_normalize(&mut pooled);
        pooled
    }
}

/// Read one length-prefixed bincode frame from `reader`. Returns `Ok(None)`
/// on clean EOF (the peer closed its write side).
pub fn read_frame<R: std::io::Read, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> std::io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let value = bincode::deserialize(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Write one length-prefixed bincode frame to `writer` and flush it.
pub fn write_frame<W: std::io::Write, T: Serialize>(writer: &mut W, value: &T) -> std::io::Result<()> {
    let buf = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(buf.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&buf)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let req = WorkerRequest {
            id: Uuid::new_v4(),
            kind: WorkerRequestKind::Ping,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: WorkerRequest = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.id, req.id);
        assert!(matches!(decoded.kind, WorkerRequestKind::Ping));
    }

    #[test]
    fn empty_reader_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let decoded: Option<WorkerRequest> = read_frame(&mut cursor).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn process_file_round_trips() {
        let req = WorkerRequest {
            id: Uuid::new_v4(),
            kind: WorkerRequestKind::ProcessFile {
                path: "src/lib.rs".into(),
                content: "fn main() {}".into(),
                hash: "abc123".into(),
                language: Language::Rust,
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: WorkerRequest = read_frame(&mut cursor).unwrap().unwrap();
        match decoded.kind {
            WorkerRequestKind::ProcessFile { path, language, .. } => {
                assert_eq!(path, "src/lib.rs");
                assert_eq!(language, Language::Rust);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn pooled_colbert_of_empty_query_is_zero_vector() {
        let q = QueryEncoding { dense: vec![], colbert: vec![] };
        assert_eq!(q.pooled_colbert(), vec![0.0; crate::types::COLBERT_DIM]);
    }
}
