//! Worker process body: loads the dense and colbert ONNX models and
//! services requests read from stdin, writing responses to stdout.
//!
//! Runs inside a separate OS process (see `bin/osgrep-worker.rs`) so that
//! an ONNX Runtime panic or segfault takes down one worker, not the whole
//! pool or the indexing run driving it.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Mutex;

use ort::session::Session;

use crate::config::{EmbeddingConfig, IndexingConfig};
use crate::embedder::model_manager;
use crate::error::{OsgrepError, OsgrepResult};
use crate::pool::protocol::{
    read_frame, write_frame, HybridEmbedding, QueryEncoding, WorkerRequest, WorkerRequestKind,
    WorkerResponse, WorkerResponseKind,
};
use crate::types::ColbertGrid;

/// Token id of the `[Q]` marker the colbert tokenizer reserves for query
/// inputs, inserted right after `[CLS]`.
const QUERY_MARKER_ID: i64 = 50368;
/// Token id of the `[D]` marker reserved for document inputs.
const DOC_MARKER_ID: i64 = 50369;

/// Holds the two ONNX sessions a worker process runs inference against.
/// Either may be `None` if its model failed to load, in which case
/// requests for that model return a `WorkerResponseKind::Error`.
pub struct WorkerModels {
    config: EmbeddingConfig,
    indexing_config: IndexingConfig,
    dense_session: Option<Mutex<Session>>,
    dense_tokenizer: Option<tokenizers::Tokenizer>,
    colbert_session: Option<Mutex<Session>>,
    colbert_tokenizer: Option<tokenizers::Tokenizer>,
    /// Token ids excluded from MaxSim's inner max over document tokens:
    /// punctuation and control tokens, resolved once against the colbert
    /// tokenizer's vocabulary at load time.
    colbert_skiplist: HashSet<u32>,
}

impl WorkerModels {
    /// Load both models. Never fails outright -- a model that can't load
    /// leaves this worker degraded for that modality only, which the pool
    /// manager surfaces as `ModelUnavailable` on the affected requests.
    pub fn load(config: &EmbeddingConfig, indexing_config: &IndexingConfig) -> Self {
        let (dense_session, dense_tokenizer) = Self::load_one(
            model_manager::resolve_dense_model_files(config).ok(),
        );
        let (colbert_session, colbert_tokenizer) = Self::load_one(
            model_manager::resolve_colbert_model_files(config).ok(),
        );
        let colbert_skiplist = colbert_tokenizer.as_ref().map(build_skiplist).unwrap_or_default();

        Self {
            config: config.clone(),
            indexing_config: indexing_config.clone(),
            dense_session,
            dense_tokenizer,
            colbert_session,
            colbert_tokenizer,
            colbert_skiplist,
        }
    }

    fn load_one(
        paths: Option<(std::path::PathBuf, std::path::PathBuf)>,
    ) -> (Option<Mutex<Session>>, Option<tokenizers::Tokenizer>) {
        let Some((model_path, tokenizer_path)) = paths else {
            return (None, None);
        };
        if !model_path.exists() {
            tracing::warn!(model = %model_path.display(), "model file missing, worker running in degraded mode for this model");
            return (None, None);
        }

        let session = match Session::builder().and_then(|b| b.commit_from_file(&model_path)) {
            Ok(session) => Some(Mutex::new(session)),
            Err(e) => {
                tracing::warn!(model = %model_path.display(), error = %e, "failed to load ONNX model");
                None
            }
        };

        let tokenizer = match tokenizers::Tokenizer::from_file(&tokenizer_path) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(tokenizer = %tokenizer_path.display(), error = %e, "failed to load tokenizer");
                None
            }
        };

        (session, tokenizer)
    }

    pub fn dense_available(&self) -> bool {
        self.dense_session.is_some() && self.dense_tokenizer.is_some()
    }

    pub fn colbert_available(&self) -> bool {
        self.colbert_session.is_some() && self.colbert_tokenizer.is_some()
    }

    /// Embed a batch with the dense encoder, mean-pooled and L2-normalized.
    pub fn embed_dense(&self, texts: &[String]) -> OsgrepResult<Vec<Option<Vec<f32>>>> {
        let session_mutex = self.dense_session.as_ref().ok_or_else(|| OsgrepError::ModelUnavailable {
            reason: "dense model not loaded".into(),
        })?;
        let tokenizer = self.dense_tokenizer.as_ref().ok_or_else(|| OsgrepError::ModelUnavailable {
            reason: "dense tokenizer not loaded".into(),
        })?;
        let mut session = session_mutex.lock().map_err(|_| OsgrepError::Internal("dense session mutex poisoned".into()))?;

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
            match run_pooled_inference(&mut session, tokenizer, &refs, self.config.max_seq_length) {
                Ok(embs) => out.extend(embs.into_iter().map(Some)),
                Err(e) => {
                    tracing::warn!(error = %e, "dense batch inference failed, falling back per-chunk");
                    for text in &refs {
                        match run_pooled_inference(&mut session, tokenizer, std::slice::from_ref(text), self.config.max_seq_length) {
                            Ok(mut embs) => out.push(Some(embs.remove(0))),
                            Err(_) => out.push(None),
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Embed a batch with the colbert encoder, returning one per-token
    /// matrix per input (masked to real tokens, padding dropped).
    ///
    /// `marker_id` is the `[Q]`/`[D]` marker inserted right after `[CLS]`
    /// (query-side or doc-side, per caller). The skiplist is only applied
    /// on the document side -- ColBERT-style late interaction keeps every
    /// query token so the MaxSim inner max always has a full candidate set
    /// to search, but drops punctuation/control tokens from documents
    /// since they would otherwise soak up the max for unrelated queries.
    fn embed_colbert(&self, texts: &[String], marker_id: i64, apply_skiplist: bool) -> OsgrepResult<Vec<Option<Vec<Vec<f32>>>>> {
        let session_mutex = self.colbert_session.as_ref().ok_or_else(|| OsgrepError::ModelUnavailable {
            reason: "colbert model not loaded".into(),
        })?;
        let tokenizer = self.colbert_tokenizer.as_ref().ok_or_else(|| OsgrepError::ModelUnavailable {
            reason: "colbert tokenizer not loaded".into(),
        })?;
        let mut session = session_mutex.lock().map_err(|_| OsgrepError::Internal("colbert session mutex poisoned".into()))?;
        let skiplist = if apply_skiplist { Some(&self.colbert_skiplist) } else { None };

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
            match run_token_inference(&mut session, tokenizer, &refs, self.config.max_seq_length, marker_id, skiplist) {
                Ok(grids) => out.extend(grids.into_iter().map(Some)),
                Err(e) => {
                    tracing::warn!(error = %e, "colbert batch inference failed, falling back per-chunk");
                    for text in &refs {
                        match run_token_inference(&mut session, tokenizer, std::slice::from_ref(text), self.config.max_seq_length, marker_id, skiplist) {
                            Ok(mut grids) => out.push(Some(grids.remove(0))),
                            Err(_) => out.push(None),
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Embed a batch of chunk texts with both encoders and assemble the
    /// per-text `HybridEmbedding` the syncer stores alongside each chunk.
    /// A text that fails on one modality but not the other still yields
    /// `None` overall -- a chunk is either fully embedded or not indexed,
    /// there is no partial-embedding state in storage.
    pub fn compute_hybrid(&self, texts: &[String]) -> OsgrepResult<Vec<Option<HybridEmbedding>>> {
        let dense = self.embed_dense(texts)?;
        let colbert = self.embed_colbert(texts, DOC_MARKER_ID, true)?;

        Ok(dense
            .into_iter()
            .zip(colbert)
            .map(|(d, c)| match (d, c) {
                (Some(dense), Some(rows)) => {
                    let grid = ColbertGrid::quantize(&rows);
                    let pooled = grid.pooled();
                    Some(HybridEmbedding { dense, colbert: grid, pooled })
                }
                _ => None,
            })
            .collect())
    }

    /// Encode a search query with both encoders. Unlike a chunk, the query
    /// keeps its colbert token matrix unquantized (float) since it is used
    /// directly as the left-hand side of MaxSim, never stored.
    pub fn encode_query(&self, text: &str) -> OsgrepResult<QueryEncoding> {
        let prefixed = format!("{}{}", self.config.dense_query_prefix, text);
        let dense = self
            .embed_dense(std::slice::from_ref(&prefixed))?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| OsgrepError::ModelUnavailable { reason: "dense encoder produced no vector for query".into() })?;

        let colbert = self
            .embed_colbert(std::slice::from_ref(&text.to_string()), QUERY_MARKER_ID, false)?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| OsgrepError::ModelUnavailable { reason: "colbert encoder produced no token matrix for query".into() })?;

        Ok(QueryEncoding { dense, colbert })
    }

    /// Score candidate grids against a query token matrix. Pure CPU math,
    /// no model involved -- delegates to [`crate::reranker::rerank_batch`].
    pub fn rerank(query_matrix: &[Vec<f32>], candidates: &[ColbertGrid]) -> Vec<f64> {
        crate::reranker::rerank_batch(query_matrix, candidates)
    }

    /// Chunk a file's content and embed every chunk in one batched round
    /// trip through both encoders. Chunks whose embedding failed are
    /// dropped -- partially-embedded chunks are worse than missing ones,
    /// since they would silently never surface in vector search.
    pub fn process_file(
        &self,
        path: &str,
        content: &str,
        hash: &str,
        language: crate::types::Language,
    ) -> OsgrepResult<Vec<crate::types::Chunk>> {
        let mut chunks = crate::chunker::chunk_file(path, content, hash, language, &self.indexing_config);
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.compute_hybrid(&texts)?;

        let mut embedded = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.drain(..).zip(embeddings) {
            if let Some(HybridEmbedding { dense, colbert, pooled }) = embedding {
                let mut chunk = chunk;
                chunk.dense = dense;
                chunk.colbert = colbert;
                chunk.pooled_colbert = pooled;
                embedded.push(chunk);
            } else {
                tracing::warn!(path, %hash, "dropping chunk that failed to embed");
            }
        }
        Ok(embedded)
    }

    /// Run the stdin/stdout request loop until the manager sends
    /// `Shutdown` or closes the pipe.
    pub fn run(self) -> std::io::Result<()> {
        let stdin = std::io::stdin();
        let mut reader = stdin.lock();
        let stdout = std::io::stdout();
        let mut writer = stdout.lock();

        loop {
            let request: WorkerRequest = match read_frame(&mut reader)? {
                Some(r) => r,
                None => return Ok(()),
            };

            let response = self.handle(&request);
            write_frame(&mut writer, &response)?;

            if matches!(request.kind, WorkerRequestKind::Shutdown) {
                return Ok(());
            }
        }
    }

    fn handle(&self, request: &WorkerRequest) -> WorkerResponse {
        let kind = match &request.kind {
            WorkerRequestKind::Ping => WorkerResponseKind::Pong,
            WorkerRequestKind::Shutdown => WorkerResponseKind::ShuttingDown,
            WorkerRequestKind::ComputeHybrid { texts } => match self.compute_hybrid(texts) {
                Ok(embs) => WorkerResponseKind::Hybrid(embs),
                Err(e) => WorkerResponseKind::Error { message: e.to_string() },
            },
            WorkerRequestKind::EncodeQuery { text } => match self.encode_query(text) {
                Ok(enc) => WorkerResponseKind::Query(enc),
                Err(e) => WorkerResponseKind::Error { message: e.to_string() },
            },
            WorkerRequestKind::Rerank { query_matrix, candidates } => {
                WorkerResponseKind::RerankScores(Self::rerank(query_matrix, candidates))
            }
            WorkerRequestKind::ProcessFile { path, content, hash, language } => {
                match self.process_file(path, content, hash, *language) {
                    Ok(chunks) => WorkerResponseKind::Chunks(chunks),
                    Err(e) => WorkerResponseKind::Error { message: e.to_string() },
                }
            }
        };
        WorkerResponse { id: request.id, kind }
    }
}

/// Tokenize a batch, padding every input to `max_len`. When `marker_id` is
/// given, it is spliced in right after `[CLS]` (position 0) before
/// truncation/padding -- the `[Q]`/`[D]` convention the colbert model was
/// trained with to distinguish query from document inputs.
fn tokenize_batch(
    tokenizer: &tokenizers::Tokenizer,
    texts: &[&str],
    max_len: usize,
    marker_id: Option<i64>,
) -> OsgrepResult<(Vec<i64>, Vec<i64>, Vec<Vec<u32>>)> {
    let mut all_ids = Vec::with_capacity(texts.len() * max_len);
    let mut all_mask = Vec::with_capacity(texts.len() * max_len);
    let mut lengths = Vec::with_capacity(texts.len());

    for text in texts {
        let encoding = tokenizer
            .encode(*text, true)
            .map_err(|e| OsgrepError::Internal(format!("tokenization error: {e}")))?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        let mut mask: Vec<u32> = encoding.get_attention_mask().to_vec();

        if let Some(marker) = marker_id {
            let insert_at = if ids.is_empty() { 0 } else { 1 };
            ids.insert(insert_at, u32::try_from(marker).unwrap_or(0));
            mask.insert(insert_at, 1);
        }

        let actual_len = ids.len().min(max_len);
        for i in 0..actual_len {
            all_ids.push(i64::from(ids[i]));
            all_mask.push(i64::from(mask[i]));
        }
        for _ in actual_len..max_len {
            all_ids.push(0);
            all_mask.push(0);
        }
        lengths.push(ids[..actual_len].to_vec());
    }

    Ok((all_ids, all_mask, lengths))
}

/// Resolve the token ids to exclude from MaxSim's document-side inner max:
/// ASCII punctuation and the tokenizer's own control tokens, each looked up
/// once against the vocabulary actually loaded (ids vary by tokenizer).
fn build_skiplist(tokenizer: &tokenizers::Tokenizer) -> HashSet<u32> {
    const PUNCTUATION: &[&str] = &[
        ".", ",", "!", "?", ";", ":", "'", "\"", "(", ")", "[", "]", "{", "}", "-", "_", "/", "\\", "|", "`", "~", "@",
        "#", "$", "%", "^", "&", "*", "+", "=", "<", ">",
    ];
    const CONTROL_TOKENS: &[&str] = &["[CLS]", "[SEP]", "[PAD]", "[UNK]", "[MASK]"];

    let mut skip = HashSet::new();
    for token in PUNCTUATION.iter().chain(CONTROL_TOKENS) {
        if let Some(id) = tokenizer.token_to_id(token) {
            skip.insert(id);
        }
    }
    skip
}

fn build_inputs<'a>(
    shape: Vec<i64>,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    session: &Session,
) -> OsgrepResult<Vec<(Cow<'a, str>, ort::session::SessionInputValue<'a>)>> {
    let ids_value = ort::value::Tensor::from_array((shape.clone(), input_ids))
        .map_err(|e| OsgrepError::Internal(format!("ONNX tensor error: {e}")))?;
    let mask_value = ort::value::Tensor::from_array((shape.clone(), attention_mask.clone()))
        .map_err(|e| OsgrepError::Internal(format!("ONNX tensor error: {e}")))?;

    let mut inputs: Vec<(Cow<'a, str>, ort::session::SessionInputValue<'a>)> = vec![
        (Cow::Borrowed("input_ids"), ort::session::SessionInputValue::from(ids_value)),
        (Cow::Borrowed("attention_mask"), ort::session::SessionInputValue::from(mask_value)),
    ];

    if session.inputs().iter().any(|i| i.name() == "token_type_ids") {
        let type_ids = vec![0i64; attention_mask.len()];
        let type_value = ort::value::Tensor::from_array((shape, type_ids))
            .map_err(|e| OsgrepError::Internal(format!("ONNX tensor error (token_type_ids): {e}")))?;
        inputs.push((Cow::Borrowed("token_type_ids"), ort::session::SessionInputValue::from(type_value)));
    }

    Ok(inputs)
}

/// Mean-pool the model's last hidden state with the attention mask and
/// L2-normalize, producing one dense vector per input text.
fn run_pooled_inference(
    session: &mut Session,
    tokenizer: &tokenizers::Tokenizer,
    texts: &[&str],
    max_len: usize,
) -> OsgrepResult<Vec<Vec<f32>>> {
    let batch_size = texts.len();
    let (input_ids, attention_mask, _lengths) = tokenize_batch(tokenizer, texts, max_len, None)?;
    let shape = vec![batch_size as i64, max_len as i64];
    let inputs = build_inputs(shape, input_ids, attention_mask.clone(), session)?;

    let output_name = session
        .outputs()
        .first()
        .map(|o| o.name().to_string())
        .ok_or_else(|| OsgrepError::Internal("model has no outputs".into()))?;

    let outputs = session.run(inputs).map_err(|e| OsgrepError::Internal(format!("ONNX inference error: {e}")))?;
    let output_value = outputs.get(&output_name).ok_or_else(|| OsgrepError::Internal("no output tensor found".into()))?;
    let (output_shape, output_data) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| OsgrepError::Internal(format!("output extraction error: {e}")))?;

    let dims: Vec<usize> = output_shape.iter().map(|&d| d as usize).collect();
    let mut embeddings = Vec::with_capacity(batch_size);

    if dims.len() == 3 {
        let seq_len = dims[1];
        let hidden_dim = dims[2];
        for b in 0..batch_size {
            let mut pooled = vec![0.0f32; hidden_dim];
            let mut mask_sum = 0.0f32;
            for s in 0..seq_len {
                let mask_val = attention_mask[b * max_len + s] as f32;
                mask_sum += mask_val;
                let offset = b * seq_len * hidden_dim + s * hidden_dim;
                for d in 0..hidden_dim {
                    pooled[d] += output_data[offset + d] * mask_val;
                }
            }
            if mask_sum > 0.0 {
                for d in &mut pooled {
                    *d /= mask_sum;
                }
            }
            crate::types::l2_normalize(&mut pooled);
            embeddings.push(pooled);
        }
    } else if dims.len() == 2 {
        let hidden_dim = dims[1];
        for b in 0..batch_size {
            let offset = b * hidden_dim;
            let mut vec = output_data[offset..offset + hidden_dim].to_vec();
            crate::types::l2_normalize(&mut vec);
            embeddings.push(vec);
        }
    } else {
        return Err(OsgrepError::Internal(format!("unexpected output tensor shape: {dims:?}")));
    }

    Ok(embeddings)
}

/// Return the model's per-token hidden states (unpooled), masked down to
/// each input's real token count -- padding rows are dropped. `marker_id`
/// is spliced in after `[CLS]` before inference (see `tokenize_batch`).
/// When `skiplist` is given, rows whose original token id lands in it
/// (punctuation, control tokens) are dropped from the returned grid so
/// MaxSim's inner max never lands on them.
fn run_token_inference(
    session: &mut Session,
    tokenizer: &tokenizers::Tokenizer,
    texts: &[&str],
    max_len: usize,
    marker_id: i64,
    skiplist: Option<&HashSet<u32>>,
) -> OsgrepResult<Vec<Vec<Vec<f32>>>> {
    let batch_size = texts.len();
    let (input_ids, attention_mask, lengths) = tokenize_batch(tokenizer, texts, max_len, Some(marker_id))?;
    let shape = vec![batch_size as i64, max_len as i64];
    let inputs = build_inputs(shape, input_ids, attention_mask, session)?;

    let output_name = session
        .outputs()
        .first()
        .map(|o| o.name().to_string())
        .ok_or_else(|| OsgrepError::Internal("model has no outputs".into()))?;

    let outputs = session.run(inputs).map_err(|e| OsgrepError::Internal(format!("ONNX inference error: {e}")))?;
    let output_value = outputs.get(&output_name).ok_or_else(|| OsgrepError::Internal("no output tensor found".into()))?;
    let (output_shape, output_data) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| OsgrepError::Internal(format!("output extraction error: {e}")))?;

    let dims: Vec<usize> = output_shape.iter().map(|&d| d as usize).collect();
    if dims.len() != 3 {
        return Err(OsgrepError::Internal(format!("expected a [batch, seq, dim] token tensor, got {dims:?}")));
    }
    let seq_len = dims[1];
    let hidden_dim = dims[2];

    let mut grids = Vec::with_capacity(batch_size);
    for (b, token_ids) in lengths.iter().enumerate().take(batch_size) {
        let n = token_ids.len().min(seq_len);
        let mut rows = Vec::with_capacity(n);
        for s in 0..n {
            if skiplist.is_some_and(|skip| skip.contains(&token_ids[s])) {
                continue;
            }
            let offset = b * seq_len * hidden_dim + s * hidden_dim;
            let mut row = output_data[offset..offset + hidden_dim].to_vec();
            crate::types::l2_normalize(&mut row);
            rows.push(row);
        }
        grids.push(rows);
    }

    Ok(grids)
}
