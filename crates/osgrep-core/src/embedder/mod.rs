//! Embedding model management.
//!
//! Actual inference never runs in this process -- the models are not
//! thread-safe across sibling threads in the host runtime, so all
//! inference happens inside the process-isolated workers in
//! [`crate::pool`]. This module only manages the two ONNX model files
//! (download, cache, path resolution) that a worker loads at startup.
//!
//! See `pool::worker::WorkerModels` for the inference code and
//! `pool::protocol` for the `compute_hybrid` / `encode_query` / `rerank`
//! RPCs a worker serves once its models are loaded.

pub mod model_manager;
