//! Core domain types shared across all osgrep-core subsystems.
//!
//! These types form the API contract between modules: the chunker
//! produces `Chunk`s, the worker pool fills in their vectors, storage
//! persists and retrieves them, and the retriever turns them into
//! `SearchResult`s. Changing them requires updating every consumer, so
//! they are kept stable and minimal.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output dimensionality of the dense sentence encoder.
pub const VECTOR_DIM: usize = 768;

/// Output dimensionality of a single late-interaction (ColBERT) token embedding.
pub const COLBERT_DIM: usize = 48;

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// Supported programming languages and document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Python (.py)
    Python,
    /// TypeScript (.ts, .tsx)
    TypeScript,
    /// JavaScript (.js, .jsx)
    JavaScript,
    /// Rust (.rs)
    Rust,
    /// Go (.go)
    Go,
    /// Java (.java)
    Java,
    /// C (.c, .h)
    C,
    /// C++ (.cpp, .cc, .cxx, .hpp, .hxx)
    Cpp,
    /// C# (.cs)
    CSharp,
    /// CSS / SCSS (.css, .scss)
    Css,
    /// Ruby (.rb)
    Ruby,
    /// PHP (.php)
    Php,
    /// Swift (.swift)
    Swift,
    /// Kotlin (.kt, .kts)
    Kotlin,
    /// Markdown (.md, .mdx) -- handled by the document fallback analyzer.
    Markdown,
    /// Plain text (.txt) -- handled by the document fallback analyzer.
    Text,
    /// Unknown / unsupported; always falls back to the line-window chunker.
    Unknown,
}

impl Language {
    /// Detect language from a file extension (without the leading dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "py" => Self::Python,
            "ts" | "tsx" => Self::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Self::JavaScript,
            "rs" => Self::Rust,
            "go" => Self::Go,
            "java" => Self::Java,
            "c" | "h" => Self::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hxx" | "hh" => Self::Cpp,
            "cs" => Self::CSharp,
            "css" | "scss" => Self::Css,
            "rb" => Self::Ruby,
            "php" => Self::Php,
            "swift" => Self::Swift,
            "kt" | "kts" => Self::Kotlin,
            "md" | "mdx" => Self::Markdown,
            "txt" => Self::Text,
            _ => Self::Unknown,
        }
    }

    /// Returns the language identifier string, as used in storage and
    /// the parser registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Css => "css",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Kotlin => "kotlin",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a tree-sitter grammar is registered for this language.
    pub fn is_code(&self) -> bool {
        matches!(
            self,
            Self::Python
                | Self::TypeScript
                | Self::JavaScript
                | Self::Rust
                | Self::Go
                | Self::Java
                | Self::C
                | Self::Cpp
                | Self::CSharp
                | Self::Css
                | Self::Ruby
                | Self::Php
                | Self::Swift
                | Self::Kotlin
        )
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility of a code symbol, as reported by a language analyzer.
///
/// Used only during structural extraction to help the role-assignment
/// heuristic and is not itself part of the persisted `Chunk` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Accessible from outside the module/crate.
    Public,
    /// Accessible only within the current crate/package.
    Crate,
    /// Accessible from parent class or subclasses.
    Protected,
    /// Accessible only within the defining scope.
    Private,
}

impl Visibility {
    /// Convert to string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Crate => "crate",
            Self::Protected => "protected",
            Self::Private => "private",
        }
    }
}

/// The kind of dependency relationship an extracted import represents.
/// Only `Imports` is produced today; the variants beyond it are kept for
/// parity with the language analyzers' shared vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// File/module A imports module B.
    Imports,
}

/// An import/use/include statement extracted from source code, used by
/// the role-assignment heuristic (files dominated by imports skew
/// ORCHESTRATION).
#[derive(Debug, Clone)]
pub struct ImportStatement {
    /// The raw import path (e.g., "os.path", "crate::config", "./utils").
    pub import_path: String,
    /// Optional specific names imported (e.g., ["Config", "load"]).
    pub imported_names: Vec<String>,
    /// Line number where the import appears.
    pub line: u32,
    /// Kind of dependency this import represents.
    pub kind: DependencyKind,
}

/// The kind of structural construct a language analyzer found while
/// walking a file's AST. This is richer than the persisted `ChunkKind`
/// vocabulary -- the chunker collapses it down (`Trait`/`Impl` and
/// `Const`/`TypeDef` both become definitions, `Test` becomes a
/// `Function` with a name-based heuristic) while using the extra detail
/// to assign `ChunkRole`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralKind {
    /// Function or method definition.
    Function,
    /// Class, struct, or record definition.
    Class,
    /// Trait, interface, or protocol definition.
    Trait,
    /// Implementation block (Rust `impl`, Java anonymous class, etc.).
    Impl,
    /// Constant or static variable.
    Const,
    /// Type alias or definition.
    TypeDef,
    /// Module or namespace declaration.
    Module,
    /// Test function or test block.
    Test,
    /// Top-level statements that don't fit other categories.
    TopLevel,
}

impl StructuralKind {
    /// Collapse down to the persisted `ChunkKind` vocabulary.
    pub fn to_chunk_kind(self) -> ChunkKind {
        match self {
            Self::Function | Self::Test => ChunkKind::Function,
            Self::Class => ChunkKind::Class,
            Self::Trait | Self::Impl => ChunkKind::Class,
            Self::Const | Self::TypeDef => ChunkKind::Module,
            Self::Module => ChunkKind::Module,
            Self::TopLevel => ChunkKind::Block,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk types
// ---------------------------------------------------------------------------

/// The kind of code construct a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// A standalone function.
    Function,
    /// A class, struct, or record definition.
    Class,
    /// A method defined inside a class/impl block.
    Method,
    /// A module-level declaration that isn't a function/class/method
    /// (top-level constants, type aliases, module docstrings).
    Module,
    /// The one-per-file anchor chunk: path, header comments, imports,
    /// and exported symbol names.
    Anchor,
    /// A structural block produced by the tree-sitter walk that doesn't
    /// map to any of the above (e.g. a top-level `impl` with no single
    /// owning method, or an oversize chunk's tail after splitting).
    Block,
    /// Produced by the line-window fallback chunker when no grammar is
    /// registered for the language or the parse failed.
    Fallback,
}

impl ChunkKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Module => "module",
            Self::Anchor => "anchor",
            Self::Block => "block",
            Self::Fallback => "fallback",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "function" => Self::Function,
            "class" => Self::Class,
            "method" => Self::Method,
            "module" => Self::Module,
            "anchor" => Self::Anchor,
            "block" => Self::Block,
            _ => Self::Fallback,
        }
    }

    /// Whether this kind receives the `+20%` structural boost in Stage 3
    /// of the retriever (function/method/class definitions).
    pub fn is_structurally_boosted(&self) -> bool {
        matches!(self, Self::Function | Self::Method | Self::Class)
    }
}

/// The role a chunk plays within its file, used for retrieval boosts and
/// surfaced to callers in search output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRole {
    /// Wires other components together: entry points, request handlers,
    /// CLI command dispatch. Files with many imports and few definitions
    /// tend to be orchestration.
    Orchestration,
    /// A pure type/interface/trait definition with little logic.
    Definition,
    /// Everything else: the bulk of ordinary implementation code.
    Implementation,
}

impl ChunkRole {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestration => "orchestration",
            Self::Definition => "definition",
            Self::Implementation => "implementation",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "orchestration" => Self::Orchestration,
            "definition" => Self::Definition,
            _ => Self::Implementation,
        }
    }
}

/// A quantized late-interaction (ColBERT-style) token embedding grid for
/// one chunk of text.
///
/// Each row is one token's `COLBERT_DIM`-wide embedding, quantized to
/// `i8` with a single per-grid `scale` so `value = int8 as f32 * scale`
/// recovers the dequantized embedding. `scale` is always `> 0` for a
/// non-empty grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColbertGrid {
    /// Row-major token embeddings, `rows.len() == token_count`, each row
    /// `COLBERT_DIM` elements long.
    pub rows: Vec<Vec<i8>>,
    /// Dequantization scale: `max_abs(original) / 127`.
    pub scale: f32,
}

impl ColbertGrid {
    /// Quantize a dense `[tokens, COLBERT_DIM]` matrix of `f32` embeddings.
    pub fn quantize(matrix: &[Vec<f32>]) -> Self {
        let max_abs = matrix
            .iter()
            .flat_map(|row| row.iter())
            .fold(0.0_f32, |acc, v| acc.max(v.abs()));
        let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
        let rows = matrix
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| ((v / scale).round().clamp(-127.0, 127.0)) as i8)
                    .collect()
            })
            .collect();
        Self { rows, scale }
    }

    /// Dequantize row `i` back to `f32`.
    pub fn dequantize_row(&self, i: usize) -> Vec<f32> {
        self.rows[i].iter().map(|v| f32::from(*v) * self.scale).collect()
    }

    /// Number of token rows in the grid.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the grid has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// L2-normalized mean of the dequantized rows -- the `pooled_colbert`
    /// field of a `Chunk`, used as a cheap secondary ANN signal.
    pub fn pooled(&self) -> Vec<f32> {
        if self.rows.is_empty() {
            return vec![0.0; COLBERT_DIM];
        }
        let mut pooled = vec![0.0_f32; COLBERT_DIM];
        for i in 0..self.rows.len() {
            let row = self.dequantize_row(i);
            for (p, v) in pooled.iter_mut().zip(row.iter()) {
                *p += v;
            }
        }
        let n = self.rows.len() as f32;
        for p in pooled.iter_mut() {
            *p /= n;
        }
        l2_normalize(&mut pooled);
        pooled
    }
}

/// Normalize a vector to unit L2 norm in place. A zero vector is left
/// unchanged (there is no direction to normalize to).
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// A semantically meaningful chunk of text extracted from a file, with
/// its retrieval vectors once the embedding worker pool has processed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Fresh 128-bit UUID assigned at creation time. A chunk that is
    /// re-derived from an unchanged file on the next sync still gets a
    /// new id -- `(path, line_start, line_end, hash)` is what identifies
    /// provenance, not `id` stability.
    pub id: Uuid,
    /// Repository-relative path, forward-slash normalized.
    pub path: String,
    /// SHA-256 hex digest of the whole source file at index time. All
    /// chunks from the same file share this hash.
    pub hash: String,
    /// 1-based inclusive start line.
    pub line_start: u32,
    /// 1-based inclusive end line.
    pub line_end: u32,
    /// Chunk content, including the prepended breadcrumb header.
    pub text: String,
    /// Excerpt of the lines immediately preceding the chunk window, for
    /// context. Empty string at the top of a file -- never null.
    pub context_prev: String,
    /// Excerpt of the lines immediately following the chunk window.
    /// Empty string at the bottom of a file -- never null.
    pub context_next: String,
    /// What kind of code construct this is.
    pub kind: ChunkKind,
    /// What role this chunk plays within its file.
    pub role: ChunkRole,
    /// Identifier strings defined within this chunk (function/class/method
    /// names, exported constants), used for exact-symbol filters.
    pub defined_symbols: BTreeSet<String>,
    /// Dense sentence embedding, `VECTOR_DIM`-wide, unit-norm. Empty until
    /// the worker pool embeds this chunk.
    pub dense: Vec<f32>,
    /// Quantized late-interaction token grid. Empty until embedded.
    pub colbert: ColbertGrid,
    /// L2-normalized mean of `colbert`'s rows, `COLBERT_DIM`-wide. Empty
    /// until embedded.
    pub pooled_colbert: Vec<f32>,
}

impl Chunk {
    /// Whether this chunk has been embedded (has a non-empty dense vector).
    pub fn is_embedded(&self) -> bool {
        !self.dense.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Filter DSL
// ---------------------------------------------------------------------------

/// A single filter comparison against a chunk field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    /// Field name: `path`, `kind`, `role`, or `symbol`.
    pub key: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Value to compare against.
    pub value: String,
}

/// Comparison operator for a `FilterClause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Exact match.
    Equals,
    /// Prefix match.
    StartsWith,
    /// Substring match.
    Contains,
    /// Membership in a comma-separated value list.
    In,
}

/// A boolean filter expression tree evaluated against candidate chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterExpr {
    /// All sub-expressions must match.
    All(Vec<FilterExpr>),
    /// At least one sub-expression must match.
    Any(Vec<FilterExpr>),
    /// The sub-expression must not match.
    Not(Box<FilterExpr>),
    /// A leaf comparison.
    Clause(FilterClause),
}

impl FilterExpr {
    /// Evaluate this expression against a chunk.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        match self {
            FilterExpr::All(exprs) => exprs.iter().all(|e| e.matches(chunk)),
            FilterExpr::Any(exprs) => exprs.iter().any(|e| e.matches(chunk)),
            FilterExpr::Not(inner) => !inner.matches(chunk),
            FilterExpr::Clause(clause) => clause_matches(clause, chunk),
        }
    }
}

fn clause_matches(clause: &FilterClause, chunk: &Chunk) -> bool {
    let field_value: String = match clause.key.as_str() {
        "path" => chunk.path.clone(),
        "kind" => chunk.kind.as_str().to_string(),
        "role" => chunk.role.as_str().to_string(),
        "symbol" => {
            return match clause.op {
                FilterOp::Equals | FilterOp::Contains => {
                    chunk.defined_symbols.contains(&clause.value)
                }
                FilterOp::StartsWith => chunk
                    .defined_symbols
                    .iter()
                    .any(|s| s.starts_with(&clause.value)),
                FilterOp::In => clause
                    .value
                    .split(',')
                    .any(|v| chunk.defined_symbols.contains(v.trim())),
            }
        }
        _ => return false,
    };

    match clause.op {
        FilterOp::Equals => field_value == clause.value,
        FilterOp::StartsWith => field_value.starts_with(&clause.value),
        FilterOp::Contains => field_value.contains(&clause.value),
        FilterOp::In => clause.value.split(',').any(|v| v.trim() == field_value),
    }
}

// ---------------------------------------------------------------------------
// Search result types
// ---------------------------------------------------------------------------

/// Where a search result's score came from, surfaced for debugging and
/// for callers that want to explain ranking decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    /// Rank from the dense vector ANN stage (`None` if keyword-only match).
    pub dense_rank: Option<u32>,
    /// Rank from the FTS5 keyword stage (`None` if semantic-only match).
    pub keyword_rank: Option<u32>,
    /// Summed reciprocal-rank-fusion score before boosts or reranking.
    pub rrf_score: f64,
    /// Multiplicative structural/path/query boost applied in Stage 3.
    pub boost: f64,
    /// Late-interaction MaxSim score from the reranker, if it ran.
    pub max_sim_score: Option<f64>,
}

/// A single ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Chunk text (including breadcrumb header).
    pub text: String,
    /// Repository-relative path of the matched chunk.
    pub path: String,
    /// 1-based inclusive start line.
    pub line_start: u32,
    /// 1-based inclusive end line.
    pub line_end: u32,
    /// Role of the matched chunk.
    pub role: ChunkRole,
    /// Symbols defined within the matched chunk.
    pub defined_symbols: BTreeSet<String>,
    /// Final blended score (higher is better).
    pub score: f64,
    /// 0-based rank within this result set.
    pub rank: u32,
    /// How the score was derived.
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_from_extension() {
        assert_eq!(Language::from_extension("py"), Language::Python);
        assert_eq!(Language::from_extension("rs"), Language::Rust);
        assert_eq!(Language::from_extension("tsx"), Language::TypeScript);
        assert_eq!(Language::from_extension("xyz"), Language::Unknown);
    }

    #[test]
    fn chunk_kind_round_trips_through_string() {
        for kind in [
            ChunkKind::Function,
            ChunkKind::Class,
            ChunkKind::Method,
            ChunkKind::Module,
            ChunkKind::Anchor,
            ChunkKind::Block,
            ChunkKind::Fallback,
        ] {
            assert_eq!(ChunkKind::from_str_lossy(kind.as_str()), kind);
        }
    }

    #[test]
    fn structural_boost_applies_to_definitions_only() {
        assert!(ChunkKind::Function.is_structurally_boosted());
        assert!(ChunkKind::Method.is_structurally_boosted());
        assert!(ChunkKind::Class.is_structurally_boosted());
        assert!(!ChunkKind::Module.is_structurally_boosted());
        assert!(!ChunkKind::Anchor.is_structurally_boosted());
    }

    #[test]
    fn colbert_grid_quantize_dequantize_round_trip_is_close() {
        let matrix = vec![vec![0.5_f32, -0.25, 1.0], vec![-1.0, 0.0, 0.75]];
        let grid = ColbertGrid::quantize(&matrix);
        assert!(grid.scale > 0.0);
        for (orig, _) in matrix.iter().zip(0..matrix.len()) {
            let _ = orig;
        }
        let row0 = grid.dequantize_row(0);
        for (a, b) in row0.iter().zip(matrix[0].iter()) {
            assert!((a - b).abs() < 0.02);
        }
    }

    #[test]
    fn colbert_grid_pooled_is_unit_norm() {
        let matrix = vec![vec![1.0_f32; COLBERT_DIM], vec![-1.0_f32; COLBERT_DIM]];
        let grid = ColbertGrid::quantize(&matrix);
        let pooled = grid.pooled();
        let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
        // The two rows cancel to all-zero before normalization; norm stays 0.
        assert!(norm < 1e-6 || (norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn filter_expr_all_requires_every_clause() {
        let chunk = sample_chunk();
        let expr = FilterExpr::All(vec![
            FilterExpr::Clause(FilterClause {
                key: "kind".into(),
                op: FilterOp::Equals,
                value: "function".into(),
            }),
            FilterExpr::Clause(FilterClause {
                key: "path".into(),
                op: FilterOp::StartsWith,
                value: "src/".into(),
            }),
        ]);
        assert!(expr.matches(&chunk));

        let expr_fail = FilterExpr::All(vec![FilterExpr::Clause(FilterClause {
            key: "path".into(),
            op: FilterOp::StartsWith,
            value: "tests/".into(),
        })]);
        assert!(!expr_fail.matches(&chunk));
    }

    #[test]
    fn filter_expr_not_inverts() {
        let chunk = sample_chunk();
        let expr = FilterExpr::Not(Box::new(FilterExpr::Clause(FilterClause {
            key: "kind".into(),
            op: FilterOp::Equals,
            value: "class".into(),
        })));
        assert!(expr.matches(&chunk));
    }

    fn sample_chunk() -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            path: "src/lib.rs".into(),
            hash: "deadbeef".into(),
            line_start: 1,
            line_end: 10,
            text: "fn foo() {}".into(),
            context_prev: String::new(),
            context_next: String::new(),
            kind: ChunkKind::Function,
            role: ChunkRole::Implementation,
            defined_symbols: BTreeSet::from(["foo".to_string()]),
            dense: vec![],
            colbert: ColbertGrid::default(),
            pooled_colbert: vec![],
        }
    }
}
