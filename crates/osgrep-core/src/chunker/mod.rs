//! Semantic chunker.
//!
//! Turns one file's source text into a deterministic, ordered sequence of
//! `Chunk`s ready for the embedding worker pool. Chunks respect AST
//! boundaries where a grammar is registered and fall back to fixed-size
//! line windows otherwise. Every file also gets exactly one `Anchor`
//! chunk summarizing its imports and exported symbols.
//!
//! ## Strategy
//!
//! 1. Parse via the registered tree-sitter analyzer (or the document
//!    analyzer for Markdown/plain text).
//! 2. One chunk per structural element found, oversize elements re-split
//!    with the configured overlap.
//! 3. No analyzer registered, or the parse failed -> line-window fallback.
//! 4. Prepend a breadcrumb header to every chunk's text.
//! 5. Emit the file's anchor chunk.
//! 6. Fill in `context_prev`/`context_next` from the lines immediately
//!    outside each chunk's window.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::parser::{self, StructuralElement};
use crate::types::{Chunk, ChunkKind, ChunkRole, ColbertGrid, ImportStatement, Language, StructuralKind};

/// Number of lines of neighboring context captured on each side of a chunk.
const CONTEXT_LINES: usize = 3;

/// Chunk a single file's source text.
///
/// `path` must already be repo-relative and forward-slash normalized.
/// `hash` is the SHA-256 hex digest of the whole file, stamped onto every
/// chunk produced. Returns an empty vector only if `source` has no
/// content at all; callers should not invoke this for binary content
/// (see [`looks_binary`]) -- the syncer filters that out upstream.
pub fn chunk_file(
    path: &str,
    source: &str,
    hash: &str,
    language: Language,
    config: &IndexingConfig,
) -> Vec<Chunk> {
    if source.is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = source.lines().collect();
    let bytes = source.as_bytes();
    let file_path = std::path::Path::new(path);

    let elements = parser::parse_file(file_path, bytes, language)
        .ok()
        .filter(|e| !e.is_empty());

    let imports = parser::parse_imports(file_path, bytes, language).unwrap_or_default();

    let mut out = Vec::new();

    match elements {
        Some(elements) => {
            let role_ctx = RoleContext::new(&elements, &imports);
            for elem in &elements {
                emit_element(path, hash, &lines, elem, &role_ctx, config, &mut out);
            }
        }
        None => {
            emit_fallback_windows(path, hash, &lines, config, &mut out);
        }
    }

    out.push(build_anchor_chunk(path, hash, &lines, &imports, &elements_exported(&out)));

    out
}

/// Whether `bytes` looks like binary content (contains a NUL byte in its
/// first 8000 bytes), matching the heuristic ripgrep's `ignore` crate
/// uses to skip binary files during a walk.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8000).any(|b| *b == 0)
}

// ---------------------------------------------------------------------------
// Role assignment
// ---------------------------------------------------------------------------

struct RoleContext {
    orchestration_file: bool,
}

impl RoleContext {
    fn new(elements: &[StructuralElement], imports: &[ImportStatement]) -> Self {
        let entry_points = elements
            .iter()
            .filter(|e| e.kind == StructuralKind::Test || e.name == "main")
            .count();
        let definitions = elements
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    StructuralKind::Class | StructuralKind::Trait | StructuralKind::Impl
                )
            })
            .count();
        // A file dominated by imports and entry points (and not mostly
        // type definitions) reads as a wiring/orchestration file: main
        // entrypoints, CLI dispatch, route registration.
        let orchestration_file = imports.len() >= 3 && entry_points >= 1 && definitions == 0;
        Self { orchestration_file }
    }

    fn role_for(&self, elem: &StructuralElement) -> ChunkRole {
        match elem.kind {
            StructuralKind::Class | StructuralKind::Trait | StructuralKind::Impl => {
                ChunkRole::Definition
            }
            StructuralKind::Const | StructuralKind::TypeDef => ChunkRole::Definition,
            _ if self.orchestration_file => ChunkRole::Orchestration,
            _ => ChunkRole::Implementation,
        }
    }
}

/// Whether `elem`'s line range sits strictly inside another Class/Trait/Impl
/// element in the same file -- used to tell a method apart from a
/// standalone function without re-walking each language's AST.
fn is_nested_in_type(elem: &StructuralElement, elements: &[StructuralElement]) -> bool {
    elements.iter().any(|other| {
        matches!(
            other.kind,
            StructuralKind::Class | StructuralKind::Trait | StructuralKind::Impl
        ) && !std::ptr::eq(other, elem)
            && other.line_start <= elem.line_start
            && elem.line_end <= other.line_end
            && (other.line_start, other.line_end) != (elem.line_start, elem.line_end)
    })
}

fn chunk_kind_for(elem: &StructuralElement, elements: &[StructuralElement]) -> ChunkKind {
    match elem.kind {
        StructuralKind::Function | StructuralKind::Test => {
            if is_nested_in_type(elem, elements) {
                ChunkKind::Method
            } else {
                ChunkKind::Function
            }
        }
        other => other.to_chunk_kind(),
    }
}

// ---------------------------------------------------------------------------
// Element -> chunk(s)
// ---------------------------------------------------------------------------

fn emit_element(
    path: &str,
    hash: &str,
    lines: &[&str],
    elem: &StructuralElement,
    role_ctx: &RoleContext,
    config: &IndexingConfig,
    out: &mut Vec<Chunk>,
) {
    let kind = chunk_kind_for(elem, std::slice::from_ref(elem));
    let role = role_ctx.role_for(elem);
    let symbols = if elem.name.is_empty() {
        BTreeSet::new()
    } else {
        BTreeSet::from([elem.name.clone()])
    };

    let estimated_tokens = estimate_tokens(&elem.content);
    if estimated_tokens <= config.max_chunk_tokens {
        out.push(new_chunk(
            path,
            hash,
            elem.line_start,
            elem.line_end,
            with_breadcrumb(path, kind, &parent_scope(&elem.symbol_path, &elem.name), &elem.content),
            kind,
            role,
            symbols,
            lines,
        ));
        return;
    }

    for (line_start, line_end, text) in split_oversize(&elem.content, elem.line_start, config) {
        out.push(new_chunk(
            path,
            hash,
            line_start,
            line_end,
            with_breadcrumb(path, kind, &parent_scope(&elem.symbol_path, &elem.name), &text),
            kind,
            role,
            symbols.clone(),
            lines,
        ));
    }
}

fn emit_fallback_windows(
    path: &str,
    hash: &str,
    lines: &[&str],
    config: &IndexingConfig,
    out: &mut Vec<Chunk>,
) {
    if lines.is_empty() {
        return;
    }
    let window = config.fallback_window_lines.max(1);
    let overlap = ((window as f64) * config.overlap_fraction).round() as usize;
    let stride = window.saturating_sub(overlap).max(1);

    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + window).min(lines.len());
        let text = lines[start..end].join("\n");
        out.push(new_chunk(
            path,
            hash,
            (start + 1) as u32,
            end as u32,
            with_breadcrumb(path, ChunkKind::Fallback, "", &text),
            ChunkKind::Fallback,
            ChunkRole::Implementation,
            BTreeSet::new(),
            lines,
        ));
        if end == lines.len() {
            break;
        }
        start += stride;
    }
}

fn build_anchor_chunk(
    path: &str,
    hash: &str,
    lines: &[&str],
    imports: &[ImportStatement],
    exported: &BTreeSet<String>,
) -> Chunk {
    let mut text = format!("{path} · anchor\n");
    let header_lines: Vec<&str> = lines
        .iter()
        .take(5)
        .take_while(|l| l.trim_start().starts_with("//") || l.trim_start().starts_with('#'))
        .copied()
        .collect();
    for l in &header_lines {
        text.push_str(l);
        text.push('\n');
    }
    if !imports.is_empty() {
        text.push_str("imports:\n");
        for imp in imports.iter().take(64) {
            text.push_str("  ");
            text.push_str(&imp.import_path);
            text.push('\n');
        }
    }
    if !exported.is_empty() {
        text.push_str("exports:\n");
        for sym in exported.iter().take(256) {
            text.push_str("  ");
            text.push_str(sym);
            text.push('\n');
        }
    }

    Chunk {
        id: Uuid::new_v4(),
        path: path.to_string(),
        hash: hash.to_string(),
        line_start: 1,
        line_end: lines.len().max(1) as u32,
        text,
        context_prev: String::new(),
        context_next: String::new(),
        kind: ChunkKind::Anchor,
        role: ChunkRole::Orchestration,
        defined_symbols: exported.clone(),
        dense: Vec::new(),
        colbert: ColbertGrid::default(),
        pooled_colbert: Vec::new(),
    }
}

fn elements_exported(chunks: &[Chunk]) -> BTreeSet<String> {
    chunks
        .iter()
        .filter(|c| matches!(c.kind, ChunkKind::Function | ChunkKind::Class | ChunkKind::Module))
        .flat_map(|c| c.defined_symbols.iter().cloned())
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn new_chunk(
    path: &str,
    hash: &str,
    line_start: u32,
    line_end: u32,
    text: String,
    kind: ChunkKind,
    role: ChunkRole,
    defined_symbols: BTreeSet<String>,
    lines: &[&str],
) -> Chunk {
    Chunk {
        id: Uuid::new_v4(),
        path: path.to_string(),
        hash: hash.to_string(),
        line_start,
        line_end,
        text,
        context_prev: context_before(lines, line_start),
        context_next: context_after(lines, line_end),
        kind,
        role,
        defined_symbols,
        dense: Vec::new(),
        colbert: ColbertGrid::default(),
        pooled_colbert: Vec::new(),
    }
}

fn context_before(lines: &[&str], line_start: u32) -> String {
    let start_idx = (line_start as usize).saturating_sub(1);
    let from = start_idx.saturating_sub(CONTEXT_LINES);
    if from >= start_idx {
        return String::new();
    }
    lines[from..start_idx].join("\n")
}

fn context_after(lines: &[&str], line_end: u32) -> String {
    let end_idx = line_end as usize; // one-past-the-end, 0-based
    if end_idx >= lines.len() {
        return String::new();
    }
    let to = (end_idx + CONTEXT_LINES).min(lines.len());
    lines[end_idx..to].join("\n")
}

fn parent_scope(symbol_path: &str, name: &str) -> String {
    symbol_path
        .strip_suffix(name)
        .map(|s| s.trim_end_matches(['.', ':', '/']).to_string())
        .unwrap_or_default()
}

fn with_breadcrumb(path: &str, kind: ChunkKind, parent_scope: &str, content: &str) -> String {
    let header = if parent_scope.is_empty() {
        format!("{path} · {}", kind.as_str())
    } else {
        format!("{path} · {} · {parent_scope}", kind.as_str())
    };
    format!("{header}\n{content}")
}

/// Rough token estimate: ~4 characters per token for source code. The
/// worker pool's tokenizer is the ground truth; this is only used to
/// decide whether an element needs splitting before it reaches the pool.
fn estimate_tokens(content: &str) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let estimate = (content.len() / 4) as u32;
    estimate.max(1)
}

/// Split an oversize element's content into overlapping, line-aligned
/// windows. Returns `(line_start, line_end, text)` triples relative to
/// the whole file (`elem_line_start` is the element's first line).
fn split_oversize(
    content: &str,
    elem_line_start: u32,
    config: &IndexingConfig,
) -> Vec<(u32, u32, String)> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return vec![(elem_line_start, elem_line_start, content.to_string())];
    }

    let max_chars = (config.max_chunk_tokens as usize) * 4;
    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let mut end = start;
        let mut char_count = 0usize;
        while end < lines.len() && (char_count == 0 || char_count < max_chars) {
            char_count += lines[end].len() + 1;
            end += 1;
        }
        let text = lines[start..end].join("\n");
        windows.push((
            elem_line_start + start as u32,
            elem_line_start + end as u32 - 1,
            text,
        ));
        if end >= lines.len() {
            break;
        }
        let consumed = end - start;
        let overlap = ((consumed as f64) * config.overlap_fraction).round() as usize;
        start = end.saturating_sub(overlap).max(start + 1);
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> IndexingConfig {
        IndexingConfig::default()
    }

    #[test]
    fn empty_source_yields_no_chunks() {
        assert!(chunk_file("x.rs", "", "h", Language::Rust, &cfg()).is_empty());
    }

    #[test]
    fn unknown_language_falls_back_to_line_windows() {
        let source = (1..=200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let chunks = chunk_file("notes.xyz", &source, "h", Language::Unknown, &cfg());
        assert!(chunks.len() > 1);
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Fallback));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Anchor));
    }

    #[test]
    fn every_chunk_stamps_file_hash() {
        let source = "line one\nline two\n";
        let chunks = chunk_file("a.txt", source, "deadbeef", Language::Text, &cfg());
        assert!(chunks.iter().all(|c| c.hash == "deadbeef"));
    }

    #[test]
    fn context_strings_are_never_null_and_empty_at_edges() {
        let source = "a\nb\nc\n";
        let lines: Vec<&str> = source.lines().collect();
        assert_eq!(context_before(&lines, 1), "");
        assert_eq!(context_after(&lines, 3), "");
    }

    #[test]
    fn rust_file_produces_function_and_anchor_chunks() {
        let source = "use std::fmt;\n\n/// Adds two numbers.\npub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";
        let chunks = chunk_file("src/lib.rs", source, "h", Language::Rust, &cfg());
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Anchor));
        assert!(chunks
            .iter()
            .any(|c| c.kind == ChunkKind::Function && c.defined_symbols.contains("add")));
    }

    #[test]
    fn looks_binary_detects_nul_byte() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"abcdef"));
    }

    #[test]
    fn split_oversize_covers_whole_content_with_overlap() {
        let content = (1..=100).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let mut config = cfg();
        config.max_chunk_tokens = 20; // ~80 chars per window
        let windows = split_oversize(&content, 1, &config);
        assert!(windows.len() > 1);
        // first window starts at the element's first line
        assert_eq!(windows[0].0, 1);
        // last window reaches the element's last line
        assert_eq!(windows.last().unwrap().1, 100);
    }
}
