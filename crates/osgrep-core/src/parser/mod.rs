//! AST parsing subsystem using tree-sitter.
//!
//! This module provides language-agnostic AST parsing with per-language
//! structural extractors. Each supported language registers an analyzer
//! that maps tree-sitter AST nodes to structural elements the chunker
//! turns into chunks.
//!
//! ## Architecture
//!
//! ```text
//! Source File -> Language Detection -> tree-sitter Grammar
//!            -> Parse -> CST
//!            -> Structural Extraction -> Vec<StructuralElement>
//! ```
//!
//! The parser is stateless and can be invoked from multiple threads.

pub mod registry;
pub mod languages;

use std::path::Path;

use crate::error::{OsgrepError, OsgrepResult};
use crate::types::{ImportStatement, Language, StructuralKind, Visibility};

/// A structural element extracted from an AST: the chunker's raw
/// material before breadcrumbs, roles, and the persisted `ChunkKind`
/// vocabulary are applied.
#[derive(Debug, Clone)]
pub struct StructuralElement {
    /// Fully qualified symbol path (e.g., `crate::auth::middleware::validate_token`).
    pub symbol_path: String,
    /// Short name (last component of `symbol_path`).
    pub name: String,
    /// What kind of construct this is, in the analyzer's native vocabulary.
    pub kind: StructuralKind,
    /// Visibility specifier.
    pub visibility: Visibility,
    /// Starting line (1-indexed).
    pub line_start: u32,
    /// Ending line (1-indexed, inclusive).
    pub line_end: u32,
    /// Raw source code of this element.
    pub content: String,
    /// Extracted doc comment, if present.
    pub doc_comment: Option<String>,
    /// Symbols referenced within this element (informational; not
    /// currently persisted, kept for the role heuristic).
    pub references: Vec<String>,
}

/// Trait that each language analyzer must implement.
pub trait LanguageAnalyzer: Send + Sync {
    /// Returns the language identifier (e.g., "python", "rust").
    fn language_id(&self) -> &str;

    /// Returns the tree-sitter `Language` for this analyzer.
    fn tree_sitter_language(&self) -> tree_sitter::Language;

    /// Extract structural elements from a parsed tree.
    fn extract_structure(
        &self,
        tree: &tree_sitter::Tree,
        source: &[u8],
        file_path: &Path,
    ) -> Vec<StructuralElement>;

    /// Extract import statements from a parsed tree, for the role-assignment
    /// heuristic. Default implementation returns empty.
    fn extract_imports(
        &self,
        _tree: &tree_sitter::Tree,
        _source: &[u8],
        _file_path: &Path,
    ) -> Vec<ImportStatement> {
        Vec::new()
    }
}

/// Parse a source file and extract its structural elements.
///
/// This is the primary entry point for the parser. It:
/// 1. Looks up the language's analyzer in the registry
/// 2. Loads the appropriate tree-sitter grammar
/// 3. Parses the source code
/// 4. Extracts structural elements via the language analyzer
pub fn parse_file(
    file_path: &Path,
    source: &[u8],
    language: Language,
) -> OsgrepResult<Vec<StructuralElement>> {
    let registry = registry::global_registry();

    let analyzer = registry.get(language).ok_or_else(|| OsgrepError::Parse {
        path: file_path.to_path_buf(),
        message: format!("no analyzer registered for language: {language}"),
    })?;

    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&analyzer.tree_sitter_language())
        .map_err(|e| OsgrepError::Parse {
            path: file_path.to_path_buf(),
            message: format!("failed to set tree-sitter language: {e}"),
        })?;

    let tree = parser.parse(source, None).ok_or_else(|| OsgrepError::Parse {
        path: file_path.to_path_buf(),
        message: "tree-sitter returned None (parse timeout or cancellation)".into(),
    })?;

    if tree.root_node().has_error() && tree.root_node().child_count() == 0 {
        return Err(OsgrepError::Parse {
            path: file_path.to_path_buf(),
            message: "parse produced an empty, all-error tree".into(),
        });
    }

    Ok(analyzer.extract_structure(&tree, source, file_path))
}

/// Extract import statements from a source file, for the role-assignment
/// heuristic. Uses the same tree-sitter parse as `parse_file`.
pub fn parse_imports(
    file_path: &Path,
    source: &[u8],
    language: Language,
) -> OsgrepResult<Vec<ImportStatement>> {
    let registry = registry::global_registry();

    let analyzer = registry.get(language).ok_or_else(|| OsgrepError::Parse {
        path: file_path.to_path_buf(),
        message: format!("no analyzer registered for language: {language}"),
    })?;

    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&analyzer.tree_sitter_language())
        .map_err(|e| OsgrepError::Parse {
            path: file_path.to_path_buf(),
            message: format!("failed to set tree-sitter language: {e}"),
        })?;

    let tree = parser.parse(source, None).ok_or_else(|| OsgrepError::Parse {
        path: file_path.to_path_buf(),
        message: "tree-sitter returned None".into(),
    })?;

    Ok(analyzer.extract_imports(&tree, source, file_path))
}

/// Build a module name (forward-slash separated) from a file path, used
/// as the root of each analyzer's symbol paths. Analyzers that use a
/// different separator (`.`, `::`) replace the slashes themselves.
pub fn build_module_name_from_path(file_path: &Path) -> String {
    file_path
        .with_extension("")
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_language_has_no_analyzer() {
        let result = parse_file(Path::new("test.xyz"), b"hello world", Language::Unknown);
        assert!(result.is_err());
    }
}
