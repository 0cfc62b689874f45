//! Language analyzer registry.
//!
//! Central registration point for all language analyzers. The registry
//! is initialized once at startup and provides thread-safe access to
//! language-specific analyzers.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::LanguageAnalyzer;
use crate::types::Language;

/// Global registry instance.
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Get the global language analyzer registry.
pub fn global_registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Registry of language analyzers.
pub struct Registry {
    analyzers: HashMap<Language, Box<dyn LanguageAnalyzer>>,
}

impl Registry {
    /// Create a new registry with every available analyzer registered.
    fn new() -> Self {
        let mut analyzers: HashMap<Language, Box<dyn LanguageAnalyzer>> = HashMap::new();

        analyzers.insert(Language::Python, Box::new(super::languages::python::PythonAnalyzer));
        analyzers.insert(Language::Rust, Box::new(super::languages::rust::RustAnalyzer));
        analyzers.insert(
            Language::TypeScript,
            Box::new(super::languages::typescript::TypeScriptAnalyzer),
        );
        analyzers.insert(
            Language::JavaScript,
            Box::new(super::languages::javascript::JavaScriptAnalyzer),
        );
        analyzers.insert(Language::Go, Box::new(super::languages::go::GoAnalyzer));
        analyzers.insert(Language::Java, Box::new(super::languages::java::JavaAnalyzer));
        analyzers.insert(Language::C, Box::new(super::languages::c::CAnalyzer));
        analyzers.insert(Language::Cpp, Box::new(super::languages::cpp::CppAnalyzer));
        analyzers.insert(
            Language::CSharp,
            Box::new(super::languages::csharp::CSharpAnalyzer),
        );
        analyzers.insert(Language::Css, Box::new(super::languages::css::CssAnalyzer));
        analyzers.insert(Language::Ruby, Box::new(super::languages::ruby::RubyAnalyzer));
        analyzers.insert(Language::Php, Box::new(super::languages::php::PhpAnalyzer));
        analyzers.insert(Language::Swift, Box::new(super::languages::swift::SwiftAnalyzer));
        analyzers.insert(
            Language::Kotlin,
            Box::new(super::languages::kotlin::KotlinAnalyzer),
        );
        analyzers.insert(
            Language::Markdown,
            Box::new(super::languages::document::DocumentAnalyzer::new(Language::Markdown)),
        );
        analyzers.insert(
            Language::Text,
            Box::new(super::languages::document::DocumentAnalyzer::new(Language::Text)),
        );

        Self { analyzers }
    }

    /// Get the analyzer for a given language.
    pub fn get(&self, language: Language) -> Option<&dyn LanguageAnalyzer> {
        self.analyzers.get(&language).map(|a| a.as_ref())
    }

    /// List all registered languages.
    pub fn languages(&self) -> Vec<Language> {
        self.analyzers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_code_language() {
        let reg = global_registry();
        for lang in [
            Language::Python,
            Language::Rust,
            Language::TypeScript,
            Language::JavaScript,
            Language::Go,
            Language::Java,
            Language::C,
            Language::Cpp,
            Language::CSharp,
            Language::Css,
            Language::Ruby,
            Language::Php,
            Language::Swift,
            Language::Kotlin,
        ] {
            assert!(reg.get(lang).is_some(), "missing analyzer for {lang}");
        }
    }

    #[test]
    fn registry_covers_document_languages() {
        let reg = global_registry();
        assert!(reg.get(Language::Markdown).is_some());
        assert!(reg.get(Language::Text).is_some());
    }

    #[test]
    fn registry_returns_none_for_unknown() {
        let reg = global_registry();
        assert!(reg.get(Language::Unknown).is_none());
    }
}
