//! Syntax extraction using tree-sitter.
//!
//! Each supported language implements [`LanguageSupport`], a small set of
//! node classifiers (definitions, imports, calls, docstrings). The
//! [`SyntaxExtractor`] owns the registry and runs a single tree walk per file,
//! keeping track of lexical scope so that methods, qualified names and call
//! owners come out consistently for every language.
//!
//! A syntax error never aborts extraction: tree-sitter recovers, and whatever
//! parsed is still reported together with a [`ParseStatus::Partial`] marker.

mod go;
mod javascript;
mod python;
mod rust;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tree_sitter::{Language, Node, Parser};

pub use go::Go;
pub use javascript::{JavaScript, JsDialect};
pub use python::Python;
pub use rust::Rust;

/// Errors that stop extraction of a file altogether.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Failed to load grammar for {language}: {reason}")]
    Grammar { language: String, reason: String },

    #[error("Parser produced no tree for {0}")]
    NoTree(String),
}

/// Kind of a code unit in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Class,
    Function,
    Method,
}

/// Byte range plus 1-based inclusive line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_byte: usize,
    pub end_byte: usize,
    pub line_start: usize,
    pub line_end: usize,
}

impl Span {
    fn of(node: Node<'_>) -> Self {
        Self {
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            line_start: node.start_position().row + 1,
            line_end: node.end_position().row + 1,
        }
    }
}

/// A class, function or method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    /// Scope chain joined with `.`, unique within the file
    pub qualified_name: String,
    pub kind: UnitKind,
    /// Nearest enclosing class-like scope
    pub enclosing_class: Option<String>,
    pub parameters: Option<String>,
    /// Header text up to the body
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub source: String,
    pub span: Span,
}

/// An import / include / use statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRef {
    /// Module or path reference as written (`a.b`, `./x`, `crate::y`)
    pub target: String,
    /// Full statement text
    pub raw: String,
    pub span: Span,
}

/// A call expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    /// Callee text as written (`self.save`, `fmt::format`, `helper`)
    pub callee: String,
    /// Unqualified callee name
    pub name: String,
    /// Qualified name of the innermost enclosing definition
    pub caller: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Complete,
    /// The tree contains error or missing nodes; everything else was extracted
    Partial { error_nodes: usize },
}

/// Everything extracted from one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub language: String,
    pub definitions: Vec<Definition>,
    pub imports: Vec<ImportRef>,
    pub calls: Vec<CallSite>,
    pub status: ParseStatus,
}

impl Extraction {
    pub fn is_partial(&self) -> bool {
        matches!(self.status, ParseStatus::Partial { .. })
    }
}

/// What a node defines, as classified by a language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Class,
    Function,
    /// Class-like scope that is not itself a unit (a Rust `impl` block)
    TypeScope,
    /// Plain namespace scope (an inline module)
    Namespace,
}

#[derive(Debug, Clone)]
pub struct DefinitionMatch {
    pub kind: DefinitionKind,
    pub name: String,
    pub parameters: Option<String>,
    /// Owning type for definitions that live outside their type (Go receivers)
    pub owner: Option<String>,
}

impl DefinitionMatch {
    pub fn new(kind: DefinitionKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parameters: None,
            owner: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Option<String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMatch {
    pub callee: String,
    pub name: String,
}

/// Capabilities a language provides to the extractor.
pub trait LanguageSupport: Send + Sync {
    /// Language identifier stored on source files
    fn name(&self) -> &'static str;

    /// Extensions (without the dot) handled by this language
    fn extensions(&self) -> &'static [&'static str];

    fn grammar(&self) -> Language;

    /// Classify a definition node.
    fn definition(&self, node: Node<'_>, source: &str) -> Option<DefinitionMatch>;

    /// Module / path references introduced by an import node.
    fn imports(&self, node: Node<'_>, source: &str) -> Vec<String>;

    /// Classify a call node.
    fn call(&self, node: Node<'_>, source: &str) -> Option<CallMatch>;

    /// Documentation attached to a definition node.
    fn docstring(&self, node: Node<'_>, source: &str) -> Option<String> {
        leading_comments(node, source, &["///", "/**", "//"])
    }
}

/// Registry of languages keyed by file extension.
pub struct SyntaxExtractor {
    languages: HashMap<&'static str, Arc<dyn LanguageSupport>>,
    by_extension: HashMap<&'static str, &'static str>,
}

impl Default for SyntaxExtractor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SyntaxExtractor {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            languages: HashMap::new(),
            by_extension: HashMap::new(),
        }
    }

    /// Registry with Python, JavaScript, TypeScript, TSX, Rust and Go.
    pub fn with_defaults() -> Self {
        let mut extractor = Self::new();
        extractor.register(Arc::new(Python));
        extractor.register(Arc::new(JavaScript::new(JsDialect::JavaScript)));
        extractor.register(Arc::new(JavaScript::new(JsDialect::TypeScript)));
        extractor.register(Arc::new(JavaScript::new(JsDialect::Tsx)));
        extractor.register(Arc::new(Rust));
        extractor.register(Arc::new(Go));
        extractor
    }

    /// Add a language. Later registrations win for shared extensions.
    pub fn register(&mut self, language: Arc<dyn LanguageSupport>) {
        for ext in language.extensions() {
            self.by_extension.insert(ext, language.name());
        }
        self.languages.insert(language.name(), language);
    }

    /// Language name for a path, from its extension.
    pub fn detect_language(&self, path: &Path) -> Option<&'static str> {
        let ext = path.extension()?.to_str()?;
        self.by_extension.get(ext).copied()
    }

    pub fn supported_extensions(&self) -> Vec<&'static str> {
        let mut exts: Vec<_> = self.by_extension.keys().copied().collect();
        exts.sort_unstable();
        exts
    }

    /// Parse `source` as `language` and extract its entities.
    pub fn extract(&self, source: &str, language: &str) -> Result<Extraction, ExtractError> {
        let support = self
            .languages
            .get(language)
            .ok_or_else(|| ExtractError::UnsupportedLanguage(language.to_string()))?;

        let mut parser = Parser::new();
        parser
            .set_language(&support.grammar())
            .map_err(|e| ExtractError::Grammar {
                language: language.to_string(),
                reason: e.to_string(),
            })?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| ExtractError::NoTree(language.to_string()))?;

        let mut walker = Walker::new(support.as_ref(), source);
        walker.walk(tree.root_node());

        let status = if tree.root_node().has_error() {
            ParseStatus::Partial {
                error_nodes: walker.error_nodes.max(1),
            }
        } else {
            ParseStatus::Complete
        };
        debug!(
            "Extracted {} definitions, {} imports, {} calls ({})",
            walker.definitions.len(),
            walker.imports.len(),
            walker.calls.len(),
            language
        );

        Ok(Extraction {
            language: language.to_string(),
            definitions: walker.definitions,
            imports: walker.imports,
            calls: walker.calls,
            status,
        })
    }
}

struct Frame {
    node_id: usize,
    kind: DefinitionKind,
    name: String,
    /// Qualified name when this scope is itself a unit
    unit: Option<String>,
}

struct Walker<'a> {
    language: &'a dyn LanguageSupport,
    source: &'a str,
    scopes: Vec<Frame>,
    seen: HashMap<String, usize>,
    definitions: Vec<Definition>,
    imports: Vec<ImportRef>,
    calls: Vec<CallSite>,
    error_nodes: usize,
}

impl<'a> Walker<'a> {
    fn new(language: &'a dyn LanguageSupport, source: &'a str) -> Self {
        Self {
            language,
            source,
            scopes: Vec::new(),
            seen: HashMap::new(),
            definitions: Vec::new(),
            imports: Vec::new(),
            calls: Vec::new(),
            error_nodes: 0,
        }
    }

    /// Pre-order walk with an explicit cursor, so deep trees cannot overflow the stack.
    fn walk(&mut self, root: Node<'_>) {
        let mut cursor = root.walk();
        loop {
            self.enter(cursor.node());
            if cursor.goto_first_child() {
                continue;
            }
            loop {
                self.leave(cursor.node());
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return;
                }
            }
        }
    }

    fn enter(&mut self, node: Node<'_>) {
        if node.is_error() || node.is_missing() {
            self.error_nodes += 1;
            return;
        }

        for target in self.language.imports(node, self.source) {
            self.imports.push(ImportRef {
                target,
                raw: node_text(node, self.source).trim().to_string(),
                span: Span::of(node),
            });
        }

        if let Some(call) = self.language.call(node, self.source) {
            let caller = self.scopes.iter().rev().find_map(|f| f.unit.clone());
            self.calls.push(CallSite {
                callee: call.callee,
                name: call.name,
                caller,
                span: Span::of(node),
            });
        }

        if let Some(def) = self.language.definition(node, self.source) {
            self.define(node, def);
        }
    }

    fn leave(&mut self, node: Node<'_>) {
        if self
            .scopes
            .last()
            .is_some_and(|frame| frame.node_id == node.id())
        {
            self.scopes.pop();
        }
    }

    fn define(&mut self, node: Node<'_>, def: DefinitionMatch) {
        let enclosing_class = def.owner.clone().or_else(|| {
            self.scopes
                .iter()
                .rev()
                .find(|f| matches!(f.kind, DefinitionKind::Class | DefinitionKind::TypeScope))
                .map(|f| f.name.clone())
        });

        let mut path: Vec<&str> = self.scopes.iter().map(|f| f.name.as_str()).collect();
        if let Some(owner) = def.owner.as_deref() {
            path.push(owner);
        }
        path.push(&def.name);
        let qualified = path.join(".");

        let unit_kind = match def.kind {
            DefinitionKind::Class => Some(UnitKind::Class),
            DefinitionKind::Function => {
                let in_class = def.owner.is_some()
                    || self.scopes.last().is_some_and(|f| {
                        matches!(f.kind, DefinitionKind::Class | DefinitionKind::TypeScope)
                    });
                Some(if in_class {
                    UnitKind::Method
                } else {
                    UnitKind::Function
                })
            }
            DefinitionKind::TypeScope | DefinitionKind::Namespace => None,
        };

        let unit = unit_kind.map(|kind| {
            let count = self.seen.entry(qualified.clone()).or_insert(0);
            *count += 1;
            let qualified_name = if *count == 1 {
                qualified.clone()
            } else {
                format!("{}#{}", qualified, count)
            };

            self.definitions.push(Definition {
                name: def.name.clone(),
                qualified_name: qualified_name.clone(),
                kind,
                enclosing_class: enclosing_class.clone(),
                parameters: def.parameters.clone(),
                signature: signature(node, self.source),
                docstring: self.language.docstring(node, self.source),
                source: node_text(node, self.source).to_string(),
                span: Span::of(node),
            });
            qualified_name
        });

        self.scopes.push(Frame {
            node_id: node.id(),
            kind: def.kind,
            name: def.name,
            unit,
        });
    }
}

/// Source text of a node; empty if the range does not fall on char boundaries.
pub(crate) fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    source.get(node.byte_range()).unwrap_or("")
}

pub(crate) fn field_text(node: Node<'_>, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| node_text(n, source).to_string())
        .filter(|s| !s.is_empty())
}

/// Header of a definition: everything before its body, or its first line.
fn signature(node: Node<'_>, source: &str) -> Option<String> {
    let text = match node.child_by_field_name("body") {
        Some(body) => source.get(node.start_byte()..body.start_byte())?,
        None => node_text(node, source).lines().next()?,
    };
    let text = text.trim().trim_end_matches(':').trim_end();
    (!text.is_empty()).then(|| text.to_string())
}

/// Strip quotes (and Python string prefixes) from a string literal.
pub(crate) fn unquote(literal: &str) -> String {
    let trimmed = literal
        .trim()
        .trim_start_matches(|c: char| matches!(c, 'r' | 'b' | 'f' | 'u' | 'R' | 'B' | 'F' | 'U'));
    for quote in ["\"\"\"", "'''", "\"", "'", "`"] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

/// Node kinds that wrap a definition and carry its leading comments.
const WRAPPERS: &[&str] = &["export_statement", "decorated_definition", "type_declaration"];

/// Doc comments directly above a definition, oldest line first.
pub(crate) fn leading_comments(node: Node<'_>, source: &str, prefixes: &[&str]) -> Option<String> {
    let anchor = match node.parent() {
        Some(parent) if WRAPPERS.contains(&parent.kind()) => parent,
        _ => node,
    };

    let mut lines = Vec::new();
    let mut expected_row = anchor.start_position().row;
    let mut current = anchor.prev_sibling();
    while let Some(sibling) = current {
        let kind = sibling.kind();
        if kind == "attribute_item" || kind == "decorator" {
            expected_row = sibling.start_position().row;
            current = sibling.prev_sibling();
            continue;
        }
        if !kind.contains("comment") || sibling.end_position().row + 1 < expected_row {
            break;
        }
        let text = node_text(sibling, source).trim();
        let Some(prefix) = prefixes.iter().find(|p| text.starts_with(**p)) else {
            break;
        };
        lines.push(clean_comment(text, prefix));
        expected_row = sibling.start_position().row;
        current = sibling.prev_sibling();
    }

    lines.reverse();
    let doc = lines.join("\n").trim().to_string();
    (!doc.is_empty()).then_some(doc)
}

fn clean_comment(text: &str, prefix: &str) -> String {
    let body = text.strip_prefix(prefix).unwrap_or(text);
    let body = body.strip_suffix("*/").unwrap_or(body);
    body.lines()
        .map(|line| {
            let line = line.trim();
            line.strip_prefix('*').unwrap_or(line).trim()
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language() {
        let extractor = SyntaxExtractor::with_defaults();
        assert_eq!(extractor.detect_language(Path::new("a/b.py")), Some("python"));
        assert_eq!(extractor.detect_language(Path::new("x.rs")), Some("rust"));
        assert_eq!(extractor.detect_language(Path::new("x.jsx")), Some("javascript"));
        assert_eq!(extractor.detect_language(Path::new("x.ts")), Some("typescript"));
        assert_eq!(extractor.detect_language(Path::new("x.tsx")), Some("tsx"));
        assert_eq!(extractor.detect_language(Path::new("x.go")), Some("go"));
        assert_eq!(extractor.detect_language(Path::new("README.md")), None);
        assert_eq!(extractor.detect_language(Path::new("Makefile")), None);
    }

    #[test]
    fn test_unsupported_language() {
        let extractor = SyntaxExtractor::new();
        let err = extractor.extract("x = 1", "python").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedLanguage(_)));
    }

    #[test]
    fn test_partial_parse_keeps_valid_definitions() {
        let extractor = SyntaxExtractor::with_defaults();
        let source = "def good():\n    return 1\n\ndef broken(:\n    pass\n\ndef also_good():\n    return 2\n";
        let extraction = extractor.extract(source, "python").unwrap();

        assert!(extraction.is_partial());
        let names: Vec<_> = extraction.definitions.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"good"));
        assert!(names.contains(&"also_good"));
    }

    #[test]
    fn test_duplicate_qualified_names_are_suffixed() {
        let extractor = SyntaxExtractor::with_defaults();
        let source = "def dup():\n    pass\n\ndef dup():\n    pass\n";
        let extraction = extractor.extract(source, "python").unwrap();
        let qualified: Vec<_> = extraction
            .definitions
            .iter()
            .map(|d| d.qualified_name.as_str())
            .collect();
        assert_eq!(qualified, vec!["dup", "dup#2"]);
    }

    #[test]
    fn test_spans_follow_source_order() {
        let extractor = SyntaxExtractor::with_defaults();
        let source = "import os\n\ndef run():\n    os.getcwd()\n";
        let extraction = extractor.extract(source, "python").unwrap();
        let import = extraction.imports[0].span.start_byte;
        let def = extraction.definitions[0].span.start_byte;
        let call = extraction.calls[0].span.start_byte;
        assert!(import < def && def < call);
        assert_eq!(
            (extraction.imports.len(), extraction.definitions.len(), extraction.calls.len()),
            (1, 1, 1)
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"./utils\""), "./utils");
        assert_eq!(unquote("'x'"), "x");
        assert_eq!(unquote("\"\"\"Doc.\"\"\""), "Doc.");
        assert_eq!(unquote("r'raw'"), "raw");
    }

    #[test]
    fn test_clean_comment() {
        assert_eq!(clean_comment("/// Adds numbers.", "///"), "Adds numbers.");
        assert_eq!(
            clean_comment("/**\n * First.\n * Second.\n */", "/**"),
            "First.\nSecond."
        );
    }
}
