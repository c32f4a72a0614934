use tree_sitter::{Language, Node};

use super::{
    field_text, leading_comments, node_text, unquote, CallMatch, DefinitionKind, DefinitionMatch,
    LanguageSupport,
};

/// Grammar flavour of the JavaScript family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsDialect {
    JavaScript,
    TypeScript,
    Tsx,
}

/// JavaScript / TypeScript: declarations, class methods, arrow functions
/// bound to a name, ES imports, re-exports and `require` calls.
pub struct JavaScript {
    dialect: JsDialect,
}

impl JavaScript {
    pub fn new(dialect: JsDialect) -> Self {
        Self { dialect }
    }
}

impl LanguageSupport for JavaScript {
    fn name(&self) -> &'static str {
        match self.dialect {
            JsDialect::JavaScript => "javascript",
            JsDialect::TypeScript => "typescript",
            JsDialect::Tsx => "tsx",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self.dialect {
            JsDialect::JavaScript => &["js", "jsx", "mjs", "cjs"],
            JsDialect::TypeScript => &["ts", "mts", "cts"],
            JsDialect::Tsx => &["tsx"],
        }
    }

    fn grammar(&self) -> Language {
        match self.dialect {
            JsDialect::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            JsDialect::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            JsDialect::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }

    fn definition(&self, node: Node<'_>, source: &str) -> Option<DefinitionMatch> {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" | "method_definition" => {
                Some(
                    DefinitionMatch::new(
                        DefinitionKind::Function,
                        field_text(node, "name", source)?,
                    )
                    .with_parameters(field_text(node, "parameters", source)),
                )
            }
            "class_declaration" | "abstract_class_declaration" | "interface_declaration" => Some(
                DefinitionMatch::new(DefinitionKind::Class, field_text(node, "name", source)?),
            ),
            "variable_declarator" => {
                let value = node.child_by_field_name("value")?;
                if !matches!(
                    value.kind(),
                    "arrow_function" | "function_expression" | "function"
                ) {
                    return None;
                }
                let name = node.child_by_field_name("name")?;
                if name.kind() != "identifier" {
                    return None;
                }
                let parameters = field_text(value, "parameters", source)
                    .or_else(|| field_text(value, "parameter", source));
                Some(
                    DefinitionMatch::new(DefinitionKind::Function, node_text(name, source))
                        .with_parameters(parameters),
                )
            }
            _ => None,
        }
    }

    fn imports(&self, node: Node<'_>, source: &str) -> Vec<String> {
        match node.kind() {
            "import_statement" | "export_statement" => field_text(node, "source", source)
                .map(|s| vec![unquote(&s)])
                .unwrap_or_default(),
            "call_expression" => {
                let is_require = node
                    .child_by_field_name("function")
                    .is_some_and(|f| f.kind() == "identifier" && node_text(f, source) == "require");
                if !is_require {
                    return Vec::new();
                }
                node.child_by_field_name("arguments")
                    .and_then(|args| args.named_child(0))
                    .filter(|arg| arg.kind() == "string")
                    .map(|arg| vec![unquote(node_text(arg, source))])
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    fn call(&self, node: Node<'_>, source: &str) -> Option<CallMatch> {
        let target = match node.kind() {
            "call_expression" => node.child_by_field_name("function")?,
            "new_expression" => node.child_by_field_name("constructor")?,
            _ => return None,
        };
        let name = match target.kind() {
            "identifier" => node_text(target, source).to_string(),
            "member_expression" => field_text(target, "property", source)?,
            _ => return None,
        };
        Some(CallMatch {
            callee: node_text(target, source).to_string(),
            name,
        })
    }

    fn docstring(&self, node: Node<'_>, source: &str) -> Option<String> {
        // arrow functions carry their comment on the enclosing declaration
        let anchor = if node.kind() == "variable_declarator" {
            node.parent().unwrap_or(node)
        } else {
            node
        };
        leading_comments(anchor, source, &["/**"])
    }
}
