use tree_sitter::{Language, Node};

use super::{
    field_text, node_text, unquote, CallMatch, DefinitionKind, DefinitionMatch, LanguageSupport,
};

/// Python: classes, functions, `import` / `from ... import`, calls.
pub struct Python;

impl LanguageSupport for Python {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn grammar(&self) -> Language {
        tree_sitter_python::LANGUAGE.into()
    }

    fn definition(&self, node: Node<'_>, source: &str) -> Option<DefinitionMatch> {
        match node.kind() {
            "function_definition" => Some(
                DefinitionMatch::new(DefinitionKind::Function, field_text(node, "name", source)?)
                    .with_parameters(field_text(node, "parameters", source)),
            ),
            "class_definition" => Some(DefinitionMatch::new(
                DefinitionKind::Class,
                field_text(node, "name", source)?,
            )),
            _ => None,
        }
    }

    fn imports(&self, node: Node<'_>, source: &str) -> Vec<String> {
        match node.kind() {
            "import_statement" => imported_names(node, source),
            "import_from_statement" => {
                let Some(module) = field_text(node, "module_name", source) else {
                    return Vec::new();
                };
                // `from . import x` refers to the sibling module `x`
                if module.chars().all(|c| c == '.') {
                    imported_names(node, source)
                        .into_iter()
                        .map(|name| format!("{}{}", module, name))
                        .collect()
                } else {
                    vec![module]
                }
            }
            _ => Vec::new(),
        }
    }

    fn call(&self, node: Node<'_>, source: &str) -> Option<CallMatch> {
        if node.kind() != "call" {
            return None;
        }
        let function = node.child_by_field_name("function")?;
        let name = match function.kind() {
            "identifier" => node_text(function, source).to_string(),
            "attribute" => field_text(function, "attribute", source)?,
            _ => return None,
        };
        Some(CallMatch {
            callee: node_text(function, source).to_string(),
            name,
        })
    }

    fn docstring(&self, node: Node<'_>, source: &str) -> Option<String> {
        let body = node.child_by_field_name("body")?;
        let first = body.named_child(0)?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let literal = first.named_child(0)?;
        if literal.kind() != "string" {
            return None;
        }
        let doc = unquote(node_text(literal, source)).trim().to_string();
        (!doc.is_empty()).then_some(doc)
    }
}

/// Names listed by an import statement, aliases resolved to the module name.
fn imported_names(node: Node<'_>, source: &str) -> Vec<String> {
    let mut cursor = node.walk();
    node.children_by_field_name("name", &mut cursor)
        .filter_map(|child| match child.kind() {
            "aliased_import" => field_text(child, "name", source),
            _ => Some(node_text(child, source).to_string()),
        })
        .filter(|name| !name.is_empty())
        .collect()
}
