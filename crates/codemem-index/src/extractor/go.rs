use tree_sitter::{Language, Node};

use super::{
    field_text, leading_comments, node_text, unquote, CallMatch, DefinitionKind, DefinitionMatch,
    LanguageSupport,
};

/// Go: functions, methods (owned by their receiver type), type specs, imports.
pub struct Go;

impl LanguageSupport for Go {
    fn name(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn grammar(&self) -> Language {
        tree_sitter_go::LANGUAGE.into()
    }

    fn definition(&self, node: Node<'_>, source: &str) -> Option<DefinitionMatch> {
        match node.kind() {
            "function_declaration" => Some(
                DefinitionMatch::new(DefinitionKind::Function, field_text(node, "name", source)?)
                    .with_parameters(field_text(node, "parameters", source)),
            ),
            "method_declaration" => Some(
                DefinitionMatch::new(DefinitionKind::Function, field_text(node, "name", source)?)
                    .with_parameters(field_text(node, "parameters", source))
                    .with_owner(receiver_type(node, source)),
            ),
            "type_spec" => Some(DefinitionMatch::new(
                DefinitionKind::Class,
                field_text(node, "name", source)?,
            )),
            _ => None,
        }
    }

    fn imports(&self, node: Node<'_>, source: &str) -> Vec<String> {
        if node.kind() != "import_spec" {
            return Vec::new();
        }
        field_text(node, "path", source)
            .map(|path| vec![unquote(&path)])
            .unwrap_or_default()
    }

    fn call(&self, node: Node<'_>, source: &str) -> Option<CallMatch> {
        if node.kind() != "call_expression" {
            return None;
        }
        let function = node.child_by_field_name("function")?;
        let name = match function.kind() {
            "identifier" => node_text(function, source).to_string(),
            "selector_expression" => field_text(function, "field", source)?,
            _ => return None,
        };
        Some(CallMatch {
            callee: node_text(function, source).to_string(),
            name,
        })
    }

    fn docstring(&self, node: Node<'_>, source: &str) -> Option<String> {
        leading_comments(node, source, &["//"])
    }
}

/// `(p *Point)` -> `Point`
fn receiver_type(node: Node<'_>, source: &str) -> Option<String> {
    let receiver = node.child_by_field_name("receiver")?;
    let param = receiver.named_child(0)?;
    let ty = field_text(param, "type", source)?;
    let ty = ty.trim_start_matches('*');
    let ty = ty.split('[').next().unwrap_or(ty).trim();
    (!ty.is_empty()).then(|| ty.to_string())
}
