use tree_sitter::{Language, Node};

use super::{
    field_text, leading_comments, node_text, CallMatch, DefinitionKind, DefinitionMatch,
    LanguageSupport,
};

/// Rust: items, `impl` scopes, `use` declarations, out-of-line `mod`s, calls.
pub struct Rust;

impl LanguageSupport for Rust {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn grammar(&self) -> Language {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn definition(&self, node: Node<'_>, source: &str) -> Option<DefinitionMatch> {
        match node.kind() {
            "function_item" | "function_signature_item" => Some(
                DefinitionMatch::new(DefinitionKind::Function, field_text(node, "name", source)?)
                    .with_parameters(field_text(node, "parameters", source)),
            ),
            "struct_item" | "enum_item" | "trait_item" | "union_item" => Some(
                DefinitionMatch::new(DefinitionKind::Class, field_text(node, "name", source)?),
            ),
            "impl_item" => {
                let ty = field_text(node, "type", source)?;
                Some(DefinitionMatch::new(DefinitionKind::TypeScope, base_type(&ty)))
            }
            "mod_item" if node.child_by_field_name("body").is_some() => Some(
                DefinitionMatch::new(DefinitionKind::Namespace, field_text(node, "name", source)?),
            ),
            _ => None,
        }
    }

    fn imports(&self, node: Node<'_>, source: &str) -> Vec<String> {
        match node.kind() {
            "use_declaration" => field_text(node, "argument", source)
                .map(|arg| vec![use_path(&arg)])
                .unwrap_or_default(),
            // `mod foo;` pulls in a sibling file
            "mod_item" if node.child_by_field_name("body").is_none() => {
                field_text(node, "name", source)
                    .map(|name| vec![format!("self::{}", name)])
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    fn call(&self, node: Node<'_>, source: &str) -> Option<CallMatch> {
        if node.kind() != "call_expression" {
            return None;
        }
        let function = node.child_by_field_name("function")?;
        Some(CallMatch {
            callee: node_text(function, source).to_string(),
            name: callee_name(function, source)?,
        })
    }

    fn docstring(&self, node: Node<'_>, source: &str) -> Option<String> {
        leading_comments(node, source, &["///", "/**"])
    }
}

fn callee_name(function: Node<'_>, source: &str) -> Option<String> {
    match function.kind() {
        "identifier" => Some(node_text(function, source).to_string()),
        "scoped_identifier" => field_text(function, "name", source),
        "field_expression" => field_text(function, "field", source),
        "generic_function" => callee_name(function.child_by_field_name("function")?, source),
        _ => None,
    }
}

/// `Foo<T>` -> `Foo`, `crate::a::Foo` -> `Foo`.
fn base_type(ty: &str) -> String {
    let without_generics = ty.split('<').next().unwrap_or(ty).trim();
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}

/// Module path of a `use` argument, without lists, globs or aliases.
fn use_path(argument: &str) -> String {
    let mut path = argument.trim();
    for marker in ["::{", "::*", " as "] {
        if let Some(idx) = path.find(marker) {
            path = &path[..idx];
        }
    }
    path.trim().to_string()
}
