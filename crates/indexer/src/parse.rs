//! tree-sitter extraction of named code units.

use std::path::Path;

use tree_sitter::{Node, Parser};

use calm_schema::{CalmError, Result};

/// Languages the code indexer understands, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    JavaScript,
    Go,
}

impl Language {
    pub fn from_path(path: &Path) -> Option<Language> {
        match path.extension()?.to_str()? {
            "rs" => Some(Language::Rust),
            "py" => Some(Language::Python),
            "ts" | "tsx" => Some(Language::TypeScript),
            "js" | "jsx" | "mjs" => Some(Language::JavaScript),
            "go" => Some(Language::Go),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Go => "go",
        }
    }

    fn grammar(self) -> tree_sitter::Language {
        match self {
            Language::Rust => tree_sitter_rust::LANGUAGE.into(),
            Language::Python => tree_sitter_python::LANGUAGE.into(),
            Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Language::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Language::Go => tree_sitter_go::LANGUAGE.into(),
        }
    }

    /// Node kinds that produce a unit, mapped to the stored `unit_type`.
    fn unit_kind(self, kind: &str) -> Option<&'static str> {
        match (self, kind) {
            (Language::Rust, "function_item") => Some("function"),
            (Language::Rust, "struct_item") => Some("struct"),
            (Language::Rust, "enum_item") => Some("enum"),
            (Language::Rust, "trait_item") => Some("trait"),
            (Language::Python, "function_definition") => Some("function"),
            (Language::Python, "class_definition") => Some("class"),
            (Language::TypeScript | Language::JavaScript, "function_declaration") => {
                Some("function")
            }
            (Language::TypeScript | Language::JavaScript, "method_definition") => Some("method"),
            (Language::TypeScript | Language::JavaScript, "class_declaration") => Some("class"),
            (Language::TypeScript, "interface_declaration") => Some("interface"),
            (Language::Go, "function_declaration") => Some("function"),
            (Language::Go, "method_declaration") => Some("method"),
            (Language::Go, "type_declaration") => Some("type"),
            _ => None,
        }
    }
}

/// One extracted unit: enough payload to search it and jump to it.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub qualified_name: String,
    pub unit_type: String,
    pub signature: String,
    /// 1-based, inclusive.
    pub start_line: u32,
    pub end_line: u32,
    /// Signature plus the head of the body, used as the embedding text.
    pub snippet: String,
}

/// Characters of body kept in the embedding snippet.
const SNIPPET_MAX_CHARS: usize = 600;

pub fn parse_units(language: Language, source: &str) -> Result<Vec<CodeUnit>> {
    let mut parser = Parser::new();
    parser
        .set_language(&language.grammar())
        .map_err(|err| CalmError::Store(format!("loading {} grammar: {err}", language.as_str())))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| CalmError::Store("tree-sitter returned no parse tree".to_string()))?;

    let mut units = Vec::new();
    collect(language, tree.root_node(), source, &mut Vec::new(), &mut units);
    Ok(units)
}

fn collect(
    language: Language,
    node: Node<'_>,
    source: &str,
    scope: &mut Vec<String>,
    out: &mut Vec<CodeUnit>,
) {
    let mut pushed_scope = false;

    if let Some(unit_type) = language.unit_kind(node.kind()) {
        if let Some(name) = node_name(language, node, source) {
            let qualified_name = if scope.is_empty() {
                name.clone()
            } else {
                format!("{}::{}", scope.join("::"), name)
            };
            out.push(build_unit(node, source, qualified_name, unit_type));
            scope.push(name);
            pushed_scope = true;
        }
    } else if let Some(name) = container_name(language, node, source) {
        scope.push(name);
        pushed_scope = true;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect(language, child, source, scope, out);
    }

    if pushed_scope {
        scope.pop();
    }
}

/// Containers that contribute to qualified names without being units
/// themselves: rust `impl`/`mod` blocks.
fn container_name(language: Language, node: Node<'_>, source: &str) -> Option<String> {
    match (language, node.kind()) {
        (Language::Rust, "impl_item") => node
            .child_by_field_name("type")
            .map(|n| node_text(n, source).to_string()),
        (Language::Rust, "mod_item") => node
            .child_by_field_name("name")
            .map(|n| node_text(n, source).to_string()),
        _ => None,
    }
}

fn node_name(language: Language, node: Node<'_>, source: &str) -> Option<String> {
    // Go type_declaration wraps a type_spec that carries the name.
    if language == Language::Go && node.kind() == "type_declaration" {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "type_spec" {
                return child
                    .child_by_field_name("name")
                    .map(|n| node_text(n, source).to_string());
            }
        }
        return None;
    }
    node.child_by_field_name("name")
        .map(|n| node_text(n, source).to_string())
}

fn build_unit(node: Node<'_>, source: &str, qualified_name: String, unit_type: &str) -> CodeUnit {
    let text = node_text(node, source);
    let signature = text
        .lines()
        .next()
        .unwrap_or_default()
        .trim_end_matches('{')
        .trim()
        .to_string();
    let snippet: String = text.chars().take(SNIPPET_MAX_CHARS).collect();
    CodeUnit {
        qualified_name,
        unit_type: unit_type.to_string(),
        signature,
        start_line: node.start_position().row as u32 + 1,
        end_line: node.end_position().row as u32 + 1,
        snippet,
    }
}

fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn rust_units_include_impl_methods_with_qualified_names() -> Result<()> {
        let source = r#"
pub struct Journal {
    path: String,
}

impl Journal {
    pub fn open(path: &str) -> Self {
        Self { path: path.to_string() }
    }
}

fn helper() -> u32 {
    42
}
"#;
        let units = parse_units(Language::Rust, source)?;
        let names: Vec<&str> = units.iter().map(|u| u.qualified_name.as_str()).collect();
        assert!(names.contains(&"Journal"));
        assert!(names.contains(&"Journal::open"));
        assert!(names.contains(&"helper"));

        let open = units.iter().find(|u| u.qualified_name == "Journal::open").unwrap();
        assert_eq!(open.unit_type, "function");
        assert_eq!(open.signature, "pub fn open(path: &str) -> Self");
        assert!(open.start_line > 1);
        assert!(open.end_line > open.start_line);
        Ok(())
    }

    #[test]
    fn python_classes_scope_their_methods() -> Result<()> {
        let source = r#"
class Store:
    def put(self, key, value):
        self.data[key] = value

def main():
    pass
"#;
        let units = parse_units(Language::Python, source)?;
        let names: Vec<&str> = units.iter().map(|u| u.qualified_name.as_str()).collect();
        assert!(names.contains(&"Store"));
        assert!(names.contains(&"Store::put"));
        assert!(names.contains(&"main"));
        Ok(())
    }

    #[test]
    fn go_types_and_methods_are_extracted() -> Result<()> {
        let source = r#"
package main

type Counter struct {
    n int
}

func (c *Counter) Add(delta int) {
    c.n += delta
}

func main() {
}
"#;
        let units = parse_units(Language::Go, source)?;
        let names: Vec<&str> = units.iter().map(|u| u.qualified_name.as_str()).collect();
        assert!(names.contains(&"Counter"));
        assert!(names.contains(&"Add"));
        assert!(names.contains(&"main"));
        Ok(())
    }

    #[test]
    fn languages_resolve_from_extensions() {
        assert_eq!(Language::from_path(Path::new("a/b.rs")), Some(Language::Rust));
        assert_eq!(Language::from_path(Path::new("x.tsx")), Some(Language::TypeScript));
        assert_eq!(Language::from_path(Path::new("x.txt")), None);
        assert_eq!(Language::from_path(Path::new("Makefile")), None);
    }
}
