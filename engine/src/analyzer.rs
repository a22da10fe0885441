//! Tree-sitter based analyzer for extracting structure from source files
//!
//! Python files get the full treatment: function and class signatures,
//! docstrings, decorators, flattened imports, cyclomatic complexity, and
//! type-hint coverage. Files in any other supported language produce a
//! line-count-only node.
//!
//! Results are cached per path, keyed by mtime; a cache hit skips the
//! parse entirely.

use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use tree_sitter::{Node, Parser as TSParser};

use crate::types::{ClassSignature, FileNode, FunctionSignature};

/// Standard-library roots stripped from the external dependency set.
const STDLIB_ROOTS: &[&str] = &[
    "abc",
    "ast",
    "asyncio",
    "collections",
    "contextlib",
    "copy",
    "dataclasses",
    "datetime",
    "enum",
    "functools",
    "hashlib",
    "io",
    "itertools",
    "json",
    "logging",
    "math",
    "os",
    "pathlib",
    "pickle",
    "random",
    "re",
    "shutil",
    "string",
    "sys",
    "tempfile",
    "threading",
    "time",
    "typing",
    "unittest",
    "uuid",
    "warnings",
];

// Thread-local parser so rayon workers parse without lock contention
thread_local! {
    static PY_PARSER: RefCell<TSParser> = RefCell::new(new_python_parser());
}

fn new_python_parser() -> TSParser {
    let mut parser = TSParser::new();
    parser
        .set_language(tree_sitter_python::language())
        .expect("load python grammar");
    parser
}

/// Analyzer with a per-path `(mtime, FileNode)` cache
pub struct AstAnalyzer {
    cache: Mutex<HashMap<String, (SystemTime, FileNode)>>,
}

impl Default for AstAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl AstAnalyzer {
    /// Create an analyzer with an empty cache.
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    /// Analyze one file. `rel_path` is the repository-relative key stored
    /// in the resulting node; `language` comes from the extension table.
    ///
    /// Returns `None` when the file is missing, unreadable, or (for the
    /// primary language) fails to parse; callers skip such files.
    pub fn analyze_file(&self, path: &Path, rel_path: &str, language: &str) -> Option<FileNode> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let mtime = metadata.modified().ok()?;

        if let Ok(cache) = self.cache.lock() {
            if let Some((cached_mtime, node)) = cache.get(rel_path) {
                if *cached_mtime == mtime {
                    log::debug!("analyzer cache hit for {rel_path}");
                    return Some(node.clone());
                }
            }
        }

        let node = if language == "python" {
            self.analyze_python(path, rel_path, mtime)?
        } else {
            basic_node(path, rel_path, language, mtime)
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(rel_path.to_owned(), (mtime, node.clone()));
        }
        Some(node)
    }

    fn analyze_python(&self, path: &Path, rel_path: &str, mtime: SystemTime) -> Option<FileNode> {
        let content = fs::read_to_string(path).ok()?;

        let tree = PY_PARSER.with(|parser| parser.borrow_mut().parse(&content, None))?;
        let root = tree.root_node();
        if root.has_error() {
            log::debug!("skipping {rel_path}: parse error");
            return None;
        }

        let source = content.as_bytes();
        let module_path = module_path_for(path);

        let mut functions = Vec::new();
        let mut classes = Vec::new();

        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            match child.kind() {
                "function_definition" => {
                    functions.push(extract_function(child, source, &module_path, rel_path, false, vec![]));
                }
                "class_definition" => {
                    classes.push(extract_class(child, source, &module_path, rel_path, vec![]));
                }
                "decorated_definition" => {
                    let decorators = decorator_names(child, source);
                    if let Some(def) = child.child_by_field_name("definition") {
                        match def.kind() {
                            "function_definition" => functions.push(extract_function(
                                def, source, &module_path, rel_path, false, decorators,
                            )),
                            "class_definition" => classes.push(extract_class(
                                def, source, &module_path, rel_path, decorators,
                            )),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        let imports = extract_imports(root, source);
        let dependencies = external_dependencies(&imports);
        let type_hints_coverage = type_hint_coverage(&functions, &classes);
        let has_docstring = module_docstring(root).is_some();

        Some(FileNode {
            path: rel_path.to_owned(),
            language: "python".to_owned(),
            lines_of_code: content.lines().count() as u32,
            functions,
            classes,
            imports,
            dependencies,
            type_hints_coverage,
            has_docstring,
            last_modified: Some(iso_timestamp(mtime)),
        })
    }

    /// Drop every cached node.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Number of cached files.
    pub fn cache_stats(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

/// Line-count-only node for files outside the primary language.
fn basic_node(path: &Path, rel_path: &str, language: &str, mtime: SystemTime) -> FileNode {
    let lines = fs::read_to_string(path)
        .map(|content| content.lines().count() as u32)
        .unwrap_or(0);

    let mut node = FileNode::basic(rel_path, language);
    node.lines_of_code = lines;
    node.last_modified = Some(iso_timestamp(mtime));
    node
}

fn iso_timestamp(mtime: SystemTime) -> String {
    DateTime::<Utc>::from(mtime).to_rfc3339()
}

/// Dotted module path: walk up while `__init__.py` siblings exist.
fn module_path_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module")
        .to_owned();

    let mut parts = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if !dir.join("__init__.py").exists() {
            break;
        }
        if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
            parts.insert(0, name.to_owned());
        }
        current = dir.parent();
    }
    parts.push(stem);
    parts.join(".")
}

fn node_text<'a>(node: Node<'_>, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn extract_function(
    node: Node<'_>,
    source: &[u8],
    module_path: &str,
    file_path: &str,
    is_method: bool,
    decorators: Vec<String>,
) -> FunctionSignature {
    let name = node
        .child_by_field_name("name")
        .map(|n| node_text(n, source).to_owned())
        .unwrap_or_default();

    let parameters = node
        .child_by_field_name("parameters")
        .map(|params| extract_parameters(params, source))
        .unwrap_or_default();

    let return_type = node
        .child_by_field_name("return_type")
        .map(|n| node_text(n, source).to_owned());

    let body = node.child_by_field_name("body");
    let docstring = body.and_then(|b| block_docstring(b, source));

    // The leading `async` keyword is an anonymous child of the definition
    let is_async = (0..node.child_count())
        .filter_map(|i| node.child(i))
        .any(|child| child.kind() == "async");

    FunctionSignature {
        name,
        module_path: module_path.to_owned(),
        file_path: file_path.to_owned(),
        line_start: node.start_position().row as u32 + 1,
        line_end: node.end_position().row as u32 + 1,
        parameters,
        return_type,
        docstring,
        complexity: cyclomatic_complexity(node),
        is_async,
        is_method,
        decorators,
    }
}

fn extract_class(
    node: Node<'_>,
    source: &[u8],
    module_path: &str,
    file_path: &str,
    decorators: Vec<String>,
) -> ClassSignature {
    let name = node
        .child_by_field_name("name")
        .map(|n| node_text(n, source).to_owned())
        .unwrap_or_default();

    // Superclass list; keyword arguments (metaclass=...) are not bases
    let mut bases = Vec::new();
    if let Some(superclasses) = node.child_by_field_name("superclasses") {
        let mut cursor = superclasses.walk();
        for child in superclasses.named_children(&mut cursor) {
            if child.kind() != "keyword_argument" {
                bases.push(node_text(child, source).to_owned());
            }
        }
    }

    let mut methods = Vec::new();
    let mut attributes = Vec::new();
    let mut docstring = None;

    if let Some(body) = node.child_by_field_name("body") {
        docstring = block_docstring(body, source);

        let mut cursor = body.walk();
        for item in body.named_children(&mut cursor) {
            match item.kind() {
                "function_definition" => {
                    methods.push(extract_function(item, source, module_path, file_path, true, vec![]));
                }
                "decorated_definition" => {
                    let method_decorators = decorator_names(item, source);
                    if let Some(def) = item.child_by_field_name("definition") {
                        if def.kind() == "function_definition" {
                            methods.push(extract_function(
                                def,
                                source,
                                module_path,
                                file_path,
                                true,
                                method_decorators,
                            ));
                        }
                    }
                }
                "expression_statement" => {
                    if let Some(attr) = class_attribute(item, source) {
                        attributes.push(attr);
                    }
                }
                _ => {}
            }
        }
    }

    let is_dataclass = decorators.iter().any(|d| d == "dataclass" || d.ends_with(".dataclass"));

    ClassSignature {
        name,
        module_path: module_path.to_owned(),
        file_path: file_path.to_owned(),
        line_start: node.start_position().row as u32 + 1,
        line_end: node.end_position().row as u32 + 1,
        bases,
        methods,
        attributes,
        docstring,
        decorators,
        is_dataclass,
    }
}

/// Attribute declaration inside a class body: annotated (`x: T = ...`)
/// renders as `x: T`, plain assignment as the bare name.
fn class_attribute(statement: Node<'_>, source: &[u8]) -> Option<String> {
    let assignment = statement.named_child(0)?;
    if assignment.kind() != "assignment" {
        return None;
    }
    let left = assignment.child_by_field_name("left")?;
    if left.kind() != "identifier" {
        return None;
    }
    let name = node_text(left, source);
    match assignment.child_by_field_name("type") {
        Some(ty) => Some(format!("{name}: {}", node_text(ty, source))),
        None => Some(name.to_owned()),
    }
}

/// Parameters rendered as `name` or `name: type`; splat parameters and
/// separators are skipped.
fn extract_parameters(params: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = params.walk();
    for child in params.named_children(&mut cursor) {
        match child.kind() {
            "identifier" => out.push(node_text(child, source).to_owned()),
            "typed_parameter" => {
                let name = child.named_child(0).map(|n| node_text(n, source)).unwrap_or("");
                let ty = child
                    .child_by_field_name("type")
                    .map(|n| node_text(n, source))
                    .unwrap_or("");
                out.push(format!("{name}: {ty}"));
            }
            "default_parameter" => {
                if let Some(name) = child.child_by_field_name("name") {
                    out.push(node_text(name, source).to_owned());
                }
            }
            "typed_default_parameter" => {
                let name = child
                    .child_by_field_name("name")
                    .map(|n| node_text(n, source))
                    .unwrap_or("");
                let ty = child
                    .child_by_field_name("type")
                    .map(|n| node_text(n, source))
                    .unwrap_or("");
                out.push(format!("{name}: {ty}"));
            }
            _ => {}
        }
    }
    out
}

/// Decorator names on a `decorated_definition`: `@name`, `@mod.name`, and
/// call decorators reduced to the callee.
fn decorator_names(decorated: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = decorated.walk();
    for child in decorated.named_children(&mut cursor) {
        if child.kind() == "decorator" {
            let text = node_text(child, source).trim_start_matches('@').trim();
            let name = text.split('(').next().unwrap_or(text).trim();
            names.push(name.to_owned());
        }
    }
    names
}

/// First statement of a block when it is a bare string literal.
fn block_docstring(block: Node<'_>, source: &[u8]) -> Option<String> {
    let first = block.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expr = first.named_child(0)?;
    if expr.kind() != "string" {
        return None;
    }
    let raw = node_text(expr, source);
    let cleaned = raw.trim_matches(|c| c == '"' || c == '\'').trim();
    Some(cleaned.to_owned())
}

/// True iff the module's first statement is a string literal.
fn module_docstring(root: Node<'_>) -> Option<()> {
    let first = root.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expr = first.named_child(0)?;
    (expr.kind() == "string").then_some(())
}

/// Cyclomatic complexity: base 1, +1 per branching construct, +1 per
/// boolean operator (each `and`/`or` beyond the first operand).
fn cyclomatic_complexity(node: Node<'_>) -> u32 {
    1 + count_branches(node)
}

fn count_branches(node: Node<'_>) -> u32 {
    let own = match node.kind() {
        "if_statement" | "elif_clause" | "for_statement" | "while_statement" | "except_clause"
        | "with_statement" | "conditional_expression" | "boolean_operator" | "for_in_clause"
        | "if_clause" => 1,
        _ => 0,
    };

    let mut total = own;
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        total += count_branches(child);
    }
    total
}

/// Flatten every import in the tree into dotted strings. `import a.b`
/// yields `a.b`; `from x import y, z` yields `x.y` and `x.z`; relative
/// imports keep their leading dots.
fn extract_imports(root: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut imports = Vec::new();
    collect_imports(root, source, &mut imports);
    imports
}

fn collect_imports(node: Node<'_>, source: &[u8], out: &mut Vec<String>) {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                match child.kind() {
                    "dotted_name" => out.push(node_text(child, source).to_owned()),
                    "aliased_import" => {
                        if let Some(name) = child.child_by_field_name("name") {
                            out.push(node_text(name, source).to_owned());
                        }
                    }
                    _ => {}
                }
            }
        }
        "import_from_statement" => {
            let module = node
                .child_by_field_name("module_name")
                .map(|n| node_text(n, source).to_owned())
                .unwrap_or_default();

            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                // The module_name field also appears among named children
                if Some(child) == node.child_by_field_name("module_name") {
                    continue;
                }
                let imported = match child.kind() {
                    "dotted_name" => Some(node_text(child, source).to_owned()),
                    "aliased_import" => child
                        .child_by_field_name("name")
                        .map(|n| node_text(n, source).to_owned()),
                    "wildcard_import" => Some("*".to_owned()),
                    _ => None,
                };
                if let Some(name) = imported {
                    if module.is_empty() {
                        out.push(name);
                    } else if module.ends_with('.') {
                        // Pure relative module like `.` or `..`
                        out.push(format!("{module}{name}"));
                    } else {
                        out.push(format!("{module}.{name}"));
                    }
                }
            }
        }
        _ => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_imports(child, source, out);
            }
        }
    }
}

/// External dependency roots: first dotted component, minus the stdlib
/// set, leading-underscore names, and relative imports.
fn external_dependencies(imports: &[String]) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();
    for import in imports {
        if import.starts_with('.') {
            continue;
        }
        let root = import.split('.').next().unwrap_or("");
        if root.is_empty() || root.starts_with('_') || STDLIB_ROOTS.contains(&root) {
            continue;
        }
        deps.insert(root.to_owned());
    }
    deps
}

/// Percentage of functions and methods with a return annotation or at
/// least one annotated parameter; 0 when there are none.
fn type_hint_coverage(functions: &[FunctionSignature], classes: &[ClassSignature]) -> f32 {
    let all = functions
        .iter()
        .chain(classes.iter().flat_map(|cls| cls.methods.iter()));

    let mut total = 0u32;
    let mut typed = 0u32;
    for func in all {
        total += 1;
        if func.return_type.is_some() || func.parameters.iter().any(|p| p.contains(':')) {
            typed += 1;
        }
    }

    if total == 0 {
        return 0.0;
    }
    let pct = typed as f32 / total as f32 * 100.0;
    (pct * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn analyze(content: &str) -> FileNode {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "sample.py", content);
        AstAnalyzer::new()
            .analyze_file(&path, "sample.py", "python")
            .expect("analysis succeeds")
    }

    #[test]
    fn test_function_extraction() {
        let node = analyze(
            r#"
async def fetch(url: str, retries=3) -> bytes:
    """Fetch a URL."""
    return b""


def plain(x):
    return x
"#,
        );

        assert_eq!(node.functions.len(), 2);
        let fetch = &node.functions[0];
        assert_eq!(fetch.name, "fetch");
        assert!(fetch.is_async);
        assert!(!fetch.is_method);
        assert_eq!(fetch.parameters, vec!["url: str", "retries"]);
        assert_eq!(fetch.return_type.as_deref(), Some("bytes"));
        assert_eq!(fetch.docstring.as_deref(), Some("Fetch a URL."));
        assert_eq!(fetch.complexity, 1);

        let plain = &node.functions[1];
        assert!(!plain.is_async);
        assert!(plain.return_type.is_none());
    }

    #[test]
    fn test_class_extraction() {
        let node = analyze(
            r#"
from dataclasses import dataclass


@dataclass
class Config(Base):
    """Runtime settings."""

    name: str
    retries: int = 3
    debug = False

    def validate(self) -> bool:
        return bool(self.name)
"#,
        );

        assert_eq!(node.classes.len(), 1);
        let cls = &node.classes[0];
        assert_eq!(cls.name, "Config");
        assert_eq!(cls.bases, vec!["Base"]);
        assert!(cls.is_dataclass);
        assert_eq!(cls.decorators, vec!["dataclass"]);
        assert_eq!(cls.docstring.as_deref(), Some("Runtime settings."));
        assert_eq!(cls.attributes, vec!["name: str", "retries: int", "debug"]);
        assert_eq!(cls.methods.len(), 1);
        assert!(cls.methods[0].is_method);
        // Methods are not duplicated as top-level functions
        assert!(node.functions.is_empty());
    }

    #[test]
    fn test_import_flattening() {
        let node = analyze(
            r#"
import os
import requests
from pkg.sub import alpha, beta
from . import sibling
from ..common import shared
"#,
        );

        assert_eq!(
            node.imports,
            vec!["os", "requests", "pkg.sub.alpha", "pkg.sub.beta", ".sibling", "..common.shared"]
        );
        // stdlib and relative imports drop out; package roots remain
        assert_eq!(node.dependencies, BTreeSet::from(["requests".to_owned(), "pkg".to_owned()]));
    }

    #[test]
    fn test_complexity() {
        let node = analyze(
            r#"
def branchy(items, flag):
    if flag and items:
        for item in items:
            if item > 0:
                continue
    while False:
        pass
    try:
        pass
    except ValueError:
        pass
    return [x for x in items if x]
"#,
        );

        // 1 base + if + and + for + if + while + except + comprehension
        // for-clause + comprehension if-clause
        assert_eq!(node.functions[0].complexity, 9);
    }

    #[test]
    fn test_type_hint_coverage() {
        let node = analyze(
            r#"
def typed(x: int) -> int:
    return x


def untyped(x):
    return x
"#,
        );
        assert!((node.type_hints_coverage - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_module_docstring_flag() {
        let with_doc = analyze("\"\"\"Module docs.\"\"\"\n\nX = 1\n");
        assert!(with_doc.has_docstring);

        let without = analyze("X = 1\n");
        assert!(!without.has_docstring);
    }

    #[test]
    fn test_syntax_error_returns_none() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "broken.py", "def broken(:\n");
        let analyzer = AstAnalyzer::new();
        assert!(analyzer.analyze_file(&path, "broken.py", "python").is_none());
    }

    #[test]
    fn test_non_python_line_count_only() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "lib.rs", "fn main() {\n    println!(\"hi\");\n}\n");
        let node = AstAnalyzer::new()
            .analyze_file(&path, "lib.rs", "rust")
            .unwrap();
        assert_eq!(node.language, "rust");
        assert_eq!(node.lines_of_code, 3);
        assert!(node.functions.is_empty());
        assert!(node.imports.is_empty());
        assert!(node.last_modified.is_some());
    }

    #[test]
    fn test_cache_hit_on_same_mtime() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "cached.py", "def f():\n    pass\n");
        let analyzer = AstAnalyzer::new();
        let first = analyzer.analyze_file(&path, "cached.py", "python").unwrap();
        let second = analyzer.analyze_file(&path, "cached.py", "python").unwrap();
        assert_eq!(first, second);
        assert_eq!(analyzer.cache_stats(), 1);
        analyzer.clear_cache();
        assert_eq!(analyzer.cache_stats(), 0);
    }
}
