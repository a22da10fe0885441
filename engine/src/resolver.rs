//! Cross-file symbol and reference resolution
//!
//! Builds three in-memory indexes over the current repository map: a
//! symbol -> definitions index, a dotted-import -> file map, and a
//! file -> references index. References are import-induced: each resolved
//! import contributes one reference per public symbol of its target,
//! attributed to the importing file.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::mapper::RepoMapper;
use crate::types::{Definition, ReferenceKind, RepositoryMap, SymbolKind, SymbolReference};

/// Index statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolverStats {
    pub total_symbols: usize,
    pub total_definitions: usize,
    pub total_references: usize,
    /// Top-10 most-referenced symbols with their reference counts
    pub most_referenced: Vec<(String, usize)>,
}

#[derive(Default)]
struct Indexes {
    /// symbol -> definitions (methods keyed as `Class.method`)
    symbols: HashMap<String, Vec<Definition>>,
    /// dotted import path -> resolved in-repo file
    imports: HashMap<String, String>,
    /// file -> references induced by its imports
    references: HashMap<String, Vec<SymbolReference>>,
}

/// Resolves symbols and import edges across the repository
pub struct ReferenceResolver {
    mapper: Arc<RepoMapper>,
    indexes: RwLock<Indexes>,
}

impl ReferenceResolver {
    /// Create a resolver reading from `mapper`. Indexes are empty until
    /// `build_indexes` runs.
    pub fn new(mapper: Arc<RepoMapper>) -> Self {
        Self { mapper, indexes: RwLock::new(Indexes::default()) }
    }

    /// Rebuild all three indexes from the current map, scanning first if
    /// the repository has not been mapped yet.
    pub fn build_indexes(&self) -> Result<()> {
        let map = self.mapper.scan(true)?;

        let mut indexes = Indexes::default();

        for (file_path, _) in map.modules.iter() {
            index_definitions(&map, file_path, &mut indexes.symbols);
        }

        for (file_path, node) in map.modules.iter() {
            let from_dir = parent_dir(file_path);
            for import in &node.imports {
                if let Some(resolved) = resolve_import_path(import, &from_dir, &map) {
                    indexes.imports.insert(import.clone(), resolved);
                }
            }
        }

        for file_path in map.modules.keys() {
            let refs = index_references(&map, file_path, &indexes.imports);
            indexes.references.insert(file_path.clone(), refs);
        }

        if let Ok(mut guard) = self.indexes.write() {
            *guard = indexes;
        }
        Ok(())
    }

    /// Patch the indexes for a single changed or removed file. Import
    /// edges and references from other files are left as-is; a full
    /// `build_indexes` refreshes everything.
    pub fn patch_file(&self, rel_path: &str) {
        let map = match self.mapper.snapshot() {
            Some(map) => map,
            None => return,
        };

        if let Ok(mut guard) = self.indexes.write() {
            for definitions in guard.symbols.values_mut() {
                definitions.retain(|def| def.file_path != rel_path);
            }
            guard.symbols.retain(|_, defs| !defs.is_empty());
            guard.references.remove(rel_path);

            if map.modules.contains_key(rel_path) {
                index_definitions(&map, rel_path, &mut guard.symbols);
                let from_dir = parent_dir(rel_path);
                if let Some(node) = map.modules.get(rel_path) {
                    for import in &node.imports {
                        if let Some(resolved) = resolve_import_path(import, &from_dir, &map) {
                            guard.imports.insert(import.clone(), resolved);
                        }
                    }
                }
                let refs = index_references(&map, rel_path, &guard.imports);
                guard.references.insert(rel_path.to_owned(), refs);
            }
        }
    }

    /// Best definition for `symbol`: unique hit, else one in `from_file`,
    /// else one in a module `from_file` imports, else the first. Qualified
    /// names fall back through the class when no direct entry exists.
    pub fn find_definition(&self, symbol: &str, from_file: Option<&str>) -> Option<Definition> {
        let guard = self.indexes.read().ok()?;

        if let Some(definitions) = guard.symbols.get(symbol) {
            if definitions.len() == 1 {
                return definitions.first().cloned();
            }

            if let Some(from_file) = from_file {
                if let Some(def) = definitions.iter().find(|d| d.file_path == from_file) {
                    return Some(def.clone());
                }

                let imported_files: Vec<String> = self
                    .mapper
                    .with_map(|map| {
                        map.modules
                            .get(from_file)
                            .map(|node| {
                                node.imports
                                    .iter()
                                    .filter_map(|imp| guard.imports.get(imp).cloned())
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();

                for resolved in &imported_files {
                    if let Some(def) = definitions.iter().find(|d| &d.file_path == resolved) {
                        return Some(def.clone());
                    }
                }
            }

            return definitions.first().cloned();
        }

        // Qualified name: look for the class, then its method entry
        if let Some((class_name, method_name)) = symbol.split_once('.') {
            let class_defs = guard.symbols.get(class_name)?;
            for def in class_defs {
                if def.kind == SymbolKind::Class {
                    let qualified = format!("{}.{method_name}", def.symbol);
                    if let Some(method_defs) = guard.symbols.get(&qualified) {
                        return method_defs.first().cloned();
                    }
                }
            }
        }

        None
    }

    /// All references whose name equals `symbol` or ends in `.symbol`,
    /// optionally restricted to one file.
    pub fn find_references(&self, symbol: &str, file_path: Option<&str>) -> Vec<SymbolReference> {
        let Ok(guard) = self.indexes.read() else {
            return Vec::new();
        };

        let suffix = format!(".{symbol}");
        let matches = |reference: &SymbolReference| {
            reference.name == symbol || reference.name.ends_with(&suffix)
        };

        match file_path {
            Some(file) => guard
                .references
                .get(file)
                .map(|refs| refs.iter().filter(|r| matches(r)).cloned().collect())
                .unwrap_or_default(),
            None => guard
                .references
                .values()
                .flatten()
                .filter(|r| matches(r))
                .cloned()
                .collect(),
        }
    }

    /// Files `file_path` depends on through resolved imports. With
    /// `include_indirect`, the transitive closure (cycle-safe).
    pub fn get_dependencies(&self, file_path: &str, include_indirect: bool) -> Vec<String> {
        let Ok(guard) = self.indexes.read() else {
            return Vec::new();
        };

        let mut result = HashSet::new();
        let mut visited = HashSet::new();
        self.collect_dependencies(file_path, include_indirect, &guard, &mut visited, &mut result);

        let mut deps: Vec<String> = result.into_iter().collect();
        deps.sort();
        deps
    }

    fn collect_dependencies(
        &self,
        file_path: &str,
        recurse: bool,
        indexes: &Indexes,
        visited: &mut HashSet<String>,
        result: &mut HashSet<String>,
    ) {
        if !visited.insert(file_path.to_owned()) {
            return;
        }

        let imports: Vec<String> = self
            .mapper
            .with_map(|map| {
                map.modules
                    .get(file_path)
                    .map(|node| node.imports.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        for import in &imports {
            if let Some(resolved) = indexes.imports.get(import) {
                if resolved != file_path {
                    result.insert(resolved.clone());
                }
                if recurse {
                    self.collect_dependencies(resolved, true, indexes, visited, result);
                }
            }
        }
    }

    /// Files whose imports resolve to `file_path`.
    pub fn get_dependents(&self, file_path: &str) -> Vec<String> {
        let Ok(guard) = self.indexes.read() else {
            return Vec::new();
        };

        self.mapper
            .with_map(|map| {
                let mut dependents = Vec::new();
                for (other, node) in map.modules.iter() {
                    if other == file_path {
                        continue;
                    }
                    let imports_target = node
                        .imports
                        .iter()
                        .any(|imp| guard.imports.get(imp).map(String::as_str) == Some(file_path));
                    if imports_target {
                        dependents.push(other.clone());
                    }
                }
                dependents
            })
            .unwrap_or_default()
    }

    /// Counts and the top-10 most-referenced symbols.
    pub fn statistics(&self) -> ResolverStats {
        let Ok(guard) = self.indexes.read() else {
            return ResolverStats {
                total_symbols: 0,
                total_definitions: 0,
                total_references: 0,
                most_referenced: Vec::new(),
            };
        };

        let total_definitions = guard.symbols.values().map(Vec::len).sum();
        let total_references = guard.references.values().map(Vec::len).sum();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for reference in guard.references.values().flatten() {
            *counts.entry(reference.name.as_str()).or_insert(0) += 1;
        }
        let mut most_referenced: Vec<(String, usize)> =
            counts.into_iter().map(|(name, count)| (name.to_owned(), count)).collect();
        most_referenced.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_referenced.truncate(10);

        ResolverStats {
            total_symbols: guard.symbols.len(),
            total_definitions,
            total_references,
            most_referenced,
        }
    }
}

fn parent_dir(file_path: &str) -> String {
    Path::new(file_path)
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

fn index_definitions(
    map: &RepositoryMap,
    file_path: &str,
    symbols: &mut HashMap<String, Vec<Definition>>,
) {
    let Some(node) = map.modules.get(file_path) else {
        return;
    };

    for func in &node.functions {
        symbols.entry(func.name.clone()).or_default().push(Definition {
            symbol: func.name.clone(),
            file_path: file_path.to_owned(),
            line: func.line_start,
            column: 0,
            kind: SymbolKind::Function,
            signature: Some(func.to_string()),
            docstring: func.docstring.clone(),
        });
    }

    for cls in &node.classes {
        symbols.entry(cls.name.clone()).or_default().push(Definition {
            symbol: cls.name.clone(),
            file_path: file_path.to_owned(),
            line: cls.line_start,
            column: 0,
            kind: SymbolKind::Class,
            signature: Some(cls.to_string()),
            docstring: cls.docstring.clone(),
        });

        for method in &cls.methods {
            let qualified = format!("{}.{}", cls.name, method.name);
            symbols.entry(qualified.clone()).or_default().push(Definition {
                symbol: qualified,
                file_path: file_path.to_owned(),
                line: method.line_start,
                column: 0,
                kind: SymbolKind::Method,
                signature: Some(method.to_string()),
                docstring: method.docstring.clone(),
            });
        }
    }
}

/// Resolve a dotted import against the module set: module file, package
/// init, and relative forms (each leading dot ascends one directory from
/// the importer).
fn resolve_import_path(import: &str, from_dir: &str, map: &RepositoryMap) -> Option<String> {
    let mut patterns = Vec::new();

    if let Some(stripped) = import.strip_prefix('.') {
        let dots = 1 + stripped.chars().take_while(|c| *c == '.').count();
        let remainder = import.trim_start_matches('.');

        let mut target_dir = from_dir.to_owned();
        for _ in 0..dots {
            target_dir = parent_dir(&target_dir);
        }

        let parts: Vec<&str> = remainder.split('.').filter(|p| !p.is_empty()).collect();
        if let Some((last, intermediate)) = parts.split_last() {
            let mut dir = target_dir;
            for part in intermediate {
                dir = if dir.is_empty() { (*part).to_owned() } else { format!("{dir}/{part}") };
            }
            let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
            patterns.push(format!("{prefix}{last}.py"));
            patterns.push(format!("{prefix}{last}/__init__.py"));
        }
    } else {
        let joined = import.split('.').collect::<Vec<_>>().join("/");
        patterns.push(format!("{joined}.py"));
        patterns.push(format!("{joined}/__init__.py"));
    }

    for pattern in &patterns {
        for file_path in map.modules.keys() {
            if file_path == pattern || file_path.ends_with(&format!("/{pattern}")) {
                return Some(file_path.clone());
            }
        }
    }
    None
}

/// Import-induced references: every public symbol of each resolved
/// import target, attributed to the importing file.
fn index_references(
    map: &RepositoryMap,
    file_path: &str,
    import_map: &HashMap<String, String>,
) -> Vec<SymbolReference> {
    let Some(node) = map.modules.get(file_path) else {
        return Vec::new();
    };

    let mut imported_symbols: Vec<String> = Vec::new();
    let mut seen = HashSet::new();

    for import in &node.imports {
        if let Some(last) = import.rsplit('.').next() {
            if !last.is_empty() && seen.insert(last.to_owned()) {
                imported_symbols.push(last.to_owned());
            }
        }

        if let Some(resolved) = import_map.get(import) {
            if let Some(target) = map.modules.get(resolved) {
                for func in &target.functions {
                    if !func.name.starts_with('_') && seen.insert(func.name.clone()) {
                        imported_symbols.push(func.name.clone());
                    }
                }
                for cls in &target.classes {
                    if !cls.name.starts_with('_') && seen.insert(cls.name.clone()) {
                        imported_symbols.push(cls.name.clone());
                    }
                }
            }
        }
    }

    imported_symbols
        .into_iter()
        .map(|symbol| SymbolReference {
            context: format!("Imported symbol {symbol}"),
            name: symbol,
            file_path: file_path.to_owned(),
            line: 1,
            column: 1,
            kind: ReferenceKind::Import,
            symbol_kind: SymbolKind::Unknown,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn build_fixture(files: &[(&str, &str)]) -> (TempDir, Arc<RepoMapper>, ReferenceResolver) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        mapper.scan(false).unwrap();
        let resolver = ReferenceResolver::new(Arc::clone(&mapper));
        resolver.build_indexes().unwrap();
        (dir, mapper, resolver)
    }

    #[test]
    fn test_find_definition_across_files() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("main.py", "import utils\n\n\ndef main():\n    utils.helper()\n"),
            ("utils.py", "def helper():\n    pass\n"),
        ]);

        let def = resolver.find_definition("helper", None).unwrap();
        assert_eq!(def.file_path, "utils.py");
        assert_eq!(def.line, 1);
        assert_eq!(def.kind, SymbolKind::Function);
    }

    #[test]
    fn test_find_definition_prefers_same_file() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("a.py", "def shared():\n    pass\n"),
            ("b.py", "def shared():\n    return 1\n"),
        ]);

        let def = resolver.find_definition("shared", Some("b.py")).unwrap();
        assert_eq!(def.file_path, "b.py");
    }

    #[test]
    fn test_qualified_method_lookup() {
        let (_dir, _mapper, resolver) = build_fixture(&[(
            "model.py",
            "class Model:\n    def save(self):\n        pass\n",
        )]);

        let def = resolver.find_definition("Model.save", None).unwrap();
        assert_eq!(def.kind, SymbolKind::Method);
        assert_eq!(def.line, 2);
    }

    #[test]
    fn test_references_grow_with_importers() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("utils.py", "def helper():\n    pass\n"),
            ("one.py", "import utils\n"),
        ]);
        let baseline = resolver.find_references("helper", None).len();
        assert!(baseline >= 1);

        let (_dir2, _mapper2, resolver2) = build_fixture(&[
            ("utils.py", "def helper():\n    pass\n"),
            ("one.py", "import utils\n"),
            ("two.py", "import utils\n"),
        ]);
        let more = resolver2.find_references("helper", None).len();
        assert!(more > baseline);

        let scoped = resolver2.find_references("helper", Some("one.py"));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].kind, ReferenceKind::Import);
    }

    #[test]
    fn test_transitive_dependencies() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("a.py", "import b\n"),
            ("b.py", "import c\n"),
            ("c.py", "\n"),
        ]);

        assert_eq!(resolver.get_dependencies("a.py", false), vec!["b.py"]);
        assert_eq!(resolver.get_dependencies("a.py", true), vec!["b.py", "c.py"]);
        assert_eq!(resolver.get_dependents("c.py"), vec!["b.py"]);
    }

    #[test]
    fn test_cyclic_dependencies_terminate() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("a.py", "import b\n"),
            ("b.py", "import a\n"),
        ]);

        let deps = resolver.get_dependencies("a.py", true);
        assert_eq!(deps, vec!["a.py", "b.py"]);
    }

    #[test]
    fn test_relative_import_resolution() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("pkg/__init__.py", "\n"),
            ("pkg/consumer.py", "from . import shared\n"),
            ("shared.py", "def thing():\n    pass\n"),
        ]);

        // One leading dot ascends from pkg/ to the root
        let deps = resolver.get_dependencies("pkg/consumer.py", false);
        assert_eq!(deps, vec!["shared.py"]);
    }

    #[test]
    fn test_missing_symbol_returns_none() {
        let (_dir, _mapper, resolver) = build_fixture(&[("a.py", "X = 1\n")]);
        assert!(resolver.find_definition("missing", None).is_none());
        assert!(resolver.find_references("missing", None).is_empty());
    }

    #[test]
    fn test_statistics() {
        let (_dir, _mapper, resolver) = build_fixture(&[
            ("utils.py", "def helper():\n    pass\n\n\nclass Tool:\n    def run(self):\n        pass\n"),
            ("one.py", "import utils\n"),
            ("two.py", "import utils\n"),
        ]);

        let stats = resolver.statistics();
        // helper, Tool, Tool.run
        assert_eq!(stats.total_symbols, 3);
        assert_eq!(stats.total_definitions, 3);
        assert!(stats.total_references >= 4);
        assert!(stats.most_referenced.iter().any(|(name, count)| name == "helper" && *count == 2));
    }

    #[test]
    fn test_patch_file_after_removal() {
        let (dir, mapper, resolver) = build_fixture(&[
            ("utils.py", "def helper():\n    pass\n"),
            ("one.py", "import utils\n"),
        ]);

        fs::remove_file(dir.path().join("utils.py")).unwrap();
        mapper.update_on_change(&dir.path().join("utils.py")).unwrap();
        resolver.patch_file("utils.py");

        assert!(resolver.find_definition("helper", None).is_none());
    }
}
