//! Repository mapping and analysis
//!
//! Orchestrates file discovery, parallel analysis, dependency-graph
//! construction, and the on-disk JSON cache, and applies incremental
//! updates as files change.

use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::analyzer::AstAnalyzer;
use crate::error::{EngineError, Result};
use crate::types::{FileNode, RepositoryMap};

/// Directory/file basename patterns skipped during discovery.
const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "__pycache__",
    "*.pyc",
    "*.pyo",
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "venv",
    ".venv",
    "env",
    ".env",
    "dist",
    "build",
    "target",
    "*.egg-info",
    ".tox",
    ".pytest_cache",
    ".mypy_cache",
    ".idea",
    ".vscode",
    "*.min.js",
    "*.bundle.js",
];

/// Extension -> language tag for analyzable files.
const LANGUAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("rs", "rust"),
    ("java", "java"),
    ("rb", "ruby"),
    ("php", "php"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("hpp", "cpp"),
];

/// Basename stems treated as entry points regardless of extension.
const ENTRY_POINT_STEMS: &[&str] = &["main", "cli", "app", "index", "__main__"];

/// Cache directory name under the repository root.
const CACHE_DIR: &str = ".vibe_cache";

/// Cache artifact file name.
const CACHE_FILE: &str = "repo_map.json";

/// Language tag for a lowercased extension, if analyzable.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    LANGUAGE_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|&(_, lang)| lang)
}

/// Repository statistics summary
#[derive(Debug, Clone, serde::Serialize)]
pub struct MapperStats {
    pub root_path: String,
    pub total_files: u32,
    pub total_lines: u64,
    pub languages: BTreeMap<String, u32>,
    pub entry_points: usize,
    pub test_files: usize,
    pub generated_at: String,
}

/// High-level repository analysis orchestrator.
///
/// Owns the RepositoryMap; other components read through `with_map` /
/// `snapshot` and never hold the lock across their own work.
pub struct RepoMapper {
    root: PathBuf,
    cache_dir: PathBuf,
    ignore_patterns: Vec<glob::Pattern>,
    analyzer: AstAnalyzer,
    map: RwLock<Option<RepositoryMap>>,
}

impl RepoMapper {
    /// Create a mapper rooted at `root` with the default ignore patterns.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_ignore_patterns(root, DEFAULT_IGNORE_PATTERNS)
    }

    /// Create a mapper with custom basename ignore patterns.
    pub fn with_ignore_patterns(root: impl AsRef<Path>, patterns: &[&str]) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|_| EngineError::MissingRoot(root.display().to_string()))?;

        let ignore_patterns = patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        let cache_dir = root.join(CACHE_DIR);
        Ok(Self {
            root,
            cache_dir,
            ignore_patterns,
            analyzer: AstAnalyzer::new(),
            map: RwLock::new(None),
        })
    }

    /// Repository root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` against the current map, if one exists.
    pub fn with_map<R>(&self, f: impl FnOnce(&RepositoryMap) -> R) -> Option<R> {
        self.map.read().ok()?.as_ref().map(f)
    }

    /// Clone of the current map, if one exists.
    pub fn snapshot(&self) -> Option<RepositoryMap> {
        self.map.read().ok()?.clone()
    }

    /// Complete repository scan.
    ///
    /// With `use_cache`, an in-memory map or a parseable on-disk cache is
    /// returned as-is; otherwise the tree is discovered, analyzed in
    /// parallel, and the result is cached before returning.
    pub fn scan(&self, use_cache: bool) -> Result<RepositoryMap> {
        if use_cache {
            if let Some(map) = self.snapshot() {
                return Ok(map);
            }
            if let Some(cached) = self.load_cache() {
                if let Ok(mut guard) = self.map.write() {
                    *guard = Some(cached.clone());
                }
                return Ok(cached);
            }
        }

        let files = self.discover_files();

        // Parallel analysis; failed files are skipped
        let nodes: Vec<FileNode> = files
            .par_iter()
            .filter_map(|(abs, rel, language)| {
                self.analyzer.analyze_file(abs, rel, language).map(|mut node| {
                    node.path = rel.clone();
                    node
                })
            })
            .collect();

        let mut modules = BTreeMap::new();
        for node in nodes {
            modules.insert(node.path.clone(), node);
        }

        let dependency_graph = build_dependency_graph(&modules);
        let entry_points = find_entry_points(&modules);
        let test_files = find_test_files(modules.keys());

        let mut map = RepositoryMap::new(self.root.to_string_lossy().to_string());
        map.modules = modules;
        map.dependency_graph = dependency_graph;
        map.entry_points = entry_points;
        map.test_files = test_files;
        map.refresh_totals();
        map.generated_at = Utc::now().to_rfc3339();

        self.save_cache(&map);

        if let Ok(mut guard) = self.map.write() {
            *guard = Some(map.clone());
        }
        Ok(map)
    }

    /// Find all analyzable files: (absolute path, relative path, language).
    fn discover_files(&self) -> Vec<(PathBuf, String, &'static str)> {
        let patterns = self.ignore_patterns.clone();
        let walker = ignore::WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .filter_entry(move |entry| {
                let name = entry.file_name().to_string_lossy();
                !patterns.iter().any(|pattern| pattern.matches(&name))
            })
            .build();

        let mut files = Vec::new();
        for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let Some(language) = language_for_extension(&ext.to_lowercase()) else {
                continue;
            };
            let rel = match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            files.push((path.to_path_buf(), rel, language));
        }
        files
    }

    /// Compact textual summary of the map within roughly
    /// `max_tokens * 4` characters. Appends `(truncated)` when the budget
    /// runs out.
    pub fn compress(&self, max_tokens: u32) -> String {
        let Some(map) = self.snapshot() else {
            return "Repository not scanned yet.".to_owned();
        };

        let char_budget = max_tokens as usize * 4;
        let mut lines: Vec<String> = Vec::new();

        let name = Path::new(&map.root_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| map.root_path.clone());
        lines.push(format!("PROJECT: {name}"));
        lines.push(format!("FILES: {}", map.total_files));
        lines.push(format!("LINES: {}", map.total_lines));

        let mut langs: Vec<_> = map.languages.iter().collect();
        langs.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        if !langs.is_empty() {
            let top = langs
                .iter()
                .take(3)
                .map(|(lang, count)| format!("{lang}: {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("LANGUAGES: {top}"));
        }

        lines.push(String::new());
        lines.push("STRUCTURE:".to_owned());

        let mut current_chars: usize = lines.iter().map(|l| l.len() + 1).sum();
        let mut truncated = false;

        // Group files by parent directory
        let mut dirs: BTreeMap<String, Vec<&FileNode>> = BTreeMap::new();
        for (path, node) in &map.modules {
            let dir = Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| ".".to_owned());
            dirs.entry(dir).or_default().push(node);
        }

        'outer: for (dir, nodes) in &dirs {
            if current_chars > char_budget {
                truncated = true;
                break;
            }
            let dir_line = format!("  {dir}/");
            current_chars += dir_line.len() + 1;
            lines.push(dir_line);

            for node in nodes {
                if current_chars > char_budget {
                    truncated = true;
                    break 'outer;
                }

                let file_name = Path::new(&node.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| node.path.clone());
                let mut parts = vec![file_name, format!("({} lines)", node.lines_of_code)];
                if !node.functions.is_empty() {
                    parts.push(format!("{} funcs", node.functions.len()));
                }
                if !node.classes.is_empty() {
                    parts.push(format!("{} classes", node.classes.len()));
                }
                let file_line = format!("    {}", parts.join(" "));
                current_chars += file_line.len() + 1;
                lines.push(file_line);

                for func in node.functions.iter().take(3) {
                    if current_chars > char_budget {
                        truncated = true;
                        break 'outer;
                    }
                    let func_line = format!("      - {func}");
                    current_chars += func_line.len() + 1;
                    lines.push(func_line);
                }
                for cls in node.classes.iter().take(3) {
                    if current_chars > char_budget {
                        truncated = true;
                        break 'outer;
                    }
                    let cls_line = format!("      - {cls}");
                    current_chars += cls_line.len() + 1;
                    lines.push(cls_line);
                }
            }
        }

        // External dependencies across the whole map
        if !truncated && current_chars < char_budget {
            let mut all_deps = BTreeSet::new();
            for node in map.modules.values() {
                all_deps.extend(node.dependencies.iter().cloned());
            }
            if !all_deps.is_empty() {
                lines.push(String::new());
                lines.push("DEPENDENCIES:".to_owned());
                for dep in &all_deps {
                    if current_chars > char_budget {
                        truncated = true;
                        break;
                    }
                    let dep_line = format!("  - {dep}");
                    current_chars += dep_line.len() + 1;
                    lines.push(dep_line);
                }
            }
        }

        if !truncated && !map.entry_points.is_empty() && current_chars < char_budget {
            lines.push(String::new());
            lines.push("ENTRY POINTS:".to_owned());
            for ep in map.entry_points.iter().take(5) {
                let ep_line = format!("  - {ep}");
                current_chars += ep_line.len() + 1;
                lines.push(ep_line);
            }
        }

        if truncated {
            lines.push("  ... (truncated)".to_owned());
        }

        lines.join("\n")
    }

    /// Overview of one file: imports, signatures, and dependency
    /// neighbors in both directions, within a soft character budget.
    pub fn context_for_file(&self, file_path: &str, budget_tokens: u32) -> String {
        let Some(map) = self.snapshot() else {
            return String::new();
        };

        let rel_path = self.relative_key(file_path);
        let Some(node) = map.modules.get(&rel_path) else {
            return format!("File not found in repository: {file_path}");
        };

        let char_budget = budget_tokens as usize * 4;
        let mut lines = vec![
            format!("CONTEXT FOR: {rel_path}"),
            String::new(),
            "FILE OVERVIEW:".to_owned(),
            format!("  Language: {}", node.language),
            format!("  Lines: {}", node.lines_of_code),
        ];
        let mut current_chars: usize = lines.iter().map(|l| l.len() + 1).sum();

        if !node.imports.is_empty() {
            lines.push(String::new());
            lines.push("IMPORTS:".to_owned());
            for imp in node.imports.iter().take(10) {
                let line = format!("  - {imp}");
                current_chars += line.len() + 1;
                lines.push(line);
            }
        }

        if !node.functions.is_empty() && current_chars < char_budget {
            lines.push(String::new());
            lines.push("FUNCTIONS:".to_owned());
            for func in &node.functions {
                if current_chars > char_budget {
                    break;
                }
                let line = format!("  - {func}");
                current_chars += line.len() + 1;
                lines.push(line);
                if let Some(ref doc) = func.docstring {
                    let preview: String = doc.chars().take(100).collect();
                    let line = format!("      {}", preview.replace('\n', " "));
                    current_chars += line.len() + 1;
                    lines.push(line);
                }
            }
        }

        if !node.classes.is_empty() && current_chars < char_budget {
            lines.push(String::new());
            lines.push("CLASSES:".to_owned());
            for cls in &node.classes {
                if current_chars > char_budget {
                    break;
                }
                let line = format!("  - {cls}");
                current_chars += line.len() + 1;
                lines.push(line);
                for method in cls.methods.iter().take(5) {
                    let line = format!("      - {method}");
                    current_chars += line.len() + 1;
                    lines.push(line);
                }
            }
        }

        if let Some(deps) = map.dependency_graph.get(&rel_path) {
            if !deps.is_empty() && current_chars < char_budget {
                lines.push(String::new());
                lines.push("DEPENDENCIES:".to_owned());
                for dep in deps {
                    lines.push(format!("  - {dep}"));
                }
            }
        }

        let dependents = map.dependents_of(&rel_path);
        if !dependents.is_empty() && current_chars < char_budget {
            lines.push(String::new());
            lines.push("USED BY:".to_owned());
            for dep in dependents.iter().take(5) {
                lines.push(format!("  - {dep}"));
            }
        }

        lines.join("\n")
    }

    /// Incrementally update the map for one changed path. A vanished path
    /// removes its module; otherwise the file is re-analyzed and its
    /// module entry replaced wholesale.
    pub fn update_on_change(&self, path: &Path) -> Result<()> {
        let Some(rel) = self.try_relative(path) else {
            return Ok(());
        };

        if !path.exists() {
            self.remove_module(&rel);
            return Ok(());
        }

        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Ok(());
        };
        let Some(language) = language_for_extension(&ext.to_lowercase()) else {
            return Ok(());
        };

        let Some(mut node) = self.analyzer.analyze_file(path, &rel, language) else {
            return Ok(());
        };
        node.path = rel.clone();

        if let Ok(mut guard) = self.map.write() {
            if let Some(map) = guard.as_mut() {
                map.modules.insert(rel.clone(), node);

                // Refresh this file's resolved edges against the new module set
                let deps = map
                    .modules
                    .get(&rel)
                    .map(|n| resolve_imports(&n.imports, &map.modules))
                    .unwrap_or_default();
                if deps.is_empty() {
                    map.dependency_graph.remove(&rel);
                } else {
                    map.dependency_graph.insert(rel.clone(), deps);
                }

                map.entry_points = find_entry_points(&map.modules);
                map.test_files = find_test_files(map.modules.keys());
                map.refresh_totals();
                map.generated_at = Utc::now().to_rfc3339();
            }
        }
        Ok(())
    }

    /// Remove a module and every graph edge that mentions it.
    pub fn remove_module(&self, rel_path: &str) {
        if let Ok(mut guard) = self.map.write() {
            if let Some(map) = guard.as_mut() {
                if map.modules.remove(rel_path).is_none() {
                    return;
                }
                map.dependency_graph.remove(rel_path);
                map.dependency_graph.retain(|_, deps| {
                    deps.remove(rel_path);
                    !deps.is_empty()
                });
                map.entry_points.retain(|p| p != rel_path);
                map.test_files.retain(|p| p != rel_path);
                map.refresh_totals();
                map.generated_at = Utc::now().to_rfc3339();
            }
        }
    }

    /// Atomically rename a module key, rewriting graph edges to match.
    pub fn rename_module(&self, old_rel: &str, new_rel: &str) {
        if let Ok(mut guard) = self.map.write() {
            if let Some(map) = guard.as_mut() {
                let Some(mut node) = map.modules.remove(old_rel) else {
                    return;
                };
                node.path = new_rel.to_owned();
                map.modules.insert(new_rel.to_owned(), node);

                if let Some(deps) = map.dependency_graph.remove(old_rel) {
                    map.dependency_graph.insert(new_rel.to_owned(), deps);
                }
                for deps in map.dependency_graph.values_mut() {
                    if deps.remove(old_rel) {
                        deps.insert(new_rel.to_owned());
                    }
                }

                map.entry_points = find_entry_points(&map.modules);
                map.test_files = find_test_files(map.modules.keys());
                map.generated_at = Utc::now().to_rfc3339();
            }
        }
    }

    /// Repository-relative key for an absolute or already-relative path.
    pub fn relative_key(&self, path: &str) -> String {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            self.try_relative(candidate).unwrap_or_else(|| path.replace('\\', "/"))
        } else {
            path.replace('\\', "/")
        }
    }

    fn try_relative(&self, path: &Path) -> Option<String> {
        let direct = path
            .strip_prefix(&self.root)
            .map(|rel| rel.to_string_lossy().replace('\\', "/"));
        if let Ok(rel) = direct {
            return Some(rel);
        }
        // Watcher paths may come through a different symlink prefix
        let canonical = path.canonicalize().ok()?;
        canonical
            .strip_prefix(&self.root)
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .ok()
    }

    fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE)
    }

    fn load_cache(&self) -> Option<RepositoryMap> {
        let cache_file = self.cache_file();
        let content = fs::read_to_string(&cache_file).ok()?;
        match serde_json::from_str(&content) {
            Ok(map) => {
                log::debug!("loaded repository map cache from {}", cache_file.display());
                Some(map)
            }
            Err(err) => {
                log::warn!("ignoring unreadable cache {}: {err}", cache_file.display());
                None
            }
        }
    }

    /// Write-temp-then-rename so a crash never leaves a torn cache.
    fn save_cache(&self, map: &RepositoryMap) {
        if let Err(err) = self.try_save_cache(map) {
            log::warn!("failed to write repository map cache: {err}");
        }
    }

    fn try_save_cache(&self, map: &RepositoryMap) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let json = serde_json::to_string_pretty(map)
            .map_err(|err| EngineError::Cache(err.to_string()))?;
        let tmp = self.cache_dir.join(format!("{CACHE_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.cache_file())?;
        Ok(())
    }

    /// Drop the in-memory map, the analyzer cache, and the cache file.
    pub fn clear_cache(&self) {
        if let Ok(mut guard) = self.map.write() {
            *guard = None;
        }
        self.analyzer.clear_cache();
        let cache_file = self.cache_file();
        if cache_file.exists() {
            if let Err(err) = fs::remove_file(&cache_file) {
                log::warn!("failed to remove cache file: {err}");
            }
        }
    }

    /// Summary statistics, or `None` before the first scan.
    pub fn stats(&self) -> Option<MapperStats> {
        self.with_map(|map| MapperStats {
            root_path: map.root_path.clone(),
            total_files: map.total_files,
            total_lines: map.total_lines,
            languages: map.languages.clone(),
            entry_points: map.entry_points.len(),
            test_files: map.test_files.len(),
            generated_at: map.generated_at.clone(),
        })
    }
}

/// Resolve each module's imports against the module set.
fn build_dependency_graph(
    modules: &BTreeMap<String, FileNode>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut graph = BTreeMap::new();
    for (file_path, node) in modules {
        let deps: BTreeSet<String> = resolve_imports(&node.imports, modules)
            .into_iter()
            .filter(|dep| dep != file_path)
            .collect();
        if !deps.is_empty() {
            graph.insert(file_path.clone(), deps);
        }
    }
    graph
}

fn resolve_imports(
    imports: &[String],
    modules: &BTreeMap<String, FileNode>,
) -> BTreeSet<String> {
    imports
        .iter()
        .filter_map(|imp| resolve_import(imp, modules))
        .collect()
}

/// Resolve a dotted import to an in-repo file by trying the module
/// pattern (`a/b/c.py`) then the package pattern (`a/b/c/__init__.py`).
fn resolve_import(import: &str, modules: &BTreeMap<String, FileNode>) -> Option<String> {
    if import.starts_with('.') {
        // Relative imports are resolved by the reference resolver
        return None;
    }

    let joined = import.split('.').collect::<Vec<_>>().join("/");
    let patterns = [format!("{joined}.py"), format!("{joined}/__init__.py")];

    for pattern in &patterns {
        for file_path in modules.keys() {
            if file_path == pattern || file_path.ends_with(&format!("/{pattern}")) {
                return Some(file_path.clone());
            }
        }
    }
    None
}

/// Entry points: conventional basename stems, or a module-scope `main`.
fn find_entry_points(modules: &BTreeMap<String, FileNode>) -> Vec<String> {
    let mut entry_points = BTreeSet::new();

    for (file_path, node) in modules {
        let stem = Path::new(file_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if ENTRY_POINT_STEMS.contains(&stem.as_str()) {
            entry_points.insert(file_path.clone());
            continue;
        }
        if node.functions.iter().any(|f| f.name == "main") {
            entry_points.insert(file_path.clone());
        }
    }

    entry_points.into_iter().collect()
}

/// Test files: `test_*` / `*_test.<ext>` basenames, or any `test`/`tests`
/// path segment.
fn find_test_files<'a>(paths: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut test_files = BTreeSet::new();

    for path in paths {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let stem_is_test = name.starts_with("test_")
            || Path::new(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().ends_with("_test"))
                .unwrap_or(false);
        let in_test_dir = path
            .split('/')
            .rev()
            .skip(1)
            .any(|segment| segment == "test" || segment == "tests");
        if stem_is_test || in_test_dir {
            test_files.insert(path.clone());
        }
    }

    test_files.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn fixture() -> (TempDir, RepoMapper) {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "main.py", "import utils\n\n\ndef main():\n    utils.helper()\n");
        write(dir.path(), "utils.py", "def helper():\n    pass\n");
        write(dir.path(), "tests/test_utils.py", "def test_helper():\n    pass\n");
        let mapper = RepoMapper::new(dir.path()).unwrap();
        (dir, mapper)
    }

    #[test]
    fn test_scan_builds_graph_and_entry_points() {
        let (_dir, mapper) = fixture();
        let map = mapper.scan(false).unwrap();

        assert_eq!(map.total_files, 3);
        assert_eq!(map.entry_points, vec!["main.py"]);
        assert_eq!(map.test_files, vec!["tests/test_utils.py"]);
        assert_eq!(
            map.dependency_graph.get("main.py"),
            Some(&BTreeSet::from(["utils.py".to_owned()]))
        );
        // Invariants: keyed paths match node paths; totals agree
        for (path, node) in &map.modules {
            assert_eq!(path, &node.path);
        }
        let line_sum: u64 = map.modules.values().map(|n| u64::from(n.lines_of_code)).sum();
        assert_eq!(line_sum, map.total_lines);
    }

    #[test]
    fn test_cache_roundtrip() {
        let (dir, mapper) = fixture();
        let first = mapper.scan(false).unwrap();
        assert!(dir.path().join(".vibe_cache/repo_map.json").exists());

        // A fresh mapper loads the cache instead of rescanning
        let second_mapper = RepoMapper::new(dir.path()).unwrap();
        let second = second_mapper.scan(true).unwrap();
        assert_eq!(first.modules, second.modules);
        assert_eq!(first.dependency_graph, second.dependency_graph);
    }

    #[test]
    fn test_corrupt_cache_forces_rescan() {
        let (dir, mapper) = fixture();
        fs::create_dir_all(dir.path().join(".vibe_cache")).unwrap();
        fs::write(dir.path().join(".vibe_cache/repo_map.json"), "{not json").unwrap();

        let map = mapper.scan(true).unwrap();
        assert_eq!(map.total_files, 3);
    }

    #[test]
    fn test_empty_repository() {
        let dir = TempDir::new().unwrap();
        let mapper = RepoMapper::new(dir.path()).unwrap();
        let map = mapper.scan(false).unwrap();
        assert_eq!(map.total_files, 0);
        assert!(map.dependency_graph.is_empty());
        assert!(map.entry_points.is_empty());
    }

    #[test]
    fn test_missing_root() {
        assert!(matches!(
            RepoMapper::new("/definitely/not/a/real/root"),
            Err(EngineError::MissingRoot(_))
        ));
    }

    #[test]
    fn test_ignored_directories_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "kept.py", "x = 1\n");
        write(dir.path(), "__pycache__/junk.py", "x = 1\n");
        write(dir.path(), "node_modules/pkg/index.js", "var x = 1;\n");
        let mapper = RepoMapper::new(dir.path()).unwrap();
        let map = mapper.scan(false).unwrap();
        assert_eq!(map.modules.keys().collect::<Vec<_>>(), vec!["kept.py"]);
    }

    #[test]
    fn test_update_on_change_replaces_and_removes() {
        let (dir, mapper) = fixture();
        mapper.scan(false).unwrap();

        // Modify: new function appears in the replaced node
        write(dir.path(), "utils.py", "def helper():\n    pass\n\n\ndef extra():\n    pass\n");
        mapper.update_on_change(&dir.path().join("utils.py")).unwrap();
        let map = mapper.snapshot().unwrap();
        assert_eq!(map.modules["utils.py"].functions.len(), 2);

        // Delete: module and inbound edges disappear
        fs::remove_file(dir.path().join("utils.py")).unwrap();
        mapper.update_on_change(&dir.path().join("utils.py")).unwrap();
        let map = mapper.snapshot().unwrap();
        assert!(!map.modules.contains_key("utils.py"));
        assert!(map.dependency_graph.get("main.py").is_none());
        assert_eq!(map.total_files, 2);
    }

    #[test]
    fn test_rename_module_rewrites_edges() {
        let (_dir, mapper) = fixture();
        mapper.scan(false).unwrap();

        mapper.rename_module("utils.py", "helpers.py");
        let map = mapper.snapshot().unwrap();
        assert!(map.modules.contains_key("helpers.py"));
        assert_eq!(map.modules["helpers.py"].path, "helpers.py");
        assert_eq!(
            map.dependency_graph.get("main.py"),
            Some(&BTreeSet::from(["helpers.py".to_owned()]))
        );
    }

    #[test]
    fn test_compress_contains_structure() {
        let (_dir, mapper) = fixture();
        mapper.scan(false).unwrap();
        let compressed = mapper.compress(8000);
        assert!(compressed.contains("PROJECT:"));
        assert!(compressed.contains("STRUCTURE:"));
        assert!(compressed.contains("main.py"));
        assert!(compressed.contains("ENTRY POINTS:"));
    }

    #[test]
    fn test_compress_truncates_under_tiny_budget() {
        let (_dir, mapper) = fixture();
        mapper.scan(false).unwrap();
        let compressed = mapper.compress(10);
        assert!(compressed.contains("(truncated)"));
    }

    #[test]
    fn test_context_for_file() {
        let (_dir, mapper) = fixture();
        mapper.scan(false).unwrap();
        let context = mapper.context_for_file("main.py", 4000);
        assert!(context.contains("CONTEXT FOR: main.py"));
        assert!(context.contains("DEPENDENCIES:"));
        assert!(context.contains("utils.py"));

        let reverse = mapper.context_for_file("utils.py", 4000);
        assert!(reverse.contains("USED BY:"));
        assert!(reverse.contains("main.py"));
    }

    #[test]
    fn test_package_init_resolution() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "app.py", "import pkg\n");
        write(dir.path(), "pkg/__init__.py", "VERSION = 1\n");
        let mapper = RepoMapper::new(dir.path()).unwrap();
        let map = mapper.scan(false).unwrap();
        assert_eq!(
            map.dependency_graph.get("app.py"),
            Some(&BTreeSet::from(["pkg/__init__.py".to_owned()]))
        );
    }
}
